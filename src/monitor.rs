//! Connectivity monitor: probes the live backend and drives `ConnectionState`.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::connection::ConnectionState;

/// Handle to a running monitor. Dropping it stops probing.
pub struct ConnectivityMonitor {
  task: JoinHandle<()>,
}

impl ConnectivityMonitor {
  /// Probe every `interval`, the first time immediately. A probe that errors
  /// or runs past `timeout` marks the backend disconnected.
  pub fn spawn<F, Fut>(
    state: Arc<ConnectionState>,
    interval: Duration,
    timeout: Duration,
    probe: F,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let task = tokio::spawn(async move {
      info!(?interval, "connectivity monitor started");
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;

        let healthy = match tokio::time::timeout(timeout, probe()).await {
          Ok(Ok(())) => true,
          Ok(Err(e)) => {
            debug!(error = %e, "health probe failed");
            false
          }
          Err(_) => {
            debug!(?timeout, "health probe timed out");
            false
          }
        };
        state.set_connected(healthy);
      }
    });

    Self { task }
  }

  pub fn is_running(&self) -> bool {
    !self.task.is_finished()
  }
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    self.task.abort();
  }
}
