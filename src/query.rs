//! Connection-aware query binding.
//!
//! Inspired by TanStack Query, a `Query<T, P>` adapts the fallback layer to a
//! long-lived consumer such as a view. It owns the loading, error and data
//! state for one logical read and re-runs it when its inputs change, when
//! asked to, or when connectivity comes back while it is showing data that
//! did not come from the live source.
//!
//! # Example
//!
//! ```ignore
//! let client = content.clone();
//! let mut query = Query::new(layer, &connection, service, move |service| {
//!     client.posts_by_service_request(service)
//! })?;
//!
//! // Mount
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.status() {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Ready if query.is_degraded() => render_offline_banner(),
//!     QueryStatus::Errored => render_retry(query.error()),
//!     _ => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{Cacheable, FallbackLayer, FetchRequest, FetchResult, Source};
use crate::connection::{ConnectionState, ConnectionWatcher, Transition};

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Not started, or disabled
  Idle,
  /// A resolution is in flight
  Loading,
  /// The last resolution produced data from some tier
  Ready,
  /// The last resolution found no data in any tier
  Errored,
}

/// Point-in-time copy of a query's state.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
  /// Last data received; kept through later loads and failures
  pub data: Option<T>,
  pub status: QueryStatus,
  pub error: Option<Arc<Report>>,
  pub source: Option<Source>,
  pub last_updated: Option<DateTime<Utc>>,
}

impl<T> QuerySnapshot<T> {
  fn idle() -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      error: None,
      source: None,
      last_updated: None,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Errored
  }
}

type RequestFn<T, P> = Box<dyn Fn(&P) -> Result<FetchRequest<T>> + Send + Sync>;

struct InFlight<T> {
  receiver: oneshot::Receiver<Result<FetchResult<T>>>,
  task: JoinHandle<()>,
}

/// Reactive binding around one fetch configuration.
///
/// At most one resolution is in flight: starting a new one aborts the
/// previous task, so a superseded result can never overwrite newer state.
/// Dropping the query aborts pending work.
pub struct Query<T, P = ()> {
  params: P,
  enabled: bool,
  request: RequestFn<T, P>,
  layer: FallbackLayer,
  connection: ConnectionWatcher,
  state: QuerySnapshot<T>,
  in_flight: Option<InFlight<T>>,
  attempts: u64,
  /// A reconnect arrived while loading; the in-flight resolution was
  /// dispatched before it
  reconnect_pending: bool,
}

impl<T: Cacheable> Query<T, ()> {
  /// Query without parameters.
  pub fn simple<F>(layer: FallbackLayer, connection: &ConnectionState, request: F) -> Result<Self>
  where
    F: Fn() -> Result<FetchRequest<T>> + Send + Sync + 'static,
  {
    Self::new(layer, connection, (), move |_: &()| request())
  }
}

impl<T, P> Query<T, P>
where
  T: Cacheable,
  P: PartialEq + Send + 'static,
{
  /// Create a query. The request factory is called once up front so that a
  /// malformed configuration fails here rather than at first fetch.
  pub fn new<F>(
    layer: FallbackLayer,
    connection: &ConnectionState,
    params: P,
    request: F,
  ) -> Result<Self>
  where
    F: Fn(&P) -> Result<FetchRequest<T>> + Send + Sync + 'static,
  {
    request(&params)?;

    Ok(Self {
      params,
      enabled: true,
      request: Box::new(request),
      layer,
      connection: connection.subscribe(),
      state: QuerySnapshot::idle(),
      in_flight: None,
      attempts: 0,
      reconnect_pending: false,
    })
  }

  /// Start disabled; nothing runs until `set_enabled(true)`.
  pub fn disabled(mut self) -> Self {
    self.enabled = false;
    self
  }

  pub fn status(&self) -> QueryStatus {
    self.state.status
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  /// The error from the last total failure, if the query is errored.
  pub fn error(&self) -> Option<&Report> {
    self.state.error.as_deref()
  }

  pub fn source(&self) -> Option<Source> {
    self.state.source
  }

  pub fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.state.last_updated
  }

  /// True when showing data that did not come from the live source.
  pub fn is_degraded(&self) -> bool {
    matches!(self.state.source, Some(source) if source.is_degraded())
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  pub fn params(&self) -> &P {
    &self.params
  }

  /// Number of resolutions started over the query's lifetime.
  pub fn attempts(&self) -> u64 {
    self.attempts
  }

  pub fn snapshot(&self) -> QuerySnapshot<T> {
    self.state.clone()
  }

  /// Mount: start loading unless disabled or already loading.
  pub fn fetch(&mut self) {
    if !self.enabled || self.state.is_loading() {
      return;
    }
    self.start();
  }

  /// Start a new resolution, superseding any in flight.
  pub fn refetch(&mut self) {
    if !self.enabled {
      return;
    }
    self.start();
  }

  /// Replace the parameters; refetches only if they differ.
  pub fn set_params(&mut self, params: P) {
    if self.params == params {
      return;
    }
    self.params = params;
    self.refetch();
  }

  /// Disabling aborts pending work and holds the query idle. Re-enabling
  /// starts loading.
  pub fn set_enabled(&mut self, enabled: bool) {
    if self.enabled == enabled {
      return;
    }
    self.enabled = enabled;
    if enabled {
      self.start();
    } else {
      self.cancel();
      self.state.status = QueryStatus::Idle;
    }
  }

  /// Feed a connectivity transition. On reconnect, a query that is showing
  /// degraded data or an error re-runs once. Returns whether it did.
  ///
  /// A reconnect seen while loading is remembered: if the in-flight
  /// resolution then lands on a degraded tier or fails, it re-runs once.
  pub fn on_connectivity(&mut self, transition: Transition) -> bool {
    if transition != Transition::Connected || !self.enabled {
      return false;
    }
    let needs_heal = match self.state.status {
      QueryStatus::Errored => true,
      QueryStatus::Ready => self.state.source != Some(Source::Live),
      QueryStatus::Loading => {
        self.reconnect_pending = true;
        return false;
      }
      QueryStatus::Idle => false,
    };
    if !needs_heal {
      return false;
    }

    debug!(source = ?self.state.source, "connectivity restored, refetching");
    self.start();
    true
  }

  /// Apply a finished resolution and any connectivity transition.
  ///
  /// Returns `true` if the state changed. Call this from the consumer's
  /// tick loop.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    let received = self
      .in_flight
      .as_mut()
      .map(|in_flight| in_flight.receiver.try_recv());
    match received {
      Some(Ok(outcome)) => {
        self.in_flight = None;
        self.apply(outcome);
        changed = true;
      }
      Some(Err(oneshot::error::TryRecvError::Closed)) => {
        // Task ended without sending, e.g. it panicked
        self.in_flight = None;
        self.apply(Err(eyre!("Query was cancelled")));
        changed = true;
      }
      Some(Err(oneshot::error::TryRecvError::Empty)) | None => {}
    }

    if let Some(transition) = self.connection.poll_transition() {
      changed |= self.on_connectivity(transition);
    }

    changed
  }

  /// Wait for the in-flight resolution, if any, and apply it. Applying may
  /// start a follow-up resolution when a reconnect arrived meanwhile.
  ///
  /// Returns `false` when nothing was in flight.
  pub async fn wait(&mut self) -> bool {
    let Some(in_flight) = self.in_flight.as_mut() else {
      return false;
    };
    let outcome = (&mut in_flight.receiver).await;
    self.in_flight = None;
    self.apply(outcome.unwrap_or_else(|_| Err(eyre!("Query was cancelled"))));
    true
  }

  fn start(&mut self) {
    self.cancel();

    let request = match (self.request)(&self.params) {
      Ok(request) => request,
      Err(e) => {
        self.apply(Err(e));
        return;
      }
    };

    self.attempts += 1;
    self.state.status = QueryStatus::Loading;
    debug!(attempt = self.attempts, ?request, "starting query resolution");

    let (tx, rx) = oneshot::channel();
    let layer = self.layer.clone();
    let task = tokio::spawn(async move {
      let outcome = layer.resolve(request).await;
      // Receiver is gone if the query was superseded or dropped
      let _ = tx.send(outcome);
    });

    self.in_flight = Some(InFlight { receiver: rx, task });
  }

  fn cancel(&mut self) {
    self.reconnect_pending = false;
    if let Some(in_flight) = self.in_flight.take() {
      in_flight.task.abort();
    }
  }

  fn apply(&mut self, outcome: Result<FetchResult<T>>) {
    match outcome {
      Ok(result) => {
        debug!(source = %result.source, "query resolved");
        self.state.data = Some(result.data);
        self.state.source = Some(result.source);
        self.state.last_updated = Some(result.timestamp);
        self.state.error = None;
        self.state.status = QueryStatus::Ready;
      }
      Err(error) => {
        debug!(error = %error, "query failed in every tier");
        self.state.error = Some(Arc::new(error));
        self.state.status = QueryStatus::Errored;
      }
    }

    if std::mem::take(&mut self.reconnect_pending) && self.enabled {
      let healed =
        self.state.status == QueryStatus::Ready && self.state.source == Some(Source::Live);
      if !healed {
        debug!(source = ?self.state.source, "resolution predates reconnect, refetching");
        self.start();
      }
    }
  }
}

impl<T, P> Drop for Query<T, P> {
  fn drop(&mut self) {
    if let Some(in_flight) = self.in_flight.take() {
      in_flight.task.abort();
    }
  }
}

impl<T: std::fmt::Debug, P: std::fmt::Debug> std::fmt::Debug for Query<T, P> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("params", &self.params)
      .field("enabled", &self.enabled)
      .field("state", &self.state)
      .field("attempts", &self.attempts)
      .finish_non_exhaustive()
  }
}
