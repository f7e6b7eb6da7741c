//! Process-wide connectivity signal.
//!
//! One `ConnectionState` exists per process and is passed by reference to
//! whatever needs it. The connectivity monitor is the only writer; query
//! bindings hold read-only `ConnectionWatcher`s.

use tokio::sync::watch;
use tracing::info;

/// A change of connectivity observed by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  /// The backend became reachable
  Connected,
  /// The backend became unreachable
  Disconnected,
}

impl Transition {
  fn from_connected(connected: bool) -> Self {
    if connected {
      Transition::Connected
    } else {
      Transition::Disconnected
    }
  }
}

/// Shared connected/disconnected flag with change notification.
#[derive(Debug)]
pub struct ConnectionState {
  tx: watch::Sender<bool>,
}

impl ConnectionState {
  /// Start optimistically connected.
  pub fn new() -> Self {
    Self::with_initial(true)
  }

  pub fn with_initial(connected: bool) -> Self {
    let (tx, _rx) = watch::channel(connected);
    Self { tx }
  }

  pub fn is_connected(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current connectivity. Returns true if this was a transition;
  /// watchers are only notified on transitions.
  pub fn set_connected(&self, connected: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == connected {
        false
      } else {
        *current = connected;
        true
      }
    });
    if changed {
      info!(connected, "connectivity changed");
    }
    changed
  }

  /// Subscribe to transitions. Dropping the watcher unsubscribes.
  pub fn subscribe(&self) -> ConnectionWatcher {
    ConnectionWatcher {
      rx: self.tx.subscribe(),
    }
  }

  pub fn watcher_count(&self) -> usize {
    self.tx.receiver_count()
  }
}

impl Default for ConnectionState {
  fn default() -> Self {
    Self::new()
  }
}

/// Read-only view of the connectivity signal.
#[derive(Debug, Clone)]
pub struct ConnectionWatcher {
  rx: watch::Receiver<bool>,
}

impl ConnectionWatcher {
  pub fn is_connected(&self) -> bool {
    *self.rx.borrow()
  }

  /// Take the pending transition, if any, without waiting.
  ///
  /// Several flips between two calls collapse into one transition to the
  /// current value. A down-then-up sequence therefore still reports
  /// `Connected` even though the value is unchanged since the last call.
  pub fn poll_transition(&mut self) -> Option<Transition> {
    match self.rx.has_changed() {
      Ok(true) => Some(Transition::from_connected(*self.rx.borrow_and_update())),
      _ => None,
    }
  }

  /// Wait for the next transition. Returns `None` once the state is gone.
  pub async fn next_transition(&mut self) -> Option<Transition> {
    self.rx.changed().await.ok()?;
    Some(Transition::from_connected(*self.rx.borrow_and_update()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_starts_connected() {
    assert!(ConnectionState::new().is_connected());
    assert!(!ConnectionState::with_initial(false).is_connected());
  }

  #[test]
  fn test_set_connected_reports_transitions_only() {
    let state = ConnectionState::new();
    assert!(!state.set_connected(true));
    assert!(state.set_connected(false));
    assert!(!state.set_connected(false));
    assert!(state.set_connected(true));
  }

  #[test]
  fn test_watcher_sees_transition_once() {
    let state = ConnectionState::new();
    let mut watcher = state.subscribe();
    assert_eq!(watcher.poll_transition(), None);

    state.set_connected(false);
    assert_eq!(watcher.poll_transition(), Some(Transition::Disconnected));
    assert_eq!(watcher.poll_transition(), None);
    assert!(!watcher.is_connected());
  }

  #[test]
  fn test_down_up_between_polls_reports_connected() {
    let state = ConnectionState::new();
    let mut watcher = state.subscribe();
    state.set_connected(false);
    state.set_connected(true);
    assert_eq!(watcher.poll_transition(), Some(Transition::Connected));
  }

  #[test]
  fn test_dropping_watcher_unsubscribes() {
    let state = ConnectionState::new();
    let watcher = state.subscribe();
    assert_eq!(state.watcher_count(), 1);
    drop(watcher);
    assert_eq!(state.watcher_count(), 0);
  }

  #[tokio::test]
  async fn test_next_transition_waits() {
    let state = std::sync::Arc::new(ConnectionState::with_initial(false));
    let mut watcher = state.subscribe();

    let writer = state.clone();
    tokio::spawn(async move {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      writer.set_connected(true);
    });

    assert_eq!(watcher.next_transition().await, Some(Transition::Connected));
  }
}
