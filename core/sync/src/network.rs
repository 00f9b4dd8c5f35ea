//! Network status tracking.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Process-wide connectivity value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Safe to attempt network I/O.
    Online,
    /// Do not attempt network I/O: the device is disconnected or the last
    /// attempt failed, or queued work remains unresolved.
    Offline,
    /// A drain pass is running (or no connectivity report has arrived yet).
    Pending,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
            ConnectivityState::Pending => "pending",
        };
        f.write_str(name)
    }
}

/// One report from the device connectivity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    /// The device has an active network interface.
    pub is_connected: bool,
    /// Optional refinement: whether the internet is actually reachable.
    pub is_internet_reachable: Option<bool>,
}

impl ConnectivityEvent {
    /// Device connected, reachability unknown.
    pub fn connected() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: None,
        }
    }

    /// Device disconnected.
    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: None,
        }
    }

    /// Translate the report to `Online` or `Offline`.
    ///
    /// A connected device whose reachability probe explicitly failed
    /// (captive portal, dead uplink) counts as offline.
    pub fn status(&self) -> ConnectivityState {
        if self.is_connected && self.is_internet_reachable != Some(false) {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

/// Holder of the process-wide `ConnectivityState`.
///
/// Not persisted: every process starts at `Pending` until the first
/// connectivity report arrives. Share it through an `Arc`; observers
/// subscribe to transitions through a watch channel.
pub struct NetworkStatusTracker {
    tx: watch::Sender<ConnectivityState>,
}

impl NetworkStatusTracker {
    /// Create a tracker in the neutral start state (`Pending`).
    pub fn new() -> Self {
        Self::with_state(ConnectivityState::Pending)
    }

    /// Create a tracker with an explicit initial state.
    pub fn with_state(state: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self { tx }
    }

    /// Current state.
    pub fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Assign a new state unconditionally.
    ///
    /// No transition validation happens here; callers must not set
    /// `Pending` unless they are about to run a drain pass.
    pub fn set_status(&self, state: ConnectivityState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!("Connectivity {} -> {}", previous, state);
        }
    }

    /// Move to `Pending` unless already there.
    ///
    /// Returns `true` if the caller now owns the drain pass. The check and
    /// the update happen under the channel's lock, so two concurrent callers
    /// cannot both win.
    pub fn try_begin_pass(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == ConnectivityState::Pending {
                false
            } else {
                debug!("Connectivity {} -> pending (drain pass)", state);
                *state = ConnectivityState::Pending;
                true
            }
        })
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

impl Default for NetworkStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_pending() {
        let tracker = NetworkStatusTracker::new();
        assert_eq!(tracker.current(), ConnectivityState::Pending);
    }

    #[test]
    fn test_set_status_unconditional() {
        let tracker = NetworkStatusTracker::new();
        tracker.set_status(ConnectivityState::Online);
        assert_eq!(tracker.current(), ConnectivityState::Online);
        tracker.set_status(ConnectivityState::Pending);
        assert_eq!(tracker.current(), ConnectivityState::Pending);
    }

    #[test]
    fn test_try_begin_pass_guard() {
        let tracker = NetworkStatusTracker::with_state(ConnectivityState::Offline);
        assert!(tracker.try_begin_pass());
        assert_eq!(tracker.current(), ConnectivityState::Pending);
        assert!(!tracker.try_begin_pass());

        tracker.set_status(ConnectivityState::Online);
        assert!(tracker.try_begin_pass());
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let tracker = NetworkStatusTracker::new();
        let mut rx = tracker.subscribe();

        tracker.set_status(ConnectivityState::Offline);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Offline);

        tracker.set_status(ConnectivityState::Online);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Online);
    }

    #[test]
    fn test_event_translation() {
        assert_eq!(ConnectivityEvent::connected().status(), ConnectivityState::Online);
        assert_eq!(ConnectivityEvent::disconnected().status(), ConnectivityState::Offline);

        let captive = ConnectivityEvent {
            is_connected: true,
            is_internet_reachable: Some(false),
        };
        assert_eq!(captive.status(), ConnectivityState::Offline);

        let odd = ConnectivityEvent {
            is_connected: false,
            is_internet_reachable: Some(true),
        };
        assert_eq!(odd.status(), ConnectivityState::Offline);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectivityState::Pending).unwrap(),
            "\"pending\""
        );
    }
}
