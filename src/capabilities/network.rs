//! Connectivity capability.
//!
//! The host pushes platform reachability changes in with
//! [`ConnectivityMonitor::set_online`]; the core reads the current state
//! synchronously and subscribes to transitions.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Records the platform's reachability. Returns `true` when this was a
    /// transition; repeated reports of the same state are ignored.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "connectivity transition");
        }
        changed
    }

    pub fn subscribe(&self) -> ConnectivityEvents {
        ConnectivityEvents {
            rx: self.state.subscribe(),
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Stream of transitions observed after the subscription was created.
///
/// Rapid flapping is coalesced: a subscriber that falls behind sees the
/// latest state once, which is all a drain trigger needs.
#[derive(Debug)]
pub struct ConnectivityEvents {
    rx: watch::Receiver<bool>,
}

impl ConnectivityEvents {
    /// Waits for the next change. `None` once every monitor handle is gone.
    pub async fn next(&mut self) -> Option<Transition> {
        self.rx.changed().await.ok()?;
        let online = *self.rx.borrow_and_update();
        Some(if online {
            Transition::Online
        } else {
            Transition::Offline
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_online_reports_transitions_only() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.is_online());

        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());

        assert!(monitor.set_online(false));
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_subscriber_sees_transitions() {
        let monitor = ConnectivityMonitor::new(false);
        let mut events = monitor.subscribe();

        monitor.set_online(true);
        assert_eq!(events.next().await, Some(Transition::Online));

        monitor.set_online(false);
        assert_eq!(events.next().await, Some(Transition::Offline));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let monitor = ConnectivityMonitor::new(true);
        let other = monitor.clone();

        other.set_online(false);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_stream_ends_when_monitor_dropped() {
        let monitor = ConnectivityMonitor::new(true);
        let mut events = monitor.subscribe();
        drop(monitor);
        assert_eq!(events.next().await, None);
    }
}
