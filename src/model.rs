use serde::{Deserialize, Serialize};

use crate::event::{CoreEvent, FailureReason};
use crate::outbox::OpId;

/// How many permanently failed operations the UI keeps around to show.
pub const MAX_FAILED_SHOWN: usize = 50;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FailedOperation {
    pub op_id: OpId,
    pub reason: FailureReason,
}

/// UI-facing projection of the core's event stream.
///
/// The shell folds every [`CoreEvent`] into this value with
/// [`SyncStatus::apply`] and renders from it; nothing here is persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SyncStatus {
    pub online: bool,
    pub pending: usize,
    /// Most recent first.
    pub failed: Vec<FailedOperation>,
    pub session_expired: bool,
    pub last_drained: Option<usize>,
    /// Some queued messages were lost to storage corruption and cannot be
    /// listed individually.
    pub queue_corrupted: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            online: true,
            pending: 0,
            failed: Vec::new(),
            session_expired: false,
            last_drained: None,
            queue_corrupted: false,
        }
    }
}

impl SyncStatus {
    pub fn new(online: bool, pending: usize) -> Self {
        Self {
            online,
            pending,
            ..Self::default()
        }
    }

    /// Returns `true` if the event changed anything worth re-rendering.
    pub fn apply(&mut self, event: &CoreEvent) -> bool {
        let before = self.clone();
        match event {
            CoreEvent::Queued { pending, .. } => {
                self.pending = *pending;
                self.session_expired = false;
            }
            CoreEvent::Delivered { pending, .. } => self.pending = *pending,
            CoreEvent::PermanentlyFailed { op_id, reason } => {
                self.pending = self.pending.saturating_sub(1);
                self.failed.retain(|f| &f.op_id != op_id);
                self.failed.insert(
                    0,
                    FailedOperation {
                        op_id: op_id.clone(),
                        reason: reason.clone(),
                    },
                );
                self.failed.truncate(MAX_FAILED_SHOWN);
            }
            CoreEvent::QueueDrained { delivered } => {
                self.pending = 0;
                self.last_drained = Some(*delivered);
            }
            CoreEvent::SessionExpired => {
                self.pending = 0;
                self.session_expired = true;
            }
            CoreEvent::ConnectivityChanged { online } => self.online = *online,
            CoreEvent::QueueCorrupted { .. } => self.queue_corrupted = true,
        }
        *self != before
    }

    pub fn dismiss_failure(&mut self, op_id: &OpId) -> bool {
        let before = self.failed.len();
        self.failed.retain(|f| &f.op_id != op_id);
        self.failed.len() != before
    }

    pub fn has_pending(&self) -> bool {
        self.pending > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> OpId {
        OpId::new(s).unwrap()
    }

    #[test]
    fn test_offline_message_lifecycle() {
        let mut status = SyncStatus::new(true, 0);

        assert!(status.apply(&CoreEvent::ConnectivityChanged { online: false }));
        assert!(status.apply(&CoreEvent::Queued {
            op_id: id("hello"),
            pending: 1
        }));
        assert!(!status.online);
        assert!(status.has_pending());

        status.apply(&CoreEvent::ConnectivityChanged { online: true });
        status.apply(&CoreEvent::Delivered {
            op_id: id("hello"),
            pending: 0,
        });
        status.apply(&CoreEvent::QueueDrained { delivered: 1 });

        assert_eq!(
            status,
            SyncStatus {
                online: true,
                pending: 0,
                failed: Vec::new(),
                session_expired: false,
                last_drained: Some(1),
                queue_corrupted: false,
            }
        );
    }

    #[test]
    fn test_failures_are_listed_newest_first_without_duplicates() {
        let mut status = SyncStatus::new(true, 3);
        for op in ["a", "b", "a"] {
            status.apply(&CoreEvent::PermanentlyFailed {
                op_id: id(op),
                reason: FailureReason::MaxRetriesExceeded { attempts: 5 },
            });
        }

        let ids: Vec<&str> = status.failed.iter().map(|f| f.op_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(status.pending, 0);

        assert!(status.dismiss_failure(&id("b")));
        assert!(!status.dismiss_failure(&id("b")));
        assert_eq!(status.failed.len(), 1);
    }

    #[test]
    fn test_failed_list_is_bounded() {
        let mut status = SyncStatus::default();
        for i in 0..MAX_FAILED_SHOWN + 10 {
            status.apply(&CoreEvent::PermanentlyFailed {
                op_id: id(&format!("op-{i}")),
                reason: FailureReason::SessionEnded,
            });
        }
        assert_eq!(status.failed.len(), MAX_FAILED_SHOWN);
        assert_eq!(
            status.failed[0].op_id.as_str(),
            format!("op-{}", MAX_FAILED_SHOWN + 9)
        );
    }

    #[test]
    fn test_session_expiry_then_new_activity() {
        let mut status = SyncStatus::new(true, 2);
        status.apply(&CoreEvent::SessionExpired);
        assert!(status.session_expired);
        assert_eq!(status.pending, 0);

        status.apply(&CoreEvent::Queued {
            op_id: id("x"),
            pending: 1,
        });
        assert!(!status.session_expired);
    }

    #[test]
    fn test_repeated_connectivity_is_not_a_change() {
        let mut status = SyncStatus::default();
        assert!(!status.apply(&CoreEvent::ConnectivityChanged { online: true }));
    }

    #[test]
    fn test_corruption_is_flagged_and_listed() {
        let mut status = SyncStatus::new(true, 2);

        assert!(status.apply(&CoreEvent::PermanentlyFailed {
            op_id: id("scrambled"),
            reason: FailureReason::Corrupted {
                detail: "invalid json".into(),
            },
        }));
        assert_eq!(status.pending, 1);
        assert_eq!(status.failed[0].op_id, id("scrambled"));
        assert!(!status.queue_corrupted);

        assert!(status.apply(&CoreEvent::QueueCorrupted {
            reason: "integrity check failed".into(),
        }));
        assert!(status.queue_corrupted);
    }
}
