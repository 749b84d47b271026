use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

use crate::outbox::OpId;

/// Why a queued operation was dropped without being delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The server answered with a non-retryable status. `message` is the
    /// server's own text where it provided one.
    Rejected { status: u16, message: String },
    MaxRetriesExceeded { attempts: u32 },
    /// The session the operation was queued under ended before delivery.
    SessionEnded,
    /// The persisted entry could not be decoded after a restart.
    Corrupted { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { status, message } => write!(f, "rejected ({status}): {message}"),
            Self::MaxRetriesExceeded { attempts } => {
                write!(f, "gave up after {attempts} attempts")
            }
            Self::SessionEnded => f.write_str("session ended"),
            Self::Corrupted { detail } => write!(f, "unreadable after restart: {detail}"),
        }
    }
}

/// Notifications published by the core for the UI layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    Queued { op_id: OpId, pending: usize },
    Delivered { op_id: OpId, pending: usize },
    PermanentlyFailed { op_id: OpId, reason: FailureReason },
    QueueDrained { delivered: usize },
    SessionExpired,
    ConnectivityChanged { online: bool },
    /// Persisted operations were lost without their ids being recoverable.
    QueueCorrupted { reason: String },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Delivered { .. } => "delivered",
            Self::PermanentlyFailed { .. } => "permanently_failed",
            Self::QueueDrained { .. } => "queue_drained",
            Self::SessionExpired => "session_expired",
            Self::ConnectivityChanged { .. } => "connectivity_changed",
            Self::QueueCorrupted { .. } => "queue_corrupted",
        }
    }
}

/// Fan-out channel for [`CoreEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and a subscriber that falls more than `capacity` events behind
/// observes `RecvError::Lagged`.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: CoreEvent) {
        trace!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str) -> OpId {
        OpId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(CoreEvent::Queued {
            op_id: op("a"),
            pending: 1,
        });
        bus.emit(CoreEvent::QueueDrained { delivered: 1 });

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::Queued {
                op_id: op("a"),
                pending: 1
            }
        );
        assert_eq!(rx.recv().await.unwrap(), CoreEvent::QueueDrained { delivered: 1 });
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new(1);
        bus.emit(CoreEvent::SessionExpired);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = CoreEvent::PermanentlyFailed {
            op_id: op("op-9"),
            reason: FailureReason::Rejected {
                status: 422,
                message: "Prompt too long".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "permanently_failed");
        assert_eq!(json["reason"]["kind"], "rejected");
        assert_eq!(json["reason"]["message"], "Prompt too long");
    }

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(
            FailureReason::MaxRetriesExceeded { attempts: 5 }.to_string(),
            "gave up after 5 attempts"
        );
        assert_eq!(FailureReason::SessionEnded.to_string(), "session ended");
    }
}
