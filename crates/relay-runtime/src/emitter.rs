//! Broadcast-based emitter for [`RuntimeEvent`]s.
//!
//! The core never publishes to the transport itself. It emits decisions
//! here (grants, queue positions, resumptions, acknowledgments) and the
//! external driver turns them into transport events.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use relay_core::{AgentId, ConversationId, EventId, LoopId, ProjectId};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::LoopKey;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// State changes observable by drivers and status tooling.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// A loop was created for a key.
    LoopCreated {
        /// Loop key.
        key: LoopKey,
        /// Loop instance ID.
        loop_id: LoopId,
    },
    /// A loop paused on outstanding delegations.
    LoopPaused {
        /// Loop key.
        key: LoopKey,
        /// Number of pending delegations at pause time.
        pending: usize,
    },
    /// A delegation response was recorded.
    DelegationCompleted {
        /// Loop key.
        key: LoopKey,
        /// Request the response answers.
        request_event_id: EventId,
        /// Completed count after recording.
        completed: usize,
        /// Pending count after recording.
        pending: usize,
    },
    /// A paused loop was reactivated.
    LoopResumed {
        /// Loop key.
        key: LoopKey,
    },
    /// A loop finished and was removed.
    LoopFinished {
        /// Loop key.
        key: LoopKey,
        /// Loop instance ID.
        loop_id: LoopId,
    },
    /// A conversation was granted a project's execution lock.
    LockGranted {
        /// Project.
        project_id: ProjectId,
        /// New holder.
        conversation_id: ConversationId,
        /// Expiry of the grant.
        expires_at: DateTime<Utc>,
    },
    /// A conversation joined a project's wait queue.
    LockQueued {
        /// Project.
        project_id: ProjectId,
        /// Waiting conversation.
        conversation_id: ConversationId,
        /// 1-based queue position.
        position: usize,
    },
    /// The holder released the lock voluntarily.
    LockReleased {
        /// Project.
        project_id: ProjectId,
        /// Previous holder.
        conversation_id: ConversationId,
    },
    /// The lock will expire soon.
    LockWarning {
        /// Project.
        project_id: ProjectId,
        /// Current holder.
        conversation_id: ConversationId,
        /// Scheduled expiry.
        expires_at: DateTime<Utc>,
    },
    /// The lock expired and was auto-released.
    LockTimedOut {
        /// Project.
        project_id: ProjectId,
        /// Evicted holder.
        conversation_id: ConversationId,
    },
    /// An operator force-released the lock.
    LockForceReleased {
        /// Project.
        project_id: ProjectId,
        /// Evicted holder.
        conversation_id: ConversationId,
        /// Operator who forced the release.
        actor_id: String,
    },
    /// A waiting entry was removed from a project queue.
    QueueEntryRemoved {
        /// Project.
        project_id: ProjectId,
        /// Removed conversation.
        conversation_id: ConversationId,
    },
    /// An interim acknowledgment was produced for an undrained injection.
    BusyAcknowledged {
        /// Agent that is busy.
        agent_id: AgentId,
        /// Conversation the acknowledgment belongs to.
        conversation_id: ConversationId,
        /// Event that triggered the acknowledgment.
        source_event_id: EventId,
        /// Text to publish to the user.
        user_message: String,
    },
}

impl RuntimeEvent {
    /// Snake-case event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LoopCreated { .. } => "loop_created",
            Self::LoopPaused { .. } => "loop_paused",
            Self::DelegationCompleted { .. } => "delegation_completed",
            Self::LoopResumed { .. } => "loop_resumed",
            Self::LoopFinished { .. } => "loop_finished",
            Self::LockGranted { .. } => "lock_granted",
            Self::LockQueued { .. } => "lock_queued",
            Self::LockReleased { .. } => "lock_released",
            Self::LockWarning { .. } => "lock_warning",
            Self::LockTimedOut { .. } => "lock_timed_out",
            Self::LockForceReleased { .. } => "lock_force_released",
            Self::QueueEntryRemoved { .. } => "queue_entry_removed",
            Self::BusyAcknowledged { .. } => "busy_acknowledged",
        }
    }
}

/// Broadcast-based event emitter.
///
/// Non-blocking: `emit` never awaits. Slow receivers are lagged rather than
/// blocking the sender.
pub struct RuntimeEventEmitter {
    tx: broadcast::Sender<RuntimeEvent>,
    emit_count: AtomicU64,
}

impl RuntimeEventEmitter {
    /// Create a new emitter with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new emitter with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Emit an event to all subscribers. Returns the number of receivers.
    pub fn emit(&self, event: RuntimeEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total number of events emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for RuntimeEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resumed(conv: &str) -> RuntimeEvent {
        RuntimeEvent::LoopResumed {
            key: LoopKey::new("agent", conv),
        }
    }

    #[test]
    fn emit_with_no_subscribers() {
        let emitter = RuntimeEventEmitter::new();
        assert_eq!(emitter.emit(resumed("c1")), 0);
        assert_eq!(emitter.emit_count(), 1);
    }

    #[tokio::test]
    async fn emit_and_receive() {
        let emitter = RuntimeEventEmitter::new();
        let mut rx = emitter.subscribe();

        assert_eq!(emitter.emit(resumed("c1")), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, resumed("c1"));
        assert_eq!(received.event_type(), "loop_resumed");
    }

    #[tokio::test]
    async fn lagged_receiver_errors() {
        let emitter = RuntimeEventEmitter::with_capacity(2);
        let mut rx = emitter.subscribe();

        let _ = emitter.emit(resumed("c1"));
        let _ = emitter.emit(resumed("c2"));
        let _ = emitter.emit(resumed("c3"));

        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn subscriber_count_tracks_drops() {
        let emitter = RuntimeEventEmitter::new();
        let rx1 = emitter.subscribe();
        let rx2 = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);
        drop(rx1);
        drop(rx2);
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = RuntimeEvent::LockQueued {
            project_id: ProjectId::from("p"),
            conversation_id: ConversationId::from("y"),
            position: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lock_queued");
        assert_eq!(json["position"], 1);
        assert_eq!(json["conversation_id"], "y");
    }
}
