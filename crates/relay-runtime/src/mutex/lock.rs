//! Per-project lock state machine: `Unheld → Held(conversation) → Unheld`.
//!
//! All transitions take an explicit `now` so the state machine can be
//! driven deterministically from tests and from the periodic sweep.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use relay_core::ConversationId;
use serde::Serialize;

/// The lock as held by one conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLock {
    /// Conversation holding the lock.
    pub holder: ConversationId,
    /// When the lock was granted.
    pub acquired_at: DateTime<Utc>,
    /// When the lock is auto-released.
    pub expires_at: DateTime<Utc>,
    /// When the expiry warning was issued, if it was.
    pub warned_at: Option<DateTime<Utc>>,
}

impl ExecutionLock {
    fn grant(holder: ConversationId, now: DateTime<Utc>, timeout: TimeDelta) -> Self {
        Self {
            holder,
            acquired_at: now,
            expires_at: now
                .checked_add_signed(timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            warned_at: None,
        }
    }

    /// Time left until expiry (zero once expired).
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        (self.expires_at - now).max(TimeDelta::zero())
    }
}

/// A conversation waiting for the lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Waiting conversation.
    pub conversation_id: ConversationId,
    /// When it joined the queue.
    pub enqueued_at: DateTime<Utc>,
}

/// Result of an acquire attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller holds the lock.
    Granted {
        /// Expiry of the caller's grant.
        expires_at: DateTime<Utc>,
        /// The caller already held the lock; nothing changed.
        reentrant: bool,
    },
    /// The caller is waiting.
    Queued {
        /// 1-based position in the queue.
        position: usize,
    },
}

impl AcquireOutcome {
    /// Whether the caller holds the lock after the call.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// A release and the grant it triggered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handoff {
    /// Lock that was released.
    pub released: ExecutionLock,
    /// Lock granted to the head of the queue, if anyone was waiting.
    pub next: Option<ExecutionLock>,
}

/// Action produced by a timeout check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    /// The holder entered the warning window.
    Warning {
        /// Current holder.
        holder: ConversationId,
        /// Scheduled expiry.
        expires_at: DateTime<Utc>,
    },
    /// The holder's grant expired and the lock moved on.
    Expired(Handoff),
}

/// Lock and FIFO queue for one project.
#[derive(Debug, Default)]
pub struct ProjectLockState {
    lock: Option<ExecutionLock>,
    queue: VecDeque<QueueEntry>,
}

impl ProjectLockState {
    /// Current grant, if held.
    pub fn current(&self) -> Option<&ExecutionLock> {
        self.lock.as_ref()
    }

    /// Waiting entries in FIFO order.
    pub fn queue(&self) -> impl Iterator<Item = &QueueEntry> {
        self.queue.iter()
    }

    /// Number of waiting entries.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Position of `conversation_id`: 0 for the holder, 1-based for waiters.
    pub fn position(&self, conversation_id: &ConversationId) -> Option<usize> {
        if self.is_held_by(conversation_id) {
            return Some(0);
        }
        self.queue
            .iter()
            .position(|e| &e.conversation_id == conversation_id)
            .map(|i| i + 1)
    }

    fn is_held_by(&self, conversation_id: &ConversationId) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|l| &l.holder == conversation_id)
    }

    /// Grant, re-grant, or enqueue.
    ///
    /// A conversation already waiting keeps its position.
    pub fn acquire(
        &mut self,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
        timeout: TimeDelta,
    ) -> AcquireOutcome {
        if let Some(held) = &self.lock {
            if &held.holder == conversation_id {
                return AcquireOutcome::Granted {
                    expires_at: held.expires_at,
                    reentrant: true,
                };
            }
            let position = match self.position(conversation_id) {
                Some(existing) => existing,
                None => {
                    self.queue.push_back(QueueEntry {
                        conversation_id: conversation_id.clone(),
                        enqueued_at: now,
                    });
                    self.queue.len()
                }
            };
            return AcquireOutcome::Queued { position };
        }

        let granted = ExecutionLock::grant(conversation_id.clone(), now, timeout);
        let expires_at = granted.expires_at;
        self.lock = Some(granted);
        AcquireOutcome::Granted {
            expires_at,
            reentrant: false,
        }
    }

    /// Release by the holder. Returns `None` if `conversation_id` does not
    /// hold the lock.
    pub fn release(
        &mut self,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
        timeout: TimeDelta,
    ) -> Option<Handoff> {
        if !self.is_held_by(conversation_id) {
            return None;
        }
        self.force_release(now, timeout)
    }

    /// Release regardless of holder. Returns `None` if unheld.
    ///
    /// The release and the grant to the queue head happen in one call, so
    /// nothing can acquire in between.
    pub fn force_release(&mut self, now: DateTime<Utc>, timeout: TimeDelta) -> Option<Handoff> {
        let released = self.lock.take()?;
        let next = self.queue.pop_front().map(|entry| {
            let granted = ExecutionLock::grant(entry.conversation_id, now, timeout);
            self.lock = Some(granted.clone());
            granted
        });
        Some(Handoff { released, next })
    }

    /// Warn once inside the warning window; expire and hand off at expiry.
    pub fn check_timeout(
        &mut self,
        now: DateTime<Utc>,
        timeout: TimeDelta,
        warning_lead: TimeDelta,
    ) -> Option<TimeoutAction> {
        let held = self.lock.as_mut()?;
        if now >= held.expires_at {
            return self.force_release(now, timeout).map(TimeoutAction::Expired);
        }
        let warn_at = held
            .expires_at
            .checked_sub_signed(warning_lead)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if held.warned_at.is_none() && now >= warn_at {
            held.warned_at = Some(now);
            return Some(TimeoutAction::Warning {
                holder: held.holder.clone(),
                expires_at: held.expires_at,
            });
        }
        None
    }

    /// Drop a waiting entry. The holder is unaffected.
    pub fn remove_from_queue(&mut self, conversation_id: &ConversationId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|e| &e.conversation_id != conversation_id);
        self.queue.len() != before
    }
}
