//! Runtime error types.

use relay_core::{ConversationId, EventId, ProjectId};

use crate::types::{LoopKey, LoopStatus};

/// Errors raised by registry and project-mutex operations.
///
/// All of these are local, recoverable conditions. The core never retries
/// internally; callers decide whether to retry, drop, or alert.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A non-finished loop already exists for the key; route to injection instead.
    #[error("Execution loop already active: {0}")]
    AlreadyActive(LoopKey),

    /// No active loop exists for the key.
    #[error("Execution loop not found: {0}")]
    NotFound(LoopKey),

    /// The requested transition is illegal from the loop's current status.
    #[error("Invalid state for {operation} on {key}: loop is {status}")]
    InvalidState {
        /// Loop the operation targeted.
        key: LoopKey,
        /// Status at the time of the call.
        status: LoopStatus,
        /// Operation that was rejected.
        operation: &'static str,
    },

    /// A completion referenced a request the loop is not waiting on.
    #[error("Unknown delegation {request_event_id} for {key}")]
    UnknownDelegation {
        /// Loop the completion was addressed to.
        key: LoopKey,
        /// Request event ID that is not pending.
        request_event_id: EventId,
    },

    /// Release attempted by a conversation that does not hold the lock.
    #[error("Conversation {conversation_id} does not hold the execution lock for project {project_id}")]
    NotHolder {
        /// Project whose lock was targeted.
        project_id: ProjectId,
        /// Conversation that attempted the release.
        conversation_id: ConversationId,
        /// Actual holder, if any.
        holder: Option<ConversationId>,
    },
}

impl RuntimeError {
    /// Whether the caller may retry or reroute after this error.
    ///
    /// Every variant describes a transient mismatch between the caller's view
    /// and the current state, so all are recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AlreadyActive(_)
            | Self::NotFound(_)
            | Self::InvalidState { .. }
            | Self::UnknownDelegation { .. }
            | Self::NotHolder { .. } => true,
        }
    }

    /// Whether the error is expected under at-least-once delivery and should
    /// be logged as a warning rather than surfaced to an operator.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::UnknownDelegation { .. } | Self::NotFound(_))
    }

    /// Error category string for event emission.
    pub fn category(&self) -> &str {
        match self {
            Self::AlreadyActive(_) => "already_active",
            Self::NotFound(_) => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::UnknownDelegation { .. } => "unknown_delegation",
            Self::NotHolder { .. } => "not_holder",
        }
    }
}

/// Errors from the external completion service.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// The service could not be reached or returned a transport failure.
    #[error("Completion service unavailable: {0}")]
    Unavailable(String),

    /// The service answered but the response could not be used.
    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),

    /// The request was cancelled before the service answered.
    #[error("Completion cancelled")]
    Cancelled,
}
