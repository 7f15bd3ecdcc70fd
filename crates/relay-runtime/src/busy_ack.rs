//! Interim acknowledgments for messages that wait on a busy loop.
//!
//! When a user message is injected into a loop that is mid-step, the loop
//! only sees it at the next drain. If it is still queued after the
//! configured delay, the completion service drafts a short reply for the
//! user and a context note for the agent. The queued message is then
//! rewritten as a system injection carrying both.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use relay_core::{AgentId, ConversationId, EventId};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::emitter::{RuntimeEvent, RuntimeEventEmitter};
use crate::errors::CompletionError;
use crate::registry::ExecutionRegistry;
use crate::types::{Injection, InjectionKind, LoopKey, ToolInFlight};

/// Context handed to the completion service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyAckRequest {
    /// Busy agent.
    pub agent_id: AgentId,
    /// Conversation of the waiting message.
    pub conversation_id: ConversationId,
    /// The message that is waiting.
    pub pending_message: String,
    /// Tool the agent is running, if any.
    pub current_tool: Option<ToolInFlight>,
    /// How long the message has waited.
    pub waited_ms: i64,
}

/// Structured answer from the completion service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyAck {
    /// Text published to the user right away.
    pub user_message: String,
    /// Note delivered to the agent with the original message.
    pub system_context_message: String,
    /// Interrupt the tool currently running.
    pub should_abort_current_tool: bool,
}

/// External model call that drafts acknowledgments.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Draft an acknowledgment for `request`.
    async fn complete(&self, request: BusyAckRequest) -> Result<BusyAck, CompletionError>;
}

/// Result of one acknowledgment attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The acknowledgment was produced and the injection rewritten.
    Acknowledged {
        /// What the service returned.
        ack: BusyAck,
        /// Tool interrupted on the service's request.
        aborted_tool: Option<ToolInFlight>,
    },
    /// The message was drained (or is not a user message); nothing to do.
    NotPending,
    /// No completion service is configured.
    Disabled,
    /// The completion service failed; the injection is left untouched.
    Failed(String),
}

/// Schedules and produces busy acknowledgments.
pub struct BusyAckGenerator {
    registry: Arc<ExecutionRegistry>,
    service: Option<Arc<dyn CompletionService>>,
    delay: Duration,
    enabled: bool,
    emitter: Arc<RuntimeEventEmitter>,
}

impl BusyAckGenerator {
    /// Create a generator. Without a service it never acknowledges.
    pub fn new(
        registry: Arc<ExecutionRegistry>,
        service: Option<Arc<dyn CompletionService>>,
        delay: Duration,
        enabled: bool,
    ) -> Self {
        let emitter = Arc::clone(registry.emitter());
        Self {
            registry,
            service,
            delay,
            enabled,
            emitter,
        }
    }

    /// Whether acknowledgments will be attempted.
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.service.is_some()
    }

    /// Delay before an acknowledgment is attempted.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Check the injection from `source_event_id` after the delay.
    ///
    /// Returns `None` when disabled or when called outside a tokio runtime.
    pub fn schedule(
        self: &Arc<Self>,
        key: LoopKey,
        source_event_id: EventId,
    ) -> Option<JoinHandle<AckOutcome>> {
        if !self.is_enabled() {
            return None;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(key = %key, "no runtime available, busy acknowledgment skipped");
            return None;
        };
        let this = Arc::clone(self);
        Some(handle.spawn(async move {
            tokio::time::sleep(this.delay).await;
            this.acknowledge_if_pending(&key, &source_event_id).await
        }))
    }

    /// Acknowledge now if the user injection is still queued.
    #[instrument(skip_all, fields(key = %key, source_event_id = %source_event_id))]
    pub async fn acknowledge_if_pending(&self, key: &LoopKey, source_event_id: &EventId) -> AckOutcome {
        let Some(service) = &self.service else {
            return AckOutcome::Disabled;
        };
        let Some(pending) = self.registry.pending_injection(key, source_event_id) else {
            debug!("injection already drained");
            return AckOutcome::NotPending;
        };
        if pending.kind != InjectionKind::User {
            return AckOutcome::NotPending;
        }

        let request = BusyAckRequest {
            agent_id: key.agent_id.clone(),
            conversation_id: key.conversation_id.clone(),
            pending_message: pending.content.clone(),
            current_tool: self.registry.snapshot(key).and_then(|s| s.current_tool),
            waited_ms: (Utc::now() - pending.queued_at).num_milliseconds(),
        };

        let ack = match service.complete(request).await {
            Ok(ack) => ack,
            Err(error) => {
                warn!(error = %error, "busy acknowledgment failed");
                return AckOutcome::Failed(error.to_string());
            }
        };

        let mut replacement = Injection::new(
            InjectionKind::System,
            format!(
                "{}\n\nUser message: {}",
                ack.system_context_message, pending.content
            ),
            source_event_id.clone(),
        );
        replacement.queued_at = pending.queued_at;
        match self.registry.replace_injection(key, source_event_id, replacement) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                debug!("injection drained while acknowledgment was drafted");
                return AckOutcome::NotPending;
            }
        }

        let aborted_tool = if ack.should_abort_current_tool {
            self.registry.abort_tool(key).ok().flatten()
        } else {
            None
        };

        debug!(aborted = aborted_tool.is_some(), "busy acknowledgment produced");
        let _ = self.emitter.emit(RuntimeEvent::BusyAcknowledged {
            agent_id: key.agent_id.clone(),
            conversation_id: key.conversation_id.clone(),
            source_event_id: source_event_id.clone(),
            user_message: ack.user_message.clone(),
        });
        AckOutcome::Acknowledged { ack, aborted_tool }
    }
}
