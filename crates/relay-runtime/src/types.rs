//! Shared runtime types: loop keys, statuses, delegations, injections.

use std::fmt;

use chrono::{DateTime, Utc};
use relay_core::{AgentId, ConversationId, EventId, Message, Role};
use serde::{Deserialize, Serialize};

/// Key of an execution loop: one agent working in one conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopKey {
    /// Agent running the loop.
    pub agent_id: AgentId,
    /// Conversation the loop serves.
    pub conversation_id: ConversationId,
}

impl LoopKey {
    /// Build a key.
    pub fn new(agent_id: impl Into<AgentId>, conversation_id: impl Into<ConversationId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl fmt::Display for LoopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.conversation_id)
    }
}

/// Lifecycle status of an execution loop.
///
/// Legal transitions: `Executing → Paused → Executing`, `Executing → Done`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// The driver is running reasoning/tool steps.
    Executing,
    /// Waiting on delegated requests.
    Paused,
    /// Finished; the state has been removed from the registry.
    Done,
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executing => write!(f, "executing"),
            Self::Paused => write!(f, "paused"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A request sent from one loop to another agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    /// Transport ID of the request event; the response references it.
    pub request_event_id: EventId,
    /// Agent expected to respond.
    pub recipient_id: AgentId,
    /// What was asked.
    pub prompt: String,
}

impl Delegation {
    /// Build a delegation.
    pub fn new(
        request_event_id: impl Into<EventId>,
        recipient_id: impl Into<AgentId>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            request_event_id: request_event_id.into(),
            recipient_id: recipient_id.into(),
            prompt: prompt.into(),
        }
    }
}

/// A delegation whose response has arrived.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedDelegation {
    /// Request event the response answers.
    pub request_event_id: EventId,
    /// Agent that responded.
    pub recipient_id: AgentId,
    /// Response content.
    pub response: String,
    /// Transport ID of the response event.
    pub response_event_id: EventId,
    /// When the completion was recorded.
    pub completed_at: DateTime<Utc>,
}

/// Result of recording a delegation completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionReport {
    /// Number of completed delegations after this call.
    pub completed: usize,
    /// Number of delegations still pending after this call.
    pub pending: usize,
    /// Agent whose response was recorded.
    pub recipient_id: AgentId,
    /// Recipients of the delegations still pending, in issue order.
    pub still_waiting_on: Vec<AgentId>,
    /// The request had already been completed; nothing changed.
    pub duplicate: bool,
}

impl CompletionReport {
    /// Total delegations tracked by the loop (completed + pending).
    pub fn total(&self) -> usize {
        self.completed + self.pending
    }

    /// Whether no delegations remain pending.
    pub fn all_complete(&self) -> bool {
        self.pending == 0
    }
}

/// Origin of a queued injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionKind {
    /// A message from a human or another agent.
    User,
    /// Context produced by the runtime (status summaries, acknowledgments).
    System,
}

impl InjectionKind {
    /// Transcript role the injection is recorded under.
    pub fn role(self) -> Role {
        match self {
            Self::User => Role::User,
            Self::System => Role::System,
        }
    }
}

/// An external message waiting for the loop's next step boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Injection {
    /// Origin of the message.
    pub kind: InjectionKind,
    /// Message content.
    pub content: String,
    /// Transport event that produced the injection.
    pub source_event_id: EventId,
    /// When the injection was queued.
    pub queued_at: DateTime<Utc>,
}

impl Injection {
    /// Build an injection stamped with the current time.
    pub fn new(
        kind: InjectionKind,
        content: impl Into<String>,
        source_event_id: impl Into<EventId>,
    ) -> Self {
        Self {
            kind,
            content: content.into(),
            source_event_id: source_event_id.into(),
            queued_at: Utc::now(),
        }
    }

    /// Transcript entry for this injection.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(self.kind.role(), self.content.clone())
            .from_event(self.source_event_id.clone());
        msg.created_at = self.queued_at;
        msg
    }
}

/// A tool invocation currently running inside a loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInFlight {
    /// Tool name.
    pub name: String,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
}

/// What one reasoning/tool step asks the driver to do next.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// Keep stepping.
    Continue,
    /// Delegations were issued; pause until a response arrives.
    Pause(Vec<Delegation>),
    /// The loop is done with the given final answer.
    Finish(String),
}
