//! Transcript messages.
//!
//! A loop's transcript is an ordered list of [`Message`]s. The execution
//! core only appends to it; composing prompts from it is the driver's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EventId;

/// Author role of a transcript entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Message from a human user.
    User,
    /// Message produced by the agent's model.
    Assistant,
    /// Context inserted by the runtime (status summaries, acknowledgments).
    System,
    /// Output of a tool invocation.
    Tool,
}

/// One transcript entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Transport event this message originated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<EventId>,
    /// When the message entered the transcript.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            source_event_id: None,
            created_at: Utc::now(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Runtime-inserted system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Attach the originating transport event.
    #[must_use]
    pub fn from_event(mut self, event_id: impl Into<EventId>) -> Self {
        self.source_event_id = Some(event_id.into());
        self
    }
}
