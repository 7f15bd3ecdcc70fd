//! Normalized transport events.
//!
//! The event transport delivers signed, tagged messages. By the time they
//! reach the execution core they have been verified and flattened into an
//! [`IncomingEvent`]: who sent it, which conversation it belongs to, who it
//! addresses, which prior events it references, and its text content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, ConversationId, EventId};

/// A single `name=value` tag carried on a transport event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTag {
    /// Tag name (e.g. `"e"`, `"p"`, `"tool"`).
    pub name: String,
    /// Tag value.
    pub value: String,
}

impl EventTag {
    /// Build a tag from name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Transport event as seen by the execution core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingEvent {
    /// Event ID assigned by the transport.
    pub id: EventId,
    /// Author of the event.
    pub sender_id: AgentId,
    /// Conversation (thread root) the event belongs to.
    pub conversation_id: ConversationId,
    /// Agent the event addresses, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<AgentId>,
    /// Prior events this one replies to or references.
    #[serde(default)]
    pub reference_event_ids: Vec<EventId>,
    /// Remaining transport tags.
    #[serde(default)]
    pub tags: Vec<EventTag>,
    /// Text content.
    pub content: String,
    /// Creation time reported by the transport.
    pub timestamp: DateTime<Utc>,
}

impl IncomingEvent {
    /// Create an event with the current timestamp and no references or tags.
    pub fn new(
        id: impl Into<EventId>,
        sender_id: impl Into<AgentId>,
        conversation_id: impl Into<ConversationId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            conversation_id: conversation_id.into(),
            recipient_id: None,
            reference_event_ids: Vec::new(),
            tags: Vec::new(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Set the addressed agent.
    #[must_use]
    pub fn to_recipient(mut self, recipient: impl Into<AgentId>) -> Self {
        self.recipient_id = Some(recipient.into());
        self
    }

    /// Add a reference to a prior event.
    #[must_use]
    pub fn referencing(mut self, event_id: impl Into<EventId>) -> Self {
        self.reference_event_ids.push(event_id.into());
        self
    }

    /// Add a transport tag.
    #[must_use]
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(EventTag::new(name, value));
        self
    }

    /// All values of tags with the given name, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name == name)
            .map(|t| t.value.as_str())
    }

    /// Whether the event references at least one prior event.
    pub fn has_references(&self) -> bool {
        !self.reference_event_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let event = IncomingEvent::new("ev1", "alice", "conv1", "hello")
            .to_recipient("bob")
            .referencing("req1")
            .with_tag("tool", "shell");

        assert_eq!(event.id.as_str(), "ev1");
        assert_eq!(event.recipient_id.as_deref(), Some("bob"));
        assert_eq!(event.reference_event_ids, vec![EventId::from("req1")]);
        assert!(event.has_references());
        assert_eq!(event.tag_values("tool").collect::<Vec<_>>(), vec!["shell"]);
    }

    #[test]
    fn tag_values_filters_by_name() {
        let event = IncomingEvent::new("ev1", "alice", "conv1", "x")
            .with_tag("p", "a")
            .with_tag("t", "ignored")
            .with_tag("p", "b");
        assert_eq!(event.tag_values("p").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(event.tag_values("missing").count(), 0);
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let json = serde_json::json!({
            "id": "ev9",
            "senderId": "alice",
            "conversationId": "c1",
            "content": "hi",
            "timestamp": "2026-01-01T00:00:00Z"
        });
        let event: IncomingEvent = serde_json::from_value(json).unwrap();
        assert!(event.recipient_id.is_none());
        assert!(!event.has_references());
        assert!(event.tags.is_empty());
    }
}
