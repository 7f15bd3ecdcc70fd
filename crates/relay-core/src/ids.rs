//! Branded ID newtypes.
//!
//! Agents, conversations, projects and transport events are all identified
//! by opaque strings. Each gets its own newtype so a conversation ID cannot
//! be passed where a project ID is expected.
//!
//! Generated IDs are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].
//! IDs that arrive from the transport are wrapped as-is.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of an agent (the transport-level public key or handle).
    AgentId
}

branded_id! {
    /// Identifier of a conversation thread.
    ConversationId
}

branded_id! {
    /// Identifier of a project whose execution phase is serialized.
    ProjectId
}

branded_id! {
    /// Identifier of a transport event (requests, responses, user messages).
    EventId
}

branded_id! {
    /// Identifier of one execution loop instance.
    LoopId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn generated_ids_are_unique() {
        let a = LoopId::new();
        let b = LoopId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_are_time_ordered() {
        let a = LoopId::new();
        let b = LoopId::new();
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn display_is_inner_value() {
        let id = AgentId::from("agent-npub1");
        assert_eq!(id.to_string(), "agent-npub1");
        assert_eq!(&*id, "agent-npub1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = EventId::from("ev1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ev1\"");
        let back: EventId = serde_json::from_str("\"ev1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn borrow_allows_str_lookup() {
        let mut map: HashMap<EventId, u32> = HashMap::new();
        let _ = map.insert(EventId::from("req-1"), 7);
        assert_eq!(map.get("req-1"), Some(&7));
    }

    #[test]
    fn into_inner_returns_string() {
        let id = ProjectId::from("proj");
        let s: String = id.clone().into();
        assert_eq!(s, "proj");
        assert_eq!(id.into_inner(), "proj");
    }
}
