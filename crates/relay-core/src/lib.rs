//! # relay-core
//!
//! Foundation types shared by every Relay crate.
//!
//! - **Branded IDs**: `AgentId`, `ConversationId`, `ProjectId`, `EventId`, `LoopId`
//! - **Events**: [`events::IncomingEvent`], the normalized shape of a transport event
//! - **Messages**: [`messages::Message`], one entry of a loop transcript
//! - **Logging**: `tracing` subscriber bootstrap and in-memory capture for tests

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;
pub mod messages;

pub use events::{EventTag, IncomingEvent};
pub use ids::{AgentId, ConversationId, EventId, LoopId, ProjectId};
pub use messages::{Message, Role};
