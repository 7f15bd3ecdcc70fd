//! Execution registry: one loop per `(agent, conversation)` key.

pub mod execution_registry;
pub mod state;

pub use execution_registry::{ExecutionRegistry, FinishOutcome};
pub use state::{ExecutionLoopState, LoopSnapshot};
