//! # relay-runtime
//!
//! Concurrency core of the multi-agent daemon.
//!
//! - **Registry**: one execution loop per `(agent, conversation)`; pause on
//!   delegation, record completions, resume, queue and drain injections
//! - **Delegation detector**: matches incoming events to pending delegations
//!   and drives the registry's resumption path
//! - **Project mutex**: per-project execution lock with FIFO queue, timeout
//!   warning, auto-release and operator force-release
//! - **Busy acknowledgment**: optional interim reply when an injection sits
//!   undrained for too long
//! - **Dispatcher / driver / runtime**: event routing, step-outcome handling,
//!   and the operational surface exposed to status and admin tooling

#![deny(unsafe_code)]

pub mod busy_ack;
pub mod delegation;
pub mod dispatch;
pub mod driver;
pub mod emitter;
pub mod errors;
pub mod mutex;
pub mod registry;
pub mod runtime;
pub mod types;

pub use busy_ack::{BusyAck, BusyAckGenerator, BusyAckRequest, CompletionService};
pub use delegation::DelegationDetector;
pub use dispatch::{DispatchOutcome, EventDispatcher};
pub use driver::{LoopDriver, StepDisposition};
pub use emitter::{RuntimeEvent, RuntimeEventEmitter};
pub use errors::{CompletionError, RuntimeError};
pub use mutex::{AcquireOutcome, ProjectExecutionMutex};
pub use registry::{ExecutionRegistry, LoopSnapshot};
pub use runtime::Runtime;
pub use types::{
    CompletedDelegation, CompletionReport, Delegation, Injection, InjectionKind, LoopKey,
    LoopStatus, StepOutcome, ToolInFlight,
};
