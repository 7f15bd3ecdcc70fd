//! Project execution mutex: one lock per project, FIFO admission, timeout
//! warning and auto-release, operator force-release.

pub mod lock;
pub mod project_mutex;
pub mod sweeper;

pub use lock::{AcquireOutcome, ExecutionLock, Handoff, ProjectLockState, QueueEntry, TimeoutAction};
pub use project_mutex::{MutexConfig, ProjectExecutionMutex, ProjectLockStatus, TimeoutEvent};
pub use sweeper::spawn_timeout_sweeper;
