//! Runtime façade: owns the registry, project mutex, detector, dispatcher
//! and busy-ack generator, and exposes the operational surface used by
//! status and admin tooling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::{AgentId, ConversationId, IncomingEvent, ProjectId};
use relay_settings::ExecutionSettings;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::busy_ack::{BusyAckGenerator, CompletionService};
use crate::delegation::DelegationDetector;
use crate::dispatch::{DispatchOutcome, EventDispatcher};
use crate::driver::{LoopDriver, StepDisposition};
use crate::emitter::{RuntimeEvent, RuntimeEventEmitter};
use crate::errors::RuntimeError;
use crate::mutex::{
    AcquireOutcome, Handoff, MutexConfig, ProjectExecutionMutex, ProjectLockStatus, TimeoutAction,
    TimeoutEvent, spawn_timeout_sweeper,
};
use crate::registry::{ExecutionRegistry, LoopSnapshot};
use crate::types::{LoopKey, StepOutcome, ToolInFlight};

/// The assembled concurrency core.
pub struct Runtime {
    settings: ExecutionSettings,
    emitter: Arc<RuntimeEventEmitter>,
    registry: Arc<ExecutionRegistry>,
    mutex: Arc<ProjectExecutionMutex>,
    detector: Arc<DelegationDetector>,
    busy_ack: Arc<BusyAckGenerator>,
    dispatcher: EventDispatcher,
    driver: LoopDriver,
}

impl Runtime {
    /// Build a runtime from settings. `service` enables busy acknowledgments.
    pub fn new(
        settings: &ExecutionSettings,
        service: Option<Arc<dyn CompletionService>>,
    ) -> Self {
        let emitter = Arc::new(RuntimeEventEmitter::new());
        let registry = Arc::new(ExecutionRegistry::with_emitter(Arc::clone(&emitter)));
        let mutex = Arc::new(ProjectExecutionMutex::with_emitter(
            MutexConfig::from(settings),
            Arc::clone(&emitter),
        ));
        let detector = Arc::new(DelegationDetector::new(
            Arc::clone(&registry),
            settings.resume_policy,
        ));
        let busy_ack = Arc::new(BusyAckGenerator::new(
            Arc::clone(&registry),
            service,
            settings.busy_ack_delay(),
            settings.busy_ack_enabled,
        ));
        let dispatcher = EventDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&detector),
            Arc::clone(&busy_ack),
        );
        let driver = LoopDriver::new(Arc::clone(&registry));

        Self {
            settings: settings.clone(),
            emitter,
            registry,
            mutex,
            detector,
            busy_ack,
            dispatcher,
            driver,
        }
    }

    /// Settings the runtime was built with.
    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Shared event emitter.
    pub fn emitter(&self) -> &Arc<RuntimeEventEmitter> {
        &self.emitter
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.emitter.subscribe()
    }

    /// Execution registry.
    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Project execution mutex.
    pub fn mutex(&self) -> &Arc<ProjectExecutionMutex> {
        &self.mutex
    }

    /// Delegation completion detector.
    pub fn detector(&self) -> &Arc<DelegationDetector> {
        &self.detector
    }

    /// Busy acknowledgment generator.
    pub fn busy_ack(&self) -> &Arc<BusyAckGenerator> {
        &self.busy_ack
    }

    /// Route an incoming event.
    pub fn dispatch(&self, event: &IncomingEvent) -> Result<DispatchOutcome, RuntimeError> {
        self.dispatcher.dispatch(event)
    }

    /// Apply a step outcome reported by a loop driver.
    pub fn apply_step(
        &self,
        key: &LoopKey,
        outcome: StepOutcome,
    ) -> Result<StepDisposition, RuntimeError> {
        self.driver.apply_step(key, outcome)
    }

    /// Acquire the project's execution lock.
    pub fn acquire(&self, project_id: &ProjectId, conversation_id: &ConversationId) -> AcquireOutcome {
        self.mutex.acquire(project_id, conversation_id)
    }

    /// Release the project's execution lock.
    pub fn release(
        &self,
        project_id: &ProjectId,
        conversation_id: &ConversationId,
    ) -> Result<Handoff, RuntimeError> {
        self.mutex.release(project_id, conversation_id)
    }

    // ── Operational surface ─────────────────────────────────────────────

    /// Holder and queue of a project.
    pub fn lock_status(&self, project_id: &ProjectId) -> ProjectLockStatus {
        self.mutex.status(project_id)
    }

    /// Holder and queue of every known project.
    pub fn lock_statuses(&self) -> Vec<ProjectLockStatus> {
        self.mutex.statuses()
    }

    /// Status of one loop.
    pub fn loop_status(&self, agent_id: &AgentId, conversation_id: &ConversationId) -> Option<LoopSnapshot> {
        self.registry
            .snapshot(&LoopKey::new(agent_id.clone(), conversation_id.clone()))
    }

    /// Status of every live loop.
    pub fn list_loops(&self) -> Vec<LoopSnapshot> {
        self.registry.list()
    }

    /// Operator release. The evicted holder's in-flight work in the project
    /// is cancelled.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %actor_id))]
    pub fn force_release(&self, project_id: &ProjectId, actor_id: &str) -> Option<Handoff> {
        let handoff = self.mutex.force_release(project_id, actor_id)?;
        let cancelled = self
            .registry
            .cancel_conversation(&handoff.released.holder, Some(project_id));
        info!(evicted = %handoff.released.holder, cancelled, "force release applied");
        Some(handoff)
    }

    /// Drop a waiting conversation from a project queue.
    pub fn remove_from_queue(&self, project_id: &ProjectId, conversation_id: &ConversationId) -> bool {
        self.mutex.remove_from_queue(project_id, conversation_id)
    }

    /// Cancel the tool running in one loop.
    pub fn abort_tool(
        &self,
        agent_id: &AgentId,
        conversation_id: &ConversationId,
    ) -> Result<Option<ToolInFlight>, RuntimeError> {
        self.registry
            .abort_tool(&LoopKey::new(agent_id.clone(), conversation_id.clone()))
    }

    /// Run one timeout pass as of `now`.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<TimeoutEvent> {
        sweep(&self.mutex, &self.registry, now)
    }

    /// Start the periodic timeout sweep; it stops when `shutdown` fires.
    pub fn spawn_timeout_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<u64> {
        let mutex = Arc::clone(&self.mutex);
        let registry = Arc::clone(&self.registry);
        spawn_timeout_sweeper(self.settings.sweep_interval(), shutdown, move || {
            let _ = sweep(&mutex, &registry, Utc::now());
        })
    }
}

/// Expire overdue locks and cancel the evicted holders' work.
fn sweep(
    mutex: &ProjectExecutionMutex,
    registry: &ExecutionRegistry,
    now: DateTime<Utc>,
) -> Vec<TimeoutEvent> {
    let events = mutex.check_timeouts(now);
    for event in &events {
        if let TimeoutAction::Expired(handoff) = &event.action {
            let _ = registry.cancel_conversation(&handoff.released.holder, Some(&event.project_id));
        }
    }
    events
}
