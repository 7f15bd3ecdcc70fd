//! Keyed store of execution loops with a reverse delegation index.
//!
//! Each loop lives in its own `Arc<Mutex<_>>` slot so operations on one key
//! are serialized while unrelated keys proceed in parallel. Lock order is
//! always map shard → slot mutex → index maps; nothing touches `loops` while
//! holding a slot mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use relay_core::{ConversationId, EventId, LoopId, Message, ProjectId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::emitter::{RuntimeEvent, RuntimeEventEmitter};
use crate::errors::RuntimeError;
use crate::registry::state::{ExecutionLoopState, LoopSnapshot};
use crate::types::{
    CompletionReport, Delegation, Injection, InjectionKind, LoopKey, LoopStatus, ToolInFlight,
};

type Slot = Arc<Mutex<ExecutionLoopState>>;

/// Request IDs remembered after their loop finished.
const FINISHED_REQUEST_CAPACITY: usize = 4096;

/// Bounded request ID → finished loop map; the oldest entries are evicted
/// first.
#[derive(Debug)]
struct FinishedRequests {
    owners: HashMap<EventId, LoopKey>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl FinishedRequests {
    fn new(capacity: usize) -> Self {
        Self {
            owners: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, request_event_id: EventId, key: LoopKey) {
        if self.owners.insert(request_event_id.clone(), key).is_none() {
            self.order.push_back(request_event_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                let _ = self.owners.remove(&oldest);
            }
        }
    }

    fn get(&self, request_event_id: &EventId) -> Option<LoopKey> {
        self.owners.get(request_event_id).cloned()
    }
}

/// Result of [`ExecutionRegistry::finish`].
#[derive(Debug, PartialEq)]
pub enum FinishOutcome {
    /// The loop reached `Done` and was removed.
    Finished(LoopId),
    /// Injections arrived before the finish; they were drained and the loop
    /// keeps executing so it can respond to them.
    Deferred(Vec<Injection>),
}

/// Registry of active execution loops.
pub struct ExecutionRegistry {
    loops: DashMap<LoopKey, Slot>,
    /// Pending request event ID → loop waiting on it.
    awaiting: DashMap<EventId, LoopKey>,
    /// Completed request event ID → loop that recorded it (duplicate detection).
    answered: DashMap<EventId, LoopKey>,
    /// Request IDs of finished loops (tardy completion detection).
    finished: Mutex<FinishedRequests>,
    emitter: Arc<RuntimeEventEmitter>,
}

impl ExecutionRegistry {
    /// Create an empty registry with a private emitter.
    pub fn new() -> Self {
        Self::with_emitter(Arc::new(RuntimeEventEmitter::new()))
    }

    /// Create an empty registry publishing to `emitter`.
    pub fn with_emitter(emitter: Arc<RuntimeEventEmitter>) -> Self {
        Self {
            loops: DashMap::new(),
            awaiting: DashMap::new(),
            answered: DashMap::new(),
            finished: Mutex::new(FinishedRequests::new(FINISHED_REQUEST_CAPACITY)),
            emitter,
        }
    }

    /// Emitter this registry publishes to.
    pub fn emitter(&self) -> &Arc<RuntimeEventEmitter> {
        &self.emitter
    }

    fn slot(&self, key: &LoopKey) -> Result<Slot, RuntimeError> {
        self.loops
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RuntimeError::NotFound(key.clone()))
    }

    /// Run `f` against the live state for `key` under its slot lock.
    fn with_active<T>(
        &self,
        key: &LoopKey,
        f: impl FnOnce(&mut ExecutionLoopState) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let slot = self.slot(key)?;
        let mut state = slot.lock();
        // A Done state may still be in the map while `clear` removes it.
        if !state.is_active() {
            return Err(RuntimeError::NotFound(key.clone()));
        }
        f(&mut state)
    }

    /// Create a loop for `key` with no project association.
    pub fn create(&self, key: &LoopKey) -> Result<LoopId, RuntimeError> {
        self.insert_new(key, None)
    }

    /// Create a loop for `key` running in `project_id`.
    pub fn create_in_project(
        &self,
        key: &LoopKey,
        project_id: ProjectId,
    ) -> Result<LoopId, RuntimeError> {
        self.insert_new(key, Some(project_id))
    }

    #[instrument(skip_all, fields(key = %key))]
    fn insert_new(
        &self,
        key: &LoopKey,
        project_id: Option<ProjectId>,
    ) -> Result<LoopId, RuntimeError> {
        let state = ExecutionLoopState::new(key.clone(), project_id);
        let loop_id = state.id.clone();
        let slot = Arc::new(Mutex::new(state));

        match self.loops.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().lock().is_active() {
                    return Err(RuntimeError::AlreadyActive(key.clone()));
                }
                let _ = occupied.insert(slot);
            }
            Entry::Vacant(vacant) => {
                let _ = vacant.insert(slot);
            }
        }

        debug!(%loop_id, "execution loop created");
        let _ = self.emitter.emit(RuntimeEvent::LoopCreated {
            key: key.clone(),
            loop_id: loop_id.clone(),
        });
        Ok(loop_id)
    }

    /// Pause the loop on `delegations`, replacing its transcript.
    ///
    /// The pending set and the reverse index are updated before this returns,
    /// so a completion processed afterwards always finds the loop. Returns the
    /// number of pending delegations.
    #[instrument(skip_all, fields(key = %key, delegations = delegations.len()))]
    pub fn save_state(
        &self,
        key: &LoopKey,
        transcript: Vec<Message>,
        delegations: Vec<Delegation>,
    ) -> Result<usize, RuntimeError> {
        let pending = self.with_active(key, |state| {
            let change = state.pause(transcript, delegations)?;
            for id in &change.removed {
                let _ = self.awaiting.remove_if(id, |_, owner| owner == key);
            }
            for id in change.added {
                let _ = self.awaiting.insert(id, key.clone());
            }
            if !change.skipped.is_empty() {
                debug!(skipped = ?change.skipped, "delegations already completed, not re-pending");
            }
            Ok(state.pending.len())
        })?;

        debug!(pending, "execution loop paused");
        let _ = self.emitter.emit(RuntimeEvent::LoopPaused {
            key: key.clone(),
            pending,
        });
        Ok(pending)
    }

    /// Record the response to a pending delegation.
    ///
    /// A second completion for the same request is a no-op and reports
    /// `duplicate = true`.
    #[instrument(skip_all, fields(key = %key, request_event_id = %request_event_id))]
    pub fn record_completion(
        &self,
        key: &LoopKey,
        request_event_id: &EventId,
        response_event_id: impl Into<EventId>,
        response: impl Into<String>,
    ) -> Result<CompletionReport, RuntimeError> {
        let response_event_id = response_event_id.into();
        let response = response.into();
        let report = self.with_active(key, |state| {
            let report = state.complete(request_event_id, response_event_id, response)?;
            if !report.duplicate {
                let _ = self.answered.insert(request_event_id.clone(), key.clone());
                let _ = self.awaiting.remove(request_event_id);
            }
            Ok(report)
        })?;

        if report.duplicate {
            debug!("duplicate completion ignored");
        } else {
            debug!(
                completed = report.completed,
                pending = report.pending,
                "delegation completed"
            );
            let _ = self.emitter.emit(RuntimeEvent::DelegationCompleted {
                key: key.clone(),
                request_event_id: request_event_id.clone(),
                completed: report.completed,
                pending: report.pending,
            });
        }
        Ok(report)
    }

    /// Reactivate a paused loop.
    #[instrument(skip_all, fields(key = %key))]
    pub fn mark_resuming(&self, key: &LoopKey) -> Result<(), RuntimeError> {
        self.with_active(key, ExecutionLoopState::resume)?;
        debug!("execution loop resumed");
        let _ = self
            .emitter
            .emit(RuntimeEvent::LoopResumed { key: key.clone() });
        Ok(())
    }

    /// Queue an injection for the loop's next step boundary.
    ///
    /// Accepted while executing or paused. Returns the queue length.
    pub fn queue_event(
        &self,
        key: &LoopKey,
        kind: InjectionKind,
        content: impl Into<String>,
        source_event_id: impl Into<EventId>,
    ) -> Result<usize, RuntimeError> {
        self.queue_injection(key, Injection::new(kind, content, source_event_id))
    }

    /// Queue a prepared injection. Returns the queue length.
    ///
    /// A repeated delivery of the same source event is ignored and the
    /// current length is returned.
    pub fn queue_injection(
        &self,
        key: &LoopKey,
        injection: Injection,
    ) -> Result<usize, RuntimeError> {
        self.with_active(key, |state| {
            Ok(Self::enqueue_once(key, state, injection).unwrap_or(state.injections.len()))
        })
    }

    /// Queue an injection built from a transport event. `None` means the
    /// event was already queued during this loop's life.
    pub(crate) fn try_queue_event(
        &self,
        key: &LoopKey,
        kind: InjectionKind,
        content: impl Into<String>,
        source_event_id: impl Into<EventId>,
    ) -> Result<Option<usize>, RuntimeError> {
        let injection = Injection::new(kind, content, source_event_id);
        self.with_active(key, |state| Ok(Self::enqueue_once(key, state, injection)))
    }

    fn enqueue_once(
        key: &LoopKey,
        state: &mut ExecutionLoopState,
        injection: Injection,
    ) -> Option<usize> {
        let source = injection.source_event_id.clone();
        let queued = state.enqueue(injection);
        match queued {
            Some(len) => {
                debug!(key = %key, source_event_id = %source, queued = len, "injection queued");
            }
            None => debug!(key = %key, source_event_id = %source, "repeated injection ignored"),
        }
        queued
    }

    /// Take every queued injection in arrival order.
    ///
    /// Drained injections are appended to the transcript in the same critical
    /// section and never returned again.
    pub fn drain_injections(&self, key: &LoopKey) -> Result<Vec<Injection>, RuntimeError> {
        self.with_active(key, |state| Ok(state.drain()))
    }

    /// Still-queued injection produced by `source_event_id`, if any.
    pub fn pending_injection(&self, key: &LoopKey, source_event_id: &EventId) -> Option<Injection> {
        self.with_active(key, |state| Ok(state.queued(source_event_id).cloned()))
            .ok()
            .flatten()
    }

    /// Replace a still-queued injection in place.
    ///
    /// Returns `false` if it was already drained.
    pub fn replace_injection(
        &self,
        key: &LoopKey,
        source_event_id: &EventId,
        replacement: Injection,
    ) -> Result<bool, RuntimeError> {
        self.with_active(key, |state| {
            Ok(state.replace_injection(source_event_id, replacement))
        })
    }

    /// Finish an executing loop and remove it.
    ///
    /// Undrained injections are discarded with a warning. Paused loops must
    /// be resumed first.
    #[instrument(skip_all, fields(key = %key))]
    pub fn clear(&self, key: &LoopKey) -> Result<LoopId, RuntimeError> {
        let slot = self.slot(key)?;
        let (loop_id, discarded) = {
            let mut state = slot.lock();
            self.retire(key, &mut state)?
        };
        if discarded > 0 {
            warn!(discarded, "execution loop finished with undrained injections");
        }
        Ok(self.remove_finished(key, &slot, loop_id))
    }

    /// Finish an executing loop unless injections are waiting.
    ///
    /// Waiting injections are drained and returned instead, and the loop
    /// stays `Executing`. The check and the transition are one critical
    /// section, so no injection is lost to a concurrent finish.
    #[instrument(skip_all, fields(key = %key))]
    pub fn finish(&self, key: &LoopKey) -> Result<FinishOutcome, RuntimeError> {
        let slot = self.slot(key)?;
        let loop_id = {
            let mut state = slot.lock();
            if state.status == LoopStatus::Executing && !state.injections.is_empty() {
                let drained = state.drain();
                debug!(injections = drained.len(), "finish deferred by queued injections");
                return Ok(FinishOutcome::Deferred(drained));
            }
            self.retire(key, &mut state)?.0
        };
        Ok(FinishOutcome::Finished(self.remove_finished(key, &slot, loop_id)))
    }

    fn remove_finished(&self, key: &LoopKey, slot: &Slot, loop_id: LoopId) -> LoopId {
        let _ = self
            .loops
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
        debug!(%loop_id, "execution loop finished");
        let _ = self.emitter.emit(RuntimeEvent::LoopFinished {
            key: key.clone(),
            loop_id: loop_id.clone(),
        });
        loop_id
    }

    /// Move a live state to `Done`, drop its index entries and stop its
    /// in-flight work. Returns the loop ID and the discarded injection count.
    fn retire(
        &self,
        key: &LoopKey,
        state: &mut ExecutionLoopState,
    ) -> Result<(LoopId, usize), RuntimeError> {
        if !state.is_active() {
            return Err(RuntimeError::NotFound(key.clone()));
        }
        state.finish()?;
        let mut finished = self.finished.lock();
        for delegation in &state.pending {
            let _ = self
                .awaiting
                .remove_if(&delegation.request_event_id, |_, owner| owner == key);
            finished.insert(delegation.request_event_id.clone(), key.clone());
        }
        for done in &state.completed {
            let _ = self
                .answered
                .remove_if(&done.request_event_id, |_, owner| owner == key);
            finished.insert(done.request_event_id.clone(), key.clone());
        }
        drop(finished);
        state.cancel.cancel();
        Ok((state.id.clone(), state.injections.len()))
    }

    /// Loop waiting on `request_event_id`, if any.
    pub fn find_loop_awaiting_delegation(&self, request_event_id: &EventId) -> Option<LoopKey> {
        self.awaiting
            .get(request_event_id)
            .map(|entry| entry.value().clone())
    }

    /// Live loop that already recorded a completion for `request_event_id`.
    pub fn find_loop_with_completed(&self, request_event_id: &EventId) -> Option<LoopKey> {
        self.answered
            .get(request_event_id)
            .map(|entry| entry.value().clone())
    }

    /// Finished loop that had issued `request_event_id`, if still remembered.
    pub fn find_finished_delegation(&self, request_event_id: &EventId) -> Option<LoopKey> {
        self.finished.lock().get(request_event_id)
    }

    // ── Tool tracking ───────────────────────────────────────────────────

    /// Record that a tool started; returns the token it must observe.
    pub fn begin_tool(
        &self,
        key: &LoopKey,
        name: impl Into<String>,
    ) -> Result<CancellationToken, RuntimeError> {
        let name = name.into();
        self.with_active(key, |state| {
            state.current_tool = Some(ToolInFlight {
                name,
                started_at: chrono::Utc::now(),
            });
            Ok(state.cancel.clone())
        })
    }

    /// Record that the current tool finished.
    pub fn end_tool(&self, key: &LoopKey) -> Result<Option<ToolInFlight>, RuntimeError> {
        self.with_active(key, |state| Ok(state.current_tool.take()))
    }

    /// Cancel in-flight work for the loop. The loop itself stays registered.
    #[instrument(skip_all, fields(key = %key))]
    pub fn abort_tool(&self, key: &LoopKey) -> Result<Option<ToolInFlight>, RuntimeError> {
        let aborted = self.with_active(key, |state| Ok(state.cancel_in_flight()))?;
        if let Some(tool) = &aborted {
            debug!(tool = %tool.name, "in-flight tool aborted");
        }
        Ok(aborted)
    }

    /// Current cancellation token of the loop.
    pub fn cancellation_token(&self, key: &LoopKey) -> Result<CancellationToken, RuntimeError> {
        self.with_active(key, |state| Ok(state.cancel.clone()))
    }

    /// Cancel in-flight work of every loop in `conversation_id`.
    ///
    /// With `project_id`, only loops bound to that project are cancelled;
    /// loops with no project are left alone.
    /// Returns the number of loops cancelled.
    pub fn cancel_conversation(
        &self,
        conversation_id: &ConversationId,
        project_id: Option<&ProjectId>,
    ) -> usize {
        let slots: Vec<Slot> = self
            .loops
            .iter()
            .filter(|entry| &entry.key().conversation_id == conversation_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut cancelled = 0;
        for slot in slots {
            let mut state = slot.lock();
            if !state.is_active() {
                continue;
            }
            let in_project = match project_id {
                Some(wanted) => state.project_id.as_ref() == Some(wanted),
                None => true,
            };
            if in_project {
                let _ = state.cancel_in_flight();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(conversation_id = %conversation_id, cancelled, "conversation work cancelled");
        }
        cancelled
    }

    // ── Transcript ──────────────────────────────────────────────────────

    /// Append a message to the loop's transcript. Returns the new length.
    pub fn append_message(&self, key: &LoopKey, message: Message) -> Result<usize, RuntimeError> {
        self.with_active(key, |state| {
            state.transcript.push(message);
            Ok(state.transcript.len())
        })
    }

    /// Copy of the loop's transcript.
    pub fn transcript(&self, key: &LoopKey) -> Result<Vec<Message>, RuntimeError> {
        self.with_active(key, |state| Ok(state.transcript.clone()))
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Status view of one loop.
    pub fn snapshot(&self, key: &LoopKey) -> Option<LoopSnapshot> {
        self.with_active(key, |state| Ok(state.snapshot())).ok()
    }

    /// Status views of every live loop, oldest first.
    pub fn list(&self) -> Vec<LoopSnapshot> {
        let slots: Vec<Slot> = self
            .loops
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots: Vec<LoopSnapshot> = slots
            .iter()
            .filter_map(|slot| {
                let state = slot.lock();
                state.is_active().then(|| state.snapshot())
            })
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Whether a non-finished loop exists for `key`.
    pub fn is_active(&self, key: &LoopKey) -> bool {
        self.snapshot(key).is_some()
    }

    /// Status of the loop for `key`, if live.
    pub fn status(&self, key: &LoopKey) -> Option<LoopStatus> {
        self.with_active(key, |state| Ok(state.status)).ok()
    }

    /// Number of registered loops.
    pub fn active_count(&self) -> usize {
        self.loops.len()
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
