//! Keyed store of per-project execution locks.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_core::{ConversationId, ProjectId};
use relay_settings::ExecutionSettings;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::emitter::{RuntimeEvent, RuntimeEventEmitter};
use crate::errors::RuntimeError;
use crate::mutex::lock::{
    AcquireOutcome, ExecutionLock, Handoff, ProjectLockState, QueueEntry, TimeoutAction,
};

/// Lock timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutexConfig {
    /// Grant duration before auto-release.
    pub lock_timeout: TimeDelta,
    /// Warning offset before expiry.
    pub warning_lead: TimeDelta,
}

fn millis(ms: u64) -> TimeDelta {
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}

impl From<&ExecutionSettings> for MutexConfig {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            lock_timeout: millis(settings.lock_timeout_ms),
            warning_lead: millis(settings.warning_lead_ms),
        }
    }
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self::from(&ExecutionSettings::default())
    }
}

/// Holder and queue of one project, for status queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectLockStatus {
    /// Project.
    pub project_id: ProjectId,
    /// Current grant.
    pub holder: Option<ExecutionLock>,
    /// Waiting entries in FIFO order.
    pub queue: Vec<QueueEntry>,
}

/// A timeout action taken for one project by [`ProjectExecutionMutex::check_timeouts`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutEvent {
    /// Project the action applies to.
    pub project_id: ProjectId,
    /// What happened.
    pub action: TimeoutAction,
}

/// Per-project execution mutex with FIFO admission.
///
/// Lock state is created lazily on first acquire and lives for the life of
/// the mutex, cycling between held and unheld. Lock events are emitted while
/// the project's slot is still locked, so subscribers see each project's
/// transitions in the order they happened.
pub struct ProjectExecutionMutex {
    projects: DashMap<ProjectId, Arc<Mutex<ProjectLockState>>>,
    config: MutexConfig,
    emitter: Arc<RuntimeEventEmitter>,
}

impl ProjectExecutionMutex {
    /// Create a mutex with a private emitter.
    pub fn new(config: MutexConfig) -> Self {
        Self::with_emitter(config, Arc::new(RuntimeEventEmitter::new()))
    }

    /// Create a mutex publishing to `emitter`.
    pub fn with_emitter(config: MutexConfig, emitter: Arc<RuntimeEventEmitter>) -> Self {
        Self {
            projects: DashMap::new(),
            config,
            emitter,
        }
    }

    /// Lock timing in effect.
    pub fn config(&self) -> MutexConfig {
        self.config
    }

    fn project(&self, project_id: &ProjectId) -> Option<Arc<Mutex<ProjectLockState>>> {
        self.projects.get(project_id).map(|e| Arc::clone(e.value()))
    }

    fn project_or_insert(&self, project_id: &ProjectId) -> Arc<Mutex<ProjectLockState>> {
        if let Some(existing) = self.project(project_id) {
            return existing;
        }
        Arc::clone(self.projects.entry(project_id.clone()).or_default().value())
    }

    /// Acquire the project lock for `conversation_id` now.
    pub fn acquire(&self, project_id: &ProjectId, conversation_id: &ConversationId) -> AcquireOutcome {
        self.acquire_at(project_id, conversation_id, Utc::now())
    }

    /// Acquire as of `now`.
    #[instrument(skip_all, fields(project_id = %project_id, conversation_id = %conversation_id))]
    pub fn acquire_at(
        &self,
        project_id: &ProjectId,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
    ) -> AcquireOutcome {
        let slot = self.project_or_insert(project_id);
        let mut state = slot.lock();
        let outcome = state.acquire(conversation_id, now, self.config.lock_timeout);

        match &outcome {
            AcquireOutcome::Granted {
                expires_at,
                reentrant: false,
            } => {
                info!(%expires_at, "execution lock granted");
                let _ = self.emitter.emit(RuntimeEvent::LockGranted {
                    project_id: project_id.clone(),
                    conversation_id: conversation_id.clone(),
                    expires_at: *expires_at,
                });
            }
            AcquireOutcome::Granted { reentrant: true, .. } => {
                debug!("execution lock re-acquired by holder");
            }
            AcquireOutcome::Queued { position } => {
                debug!(position, "execution lock busy, queued");
                let _ = self.emitter.emit(RuntimeEvent::LockQueued {
                    project_id: project_id.clone(),
                    conversation_id: conversation_id.clone(),
                    position: *position,
                });
            }
        }
        drop(state);
        outcome
    }

    /// Release the lock held by `conversation_id` now.
    pub fn release(
        &self,
        project_id: &ProjectId,
        conversation_id: &ConversationId,
    ) -> Result<Handoff, RuntimeError> {
        self.release_at(project_id, conversation_id, Utc::now())
    }

    /// Release as of `now`; the queue head is granted in the same step.
    #[instrument(skip_all, fields(project_id = %project_id, conversation_id = %conversation_id))]
    pub fn release_at(
        &self,
        project_id: &ProjectId,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<Handoff, RuntimeError> {
        let not_holder = |holder: Option<ConversationId>| RuntimeError::NotHolder {
            project_id: project_id.clone(),
            conversation_id: conversation_id.clone(),
            holder,
        };
        let slot = self.project(project_id).ok_or_else(|| not_holder(None))?;
        let mut state = slot.lock();
        let Some(handoff) = state.release(conversation_id, now, self.config.lock_timeout) else {
            return Err(not_holder(state.current().map(|l| l.holder.clone())));
        };

        info!("execution lock released");
        let _ = self.emitter.emit(RuntimeEvent::LockReleased {
            project_id: project_id.clone(),
            conversation_id: conversation_id.clone(),
        });
        self.announce_next(project_id, &handoff);
        drop(state);
        Ok(handoff)
    }

    /// Release regardless of holder now.
    pub fn force_release(&self, project_id: &ProjectId, actor_id: &str) -> Option<Handoff> {
        self.force_release_at(project_id, actor_id, Utc::now())
    }

    /// Operator release as of `now`. Returns `None` if the lock was unheld.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %actor_id))]
    pub fn force_release_at(
        &self,
        project_id: &ProjectId,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Handoff> {
        let slot = self.project(project_id)?;
        let mut state = slot.lock();
        let Some(handoff) = state.force_release(now, self.config.lock_timeout) else {
            debug!("force release on unheld lock");
            return None;
        };

        warn!(
            evicted = %handoff.released.holder,
            remaining_secs = handoff.released.remaining(now).num_seconds(),
            "execution lock force-released"
        );
        let _ = self.emitter.emit(RuntimeEvent::LockForceReleased {
            project_id: project_id.clone(),
            conversation_id: handoff.released.holder.clone(),
            actor_id: actor_id.to_owned(),
        });
        self.announce_next(project_id, &handoff);
        drop(state);
        Some(handoff)
    }

    /// Warn holders entering the warning window and expire overdue ones.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<TimeoutEvent> {
        let slots: Vec<(ProjectId, Arc<Mutex<ProjectLockState>>)> = self
            .projects
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut events = Vec::new();
        for (project_id, slot) in slots {
            let mut state = slot.lock();
            let Some(action) =
                state.check_timeout(now, self.config.lock_timeout, self.config.warning_lead)
            else {
                continue;
            };

            match &action {
                TimeoutAction::Warning { holder, expires_at } => {
                    warn!(project_id = %project_id, holder = %holder, %expires_at, "execution lock expiring soon");
                    let _ = self.emitter.emit(RuntimeEvent::LockWarning {
                        project_id: project_id.clone(),
                        conversation_id: holder.clone(),
                        expires_at: *expires_at,
                    });
                }
                TimeoutAction::Expired(handoff) => {
                    warn!(project_id = %project_id, holder = %handoff.released.holder, "execution lock timed out");
                    let _ = self.emitter.emit(RuntimeEvent::LockTimedOut {
                        project_id: project_id.clone(),
                        conversation_id: handoff.released.holder.clone(),
                    });
                    self.announce_next(&project_id, handoff);
                }
            }
            drop(state);
            events.push(TimeoutEvent { project_id, action });
        }
        events
    }

    /// Drop a waiting conversation. Returns `false` if it was not queued.
    #[instrument(skip_all, fields(project_id = %project_id, conversation_id = %conversation_id))]
    pub fn remove_from_queue(&self, project_id: &ProjectId, conversation_id: &ConversationId) -> bool {
        let Some(slot) = self.project(project_id) else {
            return false;
        };
        let mut state = slot.lock();
        let removed = state.remove_from_queue(conversation_id);
        if removed {
            debug!("queue entry removed");
            let _ = self.emitter.emit(RuntimeEvent::QueueEntryRemoved {
                project_id: project_id.clone(),
                conversation_id: conversation_id.clone(),
            });
        }
        drop(state);
        removed
    }

    /// Holder and queue of a project. Unknown projects report unheld.
    pub fn status(&self, project_id: &ProjectId) -> ProjectLockStatus {
        let (holder, queue) = self.project(project_id).map_or((None, Vec::new()), |slot| {
            let state = slot.lock();
            (state.current().cloned(), state.queue().cloned().collect())
        });
        ProjectLockStatus {
            project_id: project_id.clone(),
            holder,
            queue,
        }
    }

    /// Status of every project seen so far, sorted by project ID.
    pub fn statuses(&self) -> Vec<ProjectLockStatus> {
        let mut ids: Vec<ProjectId> = self.projects.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().map(|id| self.status(id)).collect()
    }

    /// 0 for the holder, 1-based for waiters, `None` otherwise.
    pub fn queue_position(&self, project_id: &ProjectId, conversation_id: &ConversationId) -> Option<usize> {
        let slot = self.project(project_id)?;
        let position = slot.lock().position(conversation_id);
        position
    }

    /// Current holder of a project's lock.
    pub fn holder(&self, project_id: &ProjectId) -> Option<ConversationId> {
        let slot = self.project(project_id)?;
        let holder = slot.lock().current().map(|l| l.holder.clone());
        holder
    }

    fn announce_next(&self, project_id: &ProjectId, handoff: &Handoff) {
        if let Some(next) = &handoff.next {
            info!(project_id = %project_id, holder = %next.holder, "execution lock handed to next in queue");
            let _ = self.emitter.emit(RuntimeEvent::LockGranted {
                project_id: project_id.clone(),
                conversation_id: next.holder.clone(),
                expires_at: next.expires_at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        t0() + TimeDelta::minutes(minutes)
    }

    fn mutex() -> ProjectExecutionMutex {
        ProjectExecutionMutex::new(MutexConfig::default())
    }

    fn p() -> ProjectId {
        ProjectId::from("proj")
    }

    fn c(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn config_from_settings() {
        let config = MutexConfig::default();
        assert_eq!(config.lock_timeout, TimeDelta::minutes(30));
        assert_eq!(config.warning_lead, TimeDelta::minutes(5));
        assert_eq!(millis(u64::MAX), TimeDelta::MAX);
    }

    #[test]
    fn acquire_release_handoff() {
        let m = mutex();
        assert!(m.acquire_at(&p(), &c("x"), t0()).is_granted());
        assert_eq!(m.acquire_at(&p(), &c("y"), t0()), AcquireOutcome::Queued { position: 1 });
        assert_eq!(m.queue_position(&p(), &c("y")), Some(1));

        let handoff = m.release_at(&p(), &c("x"), at(2)).unwrap();
        assert_eq!(handoff.next.map(|l| l.holder), Some(c("y")));
        assert_eq!(m.holder(&p()), Some(c("y")));
        assert!(m.status(&p()).queue.is_empty());
    }

    #[test]
    fn release_by_non_holder_fails() {
        let m = mutex();
        let _ = m.acquire_at(&p(), &c("x"), t0());
        let err = m.release_at(&p(), &c("y"), t0()).unwrap_err();
        assert_matches!(err, RuntimeError::NotHolder { holder: Some(h), .. } if h == c("x"));

        let err = m.release_at(&ProjectId::from("unknown"), &c("y"), t0()).unwrap_err();
        assert_matches!(err, RuntimeError::NotHolder { holder: None, .. });
    }

    #[test]
    fn projects_are_independent() {
        let m = mutex();
        assert!(m.acquire_at(&ProjectId::from("a"), &c("x"), t0()).is_granted());
        assert!(m.acquire_at(&ProjectId::from("b"), &c("y"), t0()).is_granted());
        assert_eq!(m.statuses().len(), 2);
    }

    #[test]
    fn force_release_frees_immediately() {
        let m = mutex();
        let _ = m.acquire_at(&p(), &c("x"), t0());
        let handoff = m.force_release_at(&p(), "operator", at(10)).unwrap();
        assert_eq!(handoff.released.holder, c("x"));
        assert_eq!(m.holder(&p()), None);
        assert!(m.force_release_at(&p(), "operator", at(11)).is_none());
        assert!(m.force_release_at(&ProjectId::from("never"), "operator", at(11)).is_none());
    }

    #[test]
    fn timeouts_warn_then_expire() {
        let m = mutex();
        let _ = m.acquire_at(&p(), &c("x"), t0());
        let _ = m.acquire_at(&p(), &c("y"), t0());

        assert!(m.check_timeouts(at(20)).is_empty());
        let warned = m.check_timeouts(at(25));
        assert_eq!(warned.len(), 1);
        assert_matches!(warned[0].action, TimeoutAction::Warning { .. });
        assert!(m.check_timeouts(at(27)).is_empty());

        let expired = m.check_timeouts(at(30));
        assert_matches!(
            &expired[0].action,
            TimeoutAction::Expired(Handoff { next: Some(next), .. }) if next.holder == c("y")
        );
        assert_eq!(m.holder(&p()), Some(c("y")));
    }

    #[test]
    fn timeout_and_force_release_log_warnings() {
        let (logs, _guard) = relay_core::logging::capture_logs();
        let m = mutex();
        let _ = m.acquire_at(&p(), &c("x"), t0());
        let _ = m.check_timeouts(at(26));
        let _ = m.check_timeouts(at(31));
        let _ = m.acquire_at(&p(), &c("y"), at(32));
        let _ = m.force_release_at(&p(), "operator", at(33));

        assert!(logs.has_event(tracing::Level::WARN, "execution lock expiring soon"));
        assert!(logs.has_event(tracing::Level::WARN, "execution lock timed out"));
        assert!(logs.has_event(tracing::Level::WARN, "execution lock force-released"));
        let forced = logs
            .events()
            .into_iter()
            .find(|e| e.message.contains("force-released"))
            .unwrap();
        assert_eq!(forced.field("evicted"), Some("y"));
    }

    #[test]
    fn remove_from_queue_and_status() {
        let m = mutex();
        let _ = m.acquire_at(&p(), &c("x"), t0());
        let _ = m.acquire_at(&p(), &c("y"), t0());
        let _ = m.acquire_at(&p(), &c("z"), t0());

        assert!(m.remove_from_queue(&p(), &c("y")));
        assert!(!m.remove_from_queue(&p(), &c("y")));
        assert!(!m.remove_from_queue(&ProjectId::from("other"), &c("z")));

        let status = m.status(&p());
        assert_eq!(status.holder.map(|l| l.holder), Some(c("x")));
        assert_eq!(
            status.queue.iter().map(|e| e.conversation_id.clone()).collect::<Vec<_>>(),
            vec![c("z")]
        );
    }

    #[test]
    fn unknown_project_status_is_unheld() {
        let status = mutex().status(&ProjectId::from("nothing"));
        assert!(status.holder.is_none());
        assert!(status.queue.is_empty());
    }

    #[test]
    fn concurrent_handoffs_emit_events_in_order() {
        const WORKERS: usize = 8;
        let emitter = Arc::new(RuntimeEventEmitter::with_capacity(1024));
        let m = Arc::new(ProjectExecutionMutex::with_emitter(
            MutexConfig::default(),
            Arc::clone(&emitter),
        ));
        let mut rx = emitter.subscribe();

        let workers: Vec<_> = (0..WORKERS)
            .map(|i| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    let me = c(&format!("w{i}"));
                    let _ = m.acquire(&p(), &me);
                    while m.queue_position(&p(), &me) != Some(0) {
                        std::thread::yield_now();
                    }
                    let _ = m.release(&p(), &me).unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut holder: Option<ConversationId> = None;
        let mut grants = 0;
        for event in drain(&mut rx) {
            match event {
                RuntimeEvent::LockGranted { conversation_id, .. } => {
                    assert_eq!(holder, None, "granted to {conversation_id} while held");
                    holder = Some(conversation_id);
                    grants += 1;
                }
                RuntimeEvent::LockReleased { conversation_id, .. } => {
                    assert_eq!(holder.take(), Some(conversation_id));
                }
                _ => {}
            }
        }
        assert_eq!(grants, WORKERS);
        assert_eq!(holder, None);
    }

    #[tokio::test]
    async fn emits_lock_events() {
        let m = mutex();
        let mut rx = m.emitter.subscribe();

        let _ = m.acquire_at(&p(), &c("x"), t0());
        let _ = m.acquire_at(&p(), &c("y"), t0());
        let _ = m.release_at(&p(), &c("x"), at(1)).unwrap();
        let _ = m.force_release_at(&p(), "admin", at(2));

        let types: Vec<&str> = drain(&mut rx).iter().map(RuntimeEvent::event_type).collect();
        assert_eq!(
            types,
            vec![
                "lock_granted",
                "lock_queued",
                "lock_released",
                "lock_granted",
                "lock_force_released"
            ]
        );
    }
}
