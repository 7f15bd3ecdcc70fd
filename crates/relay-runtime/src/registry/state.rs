//! Per-loop state and its transitions.
//!
//! [`ExecutionLoopState`] is only ever touched under its registry slot's
//! mutex, so every method here is a plain `&mut self` state transition.
//! Reverse-index bookkeeping is returned to the caller, which applies it
//! inside the same critical section.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use relay_core::{AgentId, EventId, LoopId, Message, ProjectId};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::errors::RuntimeError;
use crate::types::{
    CompletedDelegation, CompletionReport, Delegation, Injection, LoopKey, LoopStatus,
    ToolInFlight,
};

/// Runtime state of one execution loop.
#[derive(Debug)]
pub struct ExecutionLoopState {
    pub(crate) id: LoopId,
    pub(crate) key: LoopKey,
    pub(crate) project_id: Option<ProjectId>,
    pub(crate) transcript: Vec<Message>,
    pub(crate) pending: Vec<Delegation>,
    pub(crate) completed: Vec<CompletedDelegation>,
    pub(crate) injections: VecDeque<Injection>,
    /// Source events already queued during this loop's life.
    pub(crate) seen_sources: HashSet<EventId>,
    pub(crate) status: LoopStatus,
    pub(crate) current_tool: Option<ToolInFlight>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity_at: DateTime<Utc>,
    pub(crate) paused_at: Option<DateTime<Utc>>,
    pub(crate) cancel: CancellationToken,
}

/// Index changes produced by a pause.
#[derive(Debug, Default)]
pub(crate) struct PauseChange {
    /// Request IDs newly pending.
    pub added: Vec<EventId>,
    /// Request IDs no longer pending (dropped by the caller).
    pub removed: Vec<EventId>,
    /// Request IDs ignored because they were already completed.
    pub skipped: Vec<EventId>,
}

/// Read-only view of a loop for status queries.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSnapshot {
    /// Loop instance ID.
    pub id: LoopId,
    /// Loop key.
    pub key: LoopKey,
    /// Project the loop runs in, if known.
    pub project_id: Option<ProjectId>,
    /// Current status.
    pub status: LoopStatus,
    /// Outstanding delegations.
    pub pending_delegations: Vec<Delegation>,
    /// Answered delegations.
    pub completed_delegations: Vec<CompletedDelegation>,
    /// Injections waiting for the next drain.
    pub queued_injections: usize,
    /// Tool currently running.
    pub current_tool: Option<ToolInFlight>,
    /// Number of transcript entries.
    pub transcript_len: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub last_activity_at: DateTime<Utc>,
    /// When the loop last paused, while it remains paused.
    pub paused_since: Option<DateTime<Utc>>,
}

impl ExecutionLoopState {
    pub(crate) fn new(key: LoopKey, project_id: Option<ProjectId>) -> Self {
        let now = Utc::now();
        Self {
            id: LoopId::new(),
            key,
            project_id,
            transcript: Vec::new(),
            pending: Vec::new(),
            completed: Vec::new(),
            injections: VecDeque::new(),
            seen_sources: HashSet::new(),
            status: LoopStatus::Executing,
            current_tool: None,
            created_at: now,
            last_activity_at: now,
            paused_at: None,
            cancel: CancellationToken::new(),
        }
    }

    fn invalid(&self, operation: &'static str) -> RuntimeError {
        RuntimeError::InvalidState {
            key: self.key.clone(),
            status: self.status,
            operation,
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub(crate) fn is_active(&self) -> bool {
        self.status != LoopStatus::Done
    }

    /// `Executing → Paused`, replacing the transcript and the pending set.
    pub(crate) fn pause(
        &mut self,
        transcript: Vec<Message>,
        delegations: Vec<Delegation>,
    ) -> Result<PauseChange, RuntimeError> {
        if self.status != LoopStatus::Executing {
            return Err(self.invalid("save_state"));
        }

        let mut change = PauseChange::default();
        let mut next: Vec<Delegation> = Vec::with_capacity(delegations.len());
        for delegation in delegations {
            let id = &delegation.request_event_id;
            if self.completed.iter().any(|c| &c.request_event_id == id) {
                change.skipped.push(id.clone());
            } else if !next.iter().any(|d| &d.request_event_id == id) {
                next.push(delegation);
            }
        }
        if next.is_empty() {
            return Err(self.invalid("save_state without pending delegations"));
        }

        for old in &self.pending {
            if !next.iter().any(|d| d.request_event_id == old.request_event_id) {
                change.removed.push(old.request_event_id.clone());
            }
        }
        for new in &next {
            if !self.pending.iter().any(|d| d.request_event_id == new.request_event_id) {
                change.added.push(new.request_event_id.clone());
            }
        }

        self.transcript = transcript;
        self.pending = next;
        self.status = LoopStatus::Paused;
        self.paused_at = Some(Utc::now());
        self.touch();
        Ok(change)
    }

    /// Move a pending delegation to the completed set.
    ///
    /// A request that is already completed yields a report with
    /// `duplicate = true` and changes nothing.
    pub(crate) fn complete(
        &mut self,
        request_event_id: &EventId,
        response_event_id: EventId,
        response: String,
    ) -> Result<CompletionReport, RuntimeError> {
        if let Some(done) = self
            .completed
            .iter()
            .find(|c| &c.request_event_id == request_event_id)
        {
            let recipient_id = done.recipient_id.clone();
            return Ok(self.report(recipient_id, true));
        }

        let Some(index) = self
            .pending
            .iter()
            .position(|d| &d.request_event_id == request_event_id)
        else {
            return Err(RuntimeError::UnknownDelegation {
                key: self.key.clone(),
                request_event_id: request_event_id.clone(),
            });
        };

        let delegation = self.pending.remove(index);
        let recipient_id = delegation.recipient_id.clone();
        self.completed.push(CompletedDelegation {
            request_event_id: delegation.request_event_id,
            recipient_id: delegation.recipient_id,
            response,
            response_event_id,
            completed_at: Utc::now(),
        });
        self.touch();
        Ok(self.report(recipient_id, false))
    }

    fn report(&self, recipient_id: AgentId, duplicate: bool) -> CompletionReport {
        CompletionReport {
            completed: self.completed.len(),
            pending: self.pending.len(),
            recipient_id,
            still_waiting_on: self.pending.iter().map(|d| d.recipient_id.clone()).collect(),
            duplicate,
        }
    }

    /// `Paused → Executing`.
    pub(crate) fn resume(&mut self) -> Result<(), RuntimeError> {
        if self.status != LoopStatus::Paused {
            return Err(self.invalid("mark_resuming"));
        }
        self.status = LoopStatus::Executing;
        self.paused_at = None;
        self.touch();
        Ok(())
    }

    /// `Executing → Done`.
    pub(crate) fn finish(&mut self) -> Result<(), RuntimeError> {
        if self.status != LoopStatus::Executing {
            return Err(self.invalid("clear"));
        }
        self.status = LoopStatus::Done;
        self.current_tool = None;
        self.touch();
        Ok(())
    }

    /// Append an injection; returns the queue length.
    ///
    /// Returns `None` if an injection from the same source event was queued
    /// before, whether or not it has been drained since.
    pub(crate) fn enqueue(&mut self, injection: Injection) -> Option<usize> {
        if !self.seen_sources.insert(injection.source_event_id.clone()) {
            return None;
        }
        self.injections.push_back(injection);
        self.touch();
        Some(self.injections.len())
    }

    /// Take every queued injection and record it in the transcript.
    pub(crate) fn drain(&mut self) -> Vec<Injection> {
        if self.injections.is_empty() {
            return Vec::new();
        }
        let drained: Vec<Injection> = self.injections.drain(..).collect();
        self.transcript
            .extend(drained.iter().map(Injection::to_message));
        self.touch();
        drained
    }

    /// Queued injection originating from `source_event_id`, if still undrained.
    pub(crate) fn queued(&self, source_event_id: &EventId) -> Option<&Injection> {
        self.injections
            .iter()
            .find(|i| &i.source_event_id == source_event_id)
    }

    /// Swap a still-queued injection in place, keeping its queue position.
    pub(crate) fn replace_injection(
        &mut self,
        source_event_id: &EventId,
        replacement: Injection,
    ) -> bool {
        match self
            .injections
            .iter_mut()
            .find(|i| &i.source_event_id == source_event_id)
        {
            Some(slot) => {
                *slot = replacement;
                self.touch();
                true
            }
            None => false,
        }
    }

    /// Cancel in-flight work and arm a fresh token for later steps.
    pub(crate) fn cancel_in_flight(&mut self) -> Option<ToolInFlight> {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.touch();
        self.current_tool.take()
    }

    pub(crate) fn snapshot(&self) -> LoopSnapshot {
        LoopSnapshot {
            id: self.id.clone(),
            key: self.key.clone(),
            project_id: self.project_id.clone(),
            status: self.status,
            pending_delegations: self.pending.clone(),
            completed_delegations: self.completed.clone(),
            queued_injections: self.injections.len(),
            current_tool: self.current_tool.clone(),
            transcript_len: self.transcript.len(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            paused_since: self.paused_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::types::InjectionKind;

    fn state() -> ExecutionLoopState {
        ExecutionLoopState::new(LoopKey::new("a", "c"), None)
    }

    fn delegations(ids: &[(&str, &str)]) -> Vec<Delegation> {
        ids.iter()
            .map(|(id, to)| Delegation::new(*id, *to, format!("task for {to}")))
            .collect()
    }

    #[test]
    fn new_state_is_executing_and_empty() {
        let s = state();
        assert_eq!(s.status, LoopStatus::Executing);
        assert!(s.transcript.is_empty());
        assert!(s.pending.is_empty());
        assert!(s.injections.is_empty());
        assert!(!s.cancel.is_cancelled());
    }

    #[test]
    fn pause_records_pending_and_transcript() {
        let mut s = state();
        let change = s
            .pause(vec![Message::user("go")], delegations(&[("r1", "b"), ("r2", "c")]))
            .unwrap();
        assert_eq!(s.status, LoopStatus::Paused);
        assert_eq!(s.pending.len(), 2);
        assert_eq!(s.transcript.len(), 1);
        assert_eq!(change.added, vec![EventId::from("r1"), EventId::from("r2")]);
        assert!(change.removed.is_empty());
        assert!(s.paused_at.is_some());
    }

    #[test]
    fn pause_twice_is_invalid() {
        let mut s = state();
        let _ = s.pause(vec![], delegations(&[("r1", "b")])).unwrap();
        let err = s.pause(vec![], delegations(&[("r2", "c")])).unwrap_err();
        assert_matches!(
            err,
            RuntimeError::InvalidState { status: LoopStatus::Paused, operation: "save_state", .. }
        );
    }

    #[test]
    fn pause_without_delegations_is_invalid() {
        let mut s = state();
        assert_matches!(
            s.pause(vec![], vec![]),
            Err(RuntimeError::InvalidState { .. })
        );
        assert_eq!(s.status, LoopStatus::Executing);
    }

    #[test]
    fn pause_deduplicates_and_skips_completed() {
        let mut s = state();
        let _ = s.pause(vec![], delegations(&[("r1", "b"), ("r2", "c")])).unwrap();
        let _ = s.complete(&EventId::from("r1"), "resp1".into(), "done".into()).unwrap();
        s.resume().unwrap();

        let change = s
            .pause(vec![], delegations(&[("r1", "b"), ("r2", "c"), ("r2", "c"), ("r3", "d")]))
            .unwrap();
        assert_eq!(change.skipped, vec![EventId::from("r1")]);
        assert_eq!(change.added, vec![EventId::from("r3")]);
        assert!(change.removed.is_empty());
        assert_eq!(s.pending.len(), 2);
    }

    #[test]
    fn repause_reports_dropped_requests() {
        let mut s = state();
        let _ = s.pause(vec![], delegations(&[("r1", "b"), ("r2", "c")])).unwrap();
        let _ = s.complete(&EventId::from("r1"), "x".into(), "ok".into()).unwrap();
        s.resume().unwrap();

        let change = s.pause(vec![], delegations(&[("r3", "d")])).unwrap();
        assert_eq!(change.removed, vec![EventId::from("r2")]);
        assert_eq!(change.added, vec![EventId::from("r3")]);
    }

    #[test]
    fn complete_moves_pending_to_completed_once() {
        let mut s = state();
        let _ = s.pause(vec![], delegations(&[("r1", "b"), ("r2", "c")])).unwrap();

        let report = s.complete(&EventId::from("r1"), "resp1".into(), "hi".into()).unwrap();
        assert_eq!((report.completed, report.pending), (1, 1));
        assert_eq!(report.recipient_id, AgentId::from("b"));
        assert_eq!(report.still_waiting_on, vec![AgentId::from("c")]);
        assert!(!report.duplicate);

        let again = s.complete(&EventId::from("r1"), "resp1b".into(), "hi".into()).unwrap();
        assert!(again.duplicate);
        assert_eq!((again.completed, again.pending), (1, 1));
        assert_eq!(s.completed.len(), 1);
        assert_eq!(s.completed[0].response_event_id, EventId::from("resp1"));
    }

    #[test]
    fn complete_unknown_request_fails() {
        let mut s = state();
        let _ = s.pause(vec![], delegations(&[("r1", "b")])).unwrap();
        assert_matches!(
            s.complete(&EventId::from("nope"), "x".into(), "y".into()),
            Err(RuntimeError::UnknownDelegation { .. })
        );
    }

    #[test]
    fn resume_only_from_paused() {
        let mut s = state();
        assert_matches!(s.resume(), Err(RuntimeError::InvalidState { .. }));
        let _ = s.pause(vec![], delegations(&[("r1", "b")])).unwrap();
        s.resume().unwrap();
        assert_eq!(s.status, LoopStatus::Executing);
        assert!(s.paused_at.is_none());
    }

    #[test]
    fn finish_from_paused_is_rejected() {
        let mut s = state();
        let _ = s.pause(vec![], delegations(&[("r1", "b")])).unwrap();
        assert_matches!(
            s.finish(),
            Err(RuntimeError::InvalidState { status: LoopStatus::Paused, operation: "clear", .. })
        );
        s.resume().unwrap();
        s.finish().unwrap();
        assert_eq!(s.status, LoopStatus::Done);
        assert!(!s.is_active());
    }

    #[test]
    fn drain_returns_in_order_and_records_transcript() {
        let mut s = state();
        assert_eq!(s.enqueue(Injection::new(InjectionKind::User, "one", "e1")), Some(1));
        assert_eq!(s.enqueue(Injection::new(InjectionKind::System, "two", "e2")), Some(2));

        let drained = s.drain();
        assert_eq!(
            drained.iter().map(|i| i.content.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        assert_eq!(s.transcript.len(), 2);
        assert!(s.drain().is_empty());
        assert_eq!(s.transcript.len(), 2);
    }

    #[test]
    fn enqueue_ignores_repeated_source() {
        let mut s = state();
        assert_eq!(s.enqueue(Injection::new(InjectionKind::User, "hi", "e1")), Some(1));
        assert_eq!(s.enqueue(Injection::new(InjectionKind::User, "hi", "e1")), None);
        assert_eq!(s.drain().len(), 1);

        assert_eq!(s.enqueue(Injection::new(InjectionKind::User, "hi", "e1")), None);
        assert!(s.drain().is_empty());
        assert_eq!(s.transcript.len(), 1);
    }

    #[test]
    fn replace_injection_only_while_queued() {
        let mut s = state();
        let _ = s.enqueue(Injection::new(InjectionKind::User, "hello", "e1"));
        let _ = s.enqueue(Injection::new(InjectionKind::User, "later", "e2"));

        let replaced = s.replace_injection(
            &EventId::from("e1"),
            Injection::new(InjectionKind::System, "ack: hello", "e1"),
        );
        assert!(replaced);
        assert_eq!(s.injections[0].kind, InjectionKind::System);
        assert_eq!(s.injections[1].content, "later");

        let _ = s.drain();
        assert!(!s.replace_injection(
            &EventId::from("e2"),
            Injection::new(InjectionKind::System, "late", "e2"),
        ));
    }

    #[test]
    fn cancel_in_flight_rearms_token() {
        let mut s = state();
        let old = s.cancel.clone();
        s.current_tool = Some(ToolInFlight {
            name: "shell".into(),
            started_at: Utc::now(),
        });

        let aborted = s.cancel_in_flight();
        assert_eq!(aborted.map(|t| t.name), Some("shell".to_string()));
        assert!(old.is_cancelled());
        assert!(!s.cancel.is_cancelled());
        assert!(s.current_tool.is_none());
    }
}
