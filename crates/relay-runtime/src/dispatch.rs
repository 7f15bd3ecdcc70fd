//! Routing of incoming transport events.
//!
//! Delegation completions go to the detector. Everything else addressed to
//! an agent either starts a loop for `(recipient, conversation)` or is
//! injected into the loop already running there.

use std::sync::Arc;

use relay_core::{EventId, IncomingEvent, LoopId, ProjectId};
use tracing::{debug, instrument};

use crate::busy_ack::BusyAckGenerator;
use crate::delegation::{CompletionHandled, DelegationDetector, DetectorOutcome};
use crate::errors::RuntimeError;
use crate::registry::ExecutionRegistry;
use crate::types::{InjectionKind, LoopKey};

/// Tag naming the project an event's work belongs to.
pub const PROJECT_TAG: &str = "project";

/// Create/inject races are retried this many times before giving up.
const MAX_ROUTE_ATTEMPTS: usize = 3;

/// What [`EventDispatcher::dispatch`] did with an event.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A pending delegation was completed.
    Completion(CompletionHandled),
    /// A repeated completion was ignored.
    DuplicateCompletion {
        /// Loop that already recorded it.
        key: LoopKey,
        /// Request that was answered.
        request_event_id: EventId,
    },
    /// A completion lost the race with its loop finishing.
    DroppedCompletion {
        /// Request the event answered.
        request_event_id: EventId,
        /// Why it was dropped.
        reason: String,
    },
    /// A new loop was started; the event is its first injection.
    Created {
        /// New loop.
        key: LoopKey,
        /// Loop instance ID.
        loop_id: LoopId,
        /// Project from the event's tags.
        project_id: Option<ProjectId>,
    },
    /// The event was queued into a running loop.
    Injected {
        /// Target loop.
        key: LoopKey,
        /// Queue length after the injection.
        queued: usize,
        /// A busy acknowledgment was scheduled.
        ack_scheduled: bool,
    },
    /// The event was already queued into this loop; nothing changed.
    DuplicateEvent {
        /// Loop that holds the earlier copy.
        key: LoopKey,
        /// Repeated event.
        event_id: EventId,
    },
    /// Nothing to do.
    Ignored {
        /// Why.
        reason: &'static str,
    },
}

/// Routes incoming events to the detector, a new loop, or an injection.
pub struct EventDispatcher {
    registry: Arc<ExecutionRegistry>,
    detector: Arc<DelegationDetector>,
    busy_ack: Arc<BusyAckGenerator>,
}

impl EventDispatcher {
    /// Create a dispatcher.
    pub fn new(
        registry: Arc<ExecutionRegistry>,
        detector: Arc<DelegationDetector>,
        busy_ack: Arc<BusyAckGenerator>,
    ) -> Self {
        Self {
            registry,
            detector,
            busy_ack,
        }
    }

    /// Route one event.
    #[instrument(skip_all, fields(event_id = %event.id, conversation_id = %event.conversation_id))]
    pub fn dispatch(&self, event: &IncomingEvent) -> Result<DispatchOutcome, RuntimeError> {
        match self.detector.handle(event) {
            DetectorOutcome::Completed(handled) => return Ok(DispatchOutcome::Completion(handled)),
            DetectorOutcome::Duplicate {
                key,
                request_event_id,
            } => {
                return Ok(DispatchOutcome::DuplicateCompletion {
                    key,
                    request_event_id,
                });
            }
            DetectorOutcome::Dropped {
                request_event_id,
                reason,
            } => {
                return Ok(DispatchOutcome::DroppedCompletion {
                    request_event_id,
                    reason,
                });
            }
            DetectorOutcome::NotACompletion => {}
        }

        let Some(recipient) = &event.recipient_id else {
            debug!("event has no recipient");
            return Ok(DispatchOutcome::Ignored {
                reason: "no recipient",
            });
        };
        if recipient == &event.sender_id {
            return Ok(DispatchOutcome::Ignored {
                reason: "self-addressed",
            });
        }

        let key = LoopKey::new(recipient.clone(), event.conversation_id.clone());
        self.route(&key, event)
    }

    fn route(&self, key: &LoopKey, event: &IncomingEvent) -> Result<DispatchOutcome, RuntimeError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.inject(key, event) {
                Err(RuntimeError::NotFound(_)) => {}
                other => return other,
            }
            match self.start(key, event) {
                // Another event created the loop first; inject instead.
                Err(RuntimeError::AlreadyActive(_)) if attempts < MAX_ROUTE_ATTEMPTS => {}
                other => return other,
            }
        }
    }

    fn inject(&self, key: &LoopKey, event: &IncomingEvent) -> Result<DispatchOutcome, RuntimeError> {
        let Some(queued) = self.registry.try_queue_event(
            key,
            InjectionKind::User,
            event.content.clone(),
            event.id.clone(),
        )?
        else {
            return Ok(DispatchOutcome::DuplicateEvent {
                key: key.clone(),
                event_id: event.id.clone(),
            });
        };
        let ack_scheduled = self
            .busy_ack
            .schedule(key.clone(), event.id.clone())
            .is_some();
        debug!(key = %key, queued, ack_scheduled, "event injected into running loop");
        Ok(DispatchOutcome::Injected {
            key: key.clone(),
            queued,
            ack_scheduled,
        })
    }

    fn start(&self, key: &LoopKey, event: &IncomingEvent) -> Result<DispatchOutcome, RuntimeError> {
        let project_id = event.tag_values(PROJECT_TAG).next().map(ProjectId::from);
        let loop_id = match &project_id {
            Some(project) => self.registry.create_in_project(key, project.clone())?,
            None => self.registry.create(key)?,
        };
        let _ = self.registry.queue_event(
            key,
            InjectionKind::User,
            event.content.clone(),
            event.id.clone(),
        )?;
        debug!(key = %key, %loop_id, "loop started for event");
        Ok(DispatchOutcome::Created {
            key: key.clone(),
            loop_id,
            project_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use relay_core::Message;
    use relay_settings::ResumePolicy;

    use super::*;
    use crate::types::{Delegation, LoopStatus};

    fn dispatcher() -> (Arc<ExecutionRegistry>, EventDispatcher) {
        let registry = Arc::new(ExecutionRegistry::new());
        let detector = Arc::new(DelegationDetector::new(
            Arc::clone(&registry),
            ResumePolicy::AnyCompletion,
        ));
        let busy_ack = Arc::new(BusyAckGenerator::new(
            Arc::clone(&registry),
            None,
            Duration::from_secs(5),
            true,
        ));
        let dispatcher = EventDispatcher::new(Arc::clone(&registry), detector, busy_ack);
        (registry, dispatcher)
    }

    fn message(id: &str, to: &str, content: &str) -> IncomingEvent {
        IncomingEvent::new(id, "human", "conv", content).to_recipient(to)
    }

    #[test]
    fn first_message_creates_loop_with_injection() {
        let (registry, dispatcher) = dispatcher();
        let event = message("e1", "a", "build it").with_tag(PROJECT_TAG, "proj-1");

        let outcome = dispatcher.dispatch(&event).unwrap();
        assert_matches!(
            outcome,
            DispatchOutcome::Created { ref key, project_id: Some(ref p), .. }
                if key == &LoopKey::new("a", "conv") && p == &ProjectId::from("proj-1")
        );

        let key = LoopKey::new("a", "conv");
        let drained = registry.drain_injections(&key).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].content, "build it");
        assert_eq!(drained[0].source_event_id, EventId::from("e1"));
    }

    #[test]
    fn second_message_is_injected() {
        let (registry, dispatcher) = dispatcher();
        let _ = dispatcher.dispatch(&message("e1", "a", "first")).unwrap();
        let outcome = dispatcher.dispatch(&message("e2", "a", "second")).unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Injected {
                key: LoopKey::new("a", "conv"),
                queued: 2,
                ack_scheduled: false,
            }
        );
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn redelivered_event_is_injected_once() {
        let (registry, dispatcher) = dispatcher();
        let key = LoopKey::new("a", "conv");
        let _ = dispatcher.dispatch(&message("e0", "a", "start")).unwrap();
        let _ = registry.drain_injections(&key).unwrap();

        let event = message("e1", "a", "also this");
        assert_matches!(dispatcher.dispatch(&event).unwrap(), DispatchOutcome::Injected { queued: 1, .. });
        assert_eq!(
            dispatcher.dispatch(&event).unwrap(),
            DispatchOutcome::DuplicateEvent {
                key: key.clone(),
                event_id: EventId::from("e1"),
            }
        );

        let drained = registry.drain_injections(&key).unwrap();
        assert_eq!(drained.len(), 1);
        assert_matches!(dispatcher.dispatch(&event).unwrap(), DispatchOutcome::DuplicateEvent { .. });
        assert!(registry.drain_injections(&key).unwrap().is_empty());
    }

    #[test]
    fn redelivered_first_event_does_not_repeat() {
        let (registry, dispatcher) = dispatcher();
        let event = message("e1", "a", "build it");
        assert_matches!(dispatcher.dispatch(&event).unwrap(), DispatchOutcome::Created { .. });
        assert_matches!(dispatcher.dispatch(&event).unwrap(), DispatchOutcome::DuplicateEvent { .. });
        assert_eq!(
            registry.drain_injections(&LoopKey::new("a", "conv")).unwrap().len(),
            1
        );
    }

    #[test]
    fn events_without_recipient_are_ignored() {
        let (registry, dispatcher) = dispatcher();
        let event = IncomingEvent::new("e1", "human", "conv", "anyone?");
        assert_eq!(
            dispatcher.dispatch(&event).unwrap(),
            DispatchOutcome::Ignored {
                reason: "no recipient"
            }
        );
        let own = IncomingEvent::new("e2", "a", "conv", "note to self").to_recipient("a");
        assert_matches!(dispatcher.dispatch(&own).unwrap(), DispatchOutcome::Ignored { .. });
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn completion_routes_to_detector() {
        let (registry, dispatcher) = dispatcher();
        let key = LoopKey::new("a", "conv");
        let _ = registry.create(&key).unwrap();
        let _ = registry
            .save_state(
                &key,
                vec![Message::user("go")],
                vec![Delegation::new("req-1", "b", "look it up")],
            )
            .unwrap();

        let response = IncomingEvent::new("resp-1", "b", "conv", "found it")
            .to_recipient("a")
            .referencing("req-1");
        assert_matches!(
            dispatcher.dispatch(&response).unwrap(),
            DispatchOutcome::Completion(CompletionHandled { resumed: true, .. })
        );
        assert_eq!(registry.status(&key), Some(LoopStatus::Executing));

        assert_matches!(
            dispatcher.dispatch(&response).unwrap(),
            DispatchOutcome::DuplicateCompletion { .. }
        );
    }

    #[test]
    fn late_completion_after_finish_does_not_start_loop() {
        let (registry, dispatcher) = dispatcher();
        let key = LoopKey::new("a", "conv");
        let _ = registry.create(&key).unwrap();
        let _ = registry
            .save_state(
                &key,
                vec![Message::user("split it")],
                vec![
                    Delegation::new("req-b", "b", "part one"),
                    Delegation::new("req-c", "c", "part two"),
                ],
            )
            .unwrap();
        let first = IncomingEvent::new("resp-b", "b", "conv", "B done")
            .to_recipient("a")
            .referencing("req-b");
        assert_matches!(
            dispatcher.dispatch(&first).unwrap(),
            DispatchOutcome::Completion(_)
        );
        let _ = registry.drain_injections(&key).unwrap();
        let _ = registry.clear(&key).unwrap();

        let late = IncomingEvent::new("resp-c", "c", "conv", "C done")
            .to_recipient("a")
            .referencing("req-c");
        assert_matches!(
            dispatcher.dispatch(&late).unwrap(),
            DispatchOutcome::DroppedCompletion { request_event_id, .. } if request_event_id == EventId::from("req-c")
        );
        assert!(!registry.is_active(&key));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn message_after_finish_starts_fresh_loop() {
        let (registry, dispatcher) = dispatcher();
        let key = LoopKey::new("a", "conv");
        let _ = dispatcher.dispatch(&message("e1", "a", "one")).unwrap();
        let _ = registry.drain_injections(&key).unwrap();
        let _ = registry.clear(&key).unwrap();

        assert_matches!(
            dispatcher.dispatch(&message("e2", "a", "two")).unwrap(),
            DispatchOutcome::Created { .. }
        );
    }
}
