//! Delegation completion detection.
//!
//! An incoming event completes a delegation only when it references a
//! request event AND the registry has a loop waiting on that request. The
//! reference alone is not enough, so an arbitrary event cannot spoof a
//! completion.

use std::sync::Arc;

use relay_core::{AgentId, EventId, IncomingEvent};
use relay_settings::ResumePolicy;
use tracing::{debug, instrument, warn};

use crate::errors::RuntimeError;
use crate::registry::ExecutionRegistry;
use crate::types::{CompletionReport, InjectionKind, LoopKey};

/// Result of [`DelegationDetector::classify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    /// The event answers a pending delegation.
    pub is_delegation_completion: bool,
    /// Referenced request that matched, if any.
    pub request_event_id: Option<EventId>,
    /// Loop waiting on that request.
    pub waiting_key: Option<LoopKey>,
}

impl Classification {
    fn negative() -> Self {
        Self {
            is_delegation_completion: false,
            request_event_id: None,
            waiting_key: None,
        }
    }
}

/// A completion that was recorded and injected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionHandled {
    /// Loop the completion was delivered to.
    pub key: LoopKey,
    /// Request that was answered.
    pub request_event_id: EventId,
    /// Counts after recording.
    pub report: CompletionReport,
    /// Status summary queued as a system injection.
    pub status_message: String,
    /// The loop was transitioned `Paused → Executing` by this call.
    pub resumed: bool,
}

/// What [`DelegationDetector::handle`] did with an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetectorOutcome {
    /// The event completed a delegation.
    Completed(CompletionHandled),
    /// The event repeats an already-recorded completion; nothing changed.
    Duplicate {
        /// Loop that already has the completion.
        key: LoopKey,
        /// Request that was answered.
        request_event_id: EventId,
    },
    /// The event matched a delegation but could not be delivered.
    Dropped {
        /// Request the event answered.
        request_event_id: EventId,
        /// Why it was dropped.
        reason: String,
    },
    /// Not a delegation completion; route to normal dispatch.
    NotACompletion,
}

/// Matches incoming events against pending delegations.
pub struct DelegationDetector {
    registry: Arc<ExecutionRegistry>,
    policy: ResumePolicy,
}

impl DelegationDetector {
    /// Create a detector over `registry` using `policy` to decide resumption.
    pub fn new(registry: Arc<ExecutionRegistry>, policy: ResumePolicy) -> Self {
        Self { registry, policy }
    }

    /// Resume policy in effect.
    pub fn policy(&self) -> ResumePolicy {
        self.policy
    }

    /// Classify `event` without changing any state.
    pub fn classify(&self, event: &IncomingEvent) -> Classification {
        event
            .reference_event_ids
            .iter()
            .find_map(|id| {
                self.registry
                    .find_loop_awaiting_delegation(id)
                    .map(|key| Classification {
                        is_delegation_completion: true,
                        request_event_id: Some(id.clone()),
                        waiting_key: Some(key),
                    })
            })
            .unwrap_or_else(Classification::negative)
    }

    fn find_answered(&self, event: &IncomingEvent) -> Option<(EventId, LoopKey)> {
        event.reference_event_ids.iter().find_map(|id| {
            self.registry
                .find_loop_with_completed(id)
                .map(|key| (id.clone(), key))
        })
    }

    fn find_finished(&self, event: &IncomingEvent) -> Option<(EventId, LoopKey)> {
        event.reference_event_ids.iter().find_map(|id| {
            self.registry
                .find_finished_delegation(id)
                .map(|key| (id.clone(), key))
        })
    }

    /// Record, inject and (per policy) resume for a completion event.
    #[instrument(skip_all, fields(event_id = %event.id, sender = %event.sender_id))]
    pub fn handle(&self, event: &IncomingEvent) -> DetectorOutcome {
        let classification = self.classify(event);
        let (Some(request_event_id), Some(key)) =
            (classification.request_event_id, classification.waiting_key)
        else {
            if let Some((request_event_id, key)) = self.find_answered(event) {
                debug!(key = %key, request_event_id = %request_event_id, "duplicate delegation completion");
                return DetectorOutcome::Duplicate {
                    key,
                    request_event_id,
                };
            }
            if let Some((request_event_id, key)) = self.find_finished(event) {
                warn!(
                    key = %key,
                    request_event_id = %request_event_id,
                    "delegation completion arrived after its loop finished"
                );
                return DetectorOutcome::Dropped {
                    request_event_id,
                    reason: format!("loop {key} already finished"),
                };
            }
            return DetectorOutcome::NotACompletion;
        };

        match self.deliver(&key, &request_event_id, event) {
            Ok(outcome) => outcome,
            Err(error) => {
                // The loop finished or moved on between lookup and delivery.
                warn!(
                    key = %key,
                    request_event_id = %request_event_id,
                    category = error.category(),
                    error = %error,
                    "delegation completion dropped"
                );
                DetectorOutcome::Dropped {
                    request_event_id,
                    reason: error.to_string(),
                }
            }
        }
    }

    fn deliver(
        &self,
        key: &LoopKey,
        request_event_id: &EventId,
        event: &IncomingEvent,
    ) -> Result<DetectorOutcome, RuntimeError> {
        let report = self.registry.record_completion(
            key,
            request_event_id,
            event.id.clone(),
            event.content.clone(),
        )?;
        if report.duplicate {
            return Ok(DetectorOutcome::Duplicate {
                key: key.clone(),
                request_event_id: request_event_id.clone(),
            });
        }

        let status_message = status_message(&report, &event.content);
        let _ = self.registry.queue_event(
            key,
            InjectionKind::System,
            status_message.clone(),
            event.id.clone(),
        )?;

        let resumed = if self.should_resume(&report) {
            match self.registry.mark_resuming(key) {
                Ok(()) => true,
                // Already executing: a sibling completion resumed it first.
                Err(RuntimeError::InvalidState { .. }) => false,
                Err(other) => return Err(other),
            }
        } else {
            false
        };

        debug!(
            key = %key,
            completed = report.completed,
            pending = report.pending,
            resumed,
            "delegation completion delivered"
        );
        Ok(DetectorOutcome::Completed(CompletionHandled {
            key: key.clone(),
            request_event_id: request_event_id.clone(),
            report,
            status_message,
            resumed,
        }))
    }

    fn should_resume(&self, report: &CompletionReport) -> bool {
        match self.policy {
            ResumePolicy::AnyCompletion => true,
            ResumePolicy::AllComplete => report.all_complete(),
        }
    }
}

/// Summary injected into the delegator's loop alongside the response.
pub fn status_message(report: &CompletionReport, response: &str) -> String {
    let status = if report.all_complete() {
        format!("all {} delegations complete.", report.total())
    } else {
        let waiting: Vec<&str> = report.still_waiting_on.iter().map(AgentId::as_str).collect();
        format!(
            "{} of {} complete. Still waiting on: {}.",
            report.completed,
            report.total(),
            waiting.join(", ")
        )
    };
    format!(
        "Response from {}:\n{}\n\nDelegation status: {}",
        report.recipient_id, response, status
    )
}
