//! Maps step outcomes onto registry transitions.
//!
//! The reasoning/tool loop itself runs outside the core. After each step
//! it reports a [`StepOutcome`] here and receives a [`StepDisposition`]
//! telling it what to do next.

use std::sync::Arc;

use relay_core::{LoopId, Message};
use tracing::{debug, instrument};

use crate::errors::RuntimeError;
use crate::registry::{ExecutionRegistry, FinishOutcome};
use crate::types::{Injection, LoopKey, LoopStatus, StepOutcome};

/// What the driver should do after a step.
#[derive(Debug, PartialEq)]
pub enum StepDisposition {
    /// Run the next step with these newly delivered injections.
    Continue {
        /// Injections drained at this step boundary.
        injections: Vec<Injection>,
    },
    /// Stop stepping; the loop waits for delegation responses.
    Paused {
        /// Delegations now pending.
        pending: usize,
    },
    /// The loop is done and removed.
    Finished {
        /// Instance that finished.
        loop_id: LoopId,
    },
    /// A finish was attempted but messages arrived first; keep stepping.
    FinishDeferred {
        /// Injections that must be answered.
        injections: Vec<Injection>,
    },
}

/// Applies step outcomes for external loop drivers.
pub struct LoopDriver {
    registry: Arc<ExecutionRegistry>,
}

impl LoopDriver {
    /// Create a driver over `registry`.
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        Self { registry }
    }

    /// Apply `outcome` for the loop at `key`.
    ///
    /// `Pause` persists the current transcript and pending set before
    /// returning, so it must be called before the delegation requests are
    /// published. `Finish` records the final answer in the transcript.
    #[instrument(skip_all, fields(key = %key))]
    pub fn apply_step(
        &self,
        key: &LoopKey,
        outcome: StepOutcome,
    ) -> Result<StepDisposition, RuntimeError> {
        match outcome {
            StepOutcome::Continue => {
                let injections = self.registry.drain_injections(key)?;
                Ok(StepDisposition::Continue { injections })
            }
            StepOutcome::Pause(delegations) => {
                let transcript = self.registry.transcript(key)?;
                let pending = self.registry.save_state(key, transcript, delegations)?;
                Ok(StepDisposition::Paused { pending })
            }
            StepOutcome::Finish(result) => {
                if let Some(status @ LoopStatus::Paused) = self.registry.status(key) {
                    return Err(RuntimeError::InvalidState {
                        key: key.clone(),
                        status,
                        operation: "finish",
                    });
                }
                let _ = self
                    .registry
                    .append_message(key, Message::assistant(result))?;
                match self.registry.finish(key)? {
                    FinishOutcome::Finished(loop_id) => Ok(StepDisposition::Finished { loop_id }),
                    FinishOutcome::Deferred(injections) => {
                        debug!(injections = injections.len(), "finish deferred");
                        Ok(StepDisposition::FinishDeferred { injections })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use relay_core::{EventId, Role};

    use super::*;
    use crate::types::{Delegation, InjectionKind};

    fn key() -> LoopKey {
        LoopKey::new("a", "conv")
    }

    fn setup() -> (Arc<ExecutionRegistry>, LoopDriver) {
        let registry = Arc::new(ExecutionRegistry::new());
        let _ = registry.create(&key()).unwrap();
        let driver = LoopDriver::new(Arc::clone(&registry));
        (registry, driver)
    }

    #[test]
    fn continue_drains_injections() {
        let (registry, driver) = setup();
        let _ = registry
            .queue_event(&key(), InjectionKind::User, "hi", "e1")
            .unwrap();

        let disposition = driver.apply_step(&key(), StepOutcome::Continue).unwrap();
        assert_matches!(disposition, StepDisposition::Continue { ref injections } if injections.len() == 1);
        assert_eq!(
            driver.apply_step(&key(), StepOutcome::Continue).unwrap(),
            StepDisposition::Continue { injections: vec![] }
        );
    }

    #[test]
    fn pause_keeps_transcript_and_indexes() {
        let (registry, driver) = setup();
        let _ = registry.append_message(&key(), Message::user("plan")).unwrap();

        let disposition = driver
            .apply_step(
                &key(),
                StepOutcome::Pause(vec![Delegation::new("req-1", "b", "research")]),
            )
            .unwrap();
        assert_eq!(disposition, StepDisposition::Paused { pending: 1 });
        assert_eq!(registry.status(&key()), Some(LoopStatus::Paused));
        assert_eq!(registry.transcript(&key()).unwrap().len(), 1);
        assert_eq!(
            registry.find_loop_awaiting_delegation(&EventId::from("req-1")),
            Some(key())
        );
    }

    #[test]
    fn finish_removes_loop() {
        let (registry, driver) = setup();
        let disposition = driver
            .apply_step(&key(), StepOutcome::Finish("done".into()))
            .unwrap();
        assert_matches!(disposition, StepDisposition::Finished { .. });
        assert!(!registry.is_active(&key()));
    }

    #[test]
    fn finish_with_waiting_message_is_deferred() {
        let (registry, driver) = setup();
        let _ = registry
            .queue_event(&key(), InjectionKind::User, "wait, one more", "e2")
            .unwrap();

        let disposition = driver
            .apply_step(&key(), StepOutcome::Finish("done".into()))
            .unwrap();
        assert_matches!(disposition, StepDisposition::FinishDeferred { ref injections } if injections.len() == 1);

        let transcript = registry.transcript(&key()).unwrap();
        let roles: Vec<Role> = transcript.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::User]);
    }

    #[test]
    fn finish_while_paused_is_invalid() {
        let (registry, driver) = setup();
        let _ = driver
            .apply_step(&key(), StepOutcome::Pause(vec![Delegation::new("r", "b", "x")]))
            .unwrap();
        assert_matches!(
            driver.apply_step(&key(), StepOutcome::Finish("early".into())),
            Err(RuntimeError::InvalidState { .. })
        );
        assert!(registry.is_active(&key()));
    }
}
