//! Execution core tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When a paused loop is woken by delegation completions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResumePolicy {
    /// Resume on every completion; the loop sees a partial status summary.
    #[default]
    AnyCompletion,
    /// Resume only once no delegations remain pending.
    AllComplete,
}

/// Timeouts and policy knobs for the registry, project mutex and busy-ack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionSettings {
    /// How long a project lock may be held before it is auto-released.
    pub lock_timeout_ms: u64,
    /// How long before expiry the one-time warning fires.
    pub warning_lead_ms: u64,
    /// Delay before acknowledging an injection the loop has not drained.
    pub busy_ack_delay_ms: u64,
    /// Whether the busy-acknowledgment generator runs at all.
    pub busy_ack_enabled: bool,
    /// Wake-up policy for partially completed delegations.
    pub resume_policy: ResumePolicy,
    /// Period of the lock timeout sweeper.
    pub sweep_interval_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30 * 60 * 1000,
            warning_lead_ms: 5 * 60 * 1000,
            busy_ack_delay_ms: 5_000,
            busy_ack_enabled: true,
            resume_policy: ResumePolicy::AnyCompletion,
            sweep_interval_ms: 5_000,
        }
    }
}

impl ExecutionSettings {
    /// Lock timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Warning lead time as a [`Duration`].
    pub fn warning_lead(&self) -> Duration {
        Duration::from_millis(self.warning_lead_ms)
    }

    /// Busy-ack delay as a [`Duration`].
    pub fn busy_ack_delay(&self) -> Duration {
        Duration::from_millis(self.busy_ack_delay_ms)
    }

    /// Sweeper period as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
