//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a partial JSON file only overrides what it names.

mod execution;
mod logging;

pub use execution::*;
pub use logging::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "execution": { "lockTimeoutMs": 900000, "resumePolicy": "allComplete" },
///   "logging": { "level": "info" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Execution registry, project mutex and busy-ack tuning.
    pub execution: ExecutionSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "relay".to_string(),
            execution: ExecutionSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl RelaySettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        if exec.lock_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "execution.lockTimeoutMs must be greater than zero".into(),
            ));
        }
        if exec.warning_lead_ms >= exec.lock_timeout_ms {
            return Err(SettingsError::InvalidValue(format!(
                "execution.warningLeadMs ({}) must be below execution.lockTimeoutMs ({})",
                exec.warning_lead_ms, exec.lock_timeout_ms
            )));
        }
        if exec.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "execution.sweepIntervalMs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
