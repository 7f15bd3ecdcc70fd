//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.relay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `RELAY_*` environment variable overrides
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{RelaySettings, ResumePolicy};

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a failed validation is an
/// error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

fn load_with_env<F>(path: &Path, env: F) -> Result<RelaySettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides using an arbitrary variable lookup.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_overrides<F>(settings: &mut RelaySettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let exec = &mut settings.execution;
    if let Some(v) = read_u64(&env, "RELAY_LOCK_TIMEOUT_MS", 1_000, 86_400_000) {
        exec.lock_timeout_ms = v;
    }
    if let Some(v) = read_u64(&env, "RELAY_WARNING_LEAD_MS", 0, 86_400_000) {
        exec.warning_lead_ms = v;
    }
    if let Some(v) = read_u64(&env, "RELAY_BUSY_ACK_DELAY_MS", 0, 3_600_000) {
        exec.busy_ack_delay_ms = v;
    }
    if let Some(v) = read_bool(&env, "RELAY_BUSY_ACK_ENABLED") {
        exec.busy_ack_enabled = v;
    }
    if let Some(v) = read_u64(&env, "RELAY_SWEEP_INTERVAL_MS", 100, 3_600_000) {
        exec.sweep_interval_ms = v;
    }
    if let Some(raw) = read_string(&env, "RELAY_RESUME_POLICY") {
        match parse_resume_policy(&raw) {
            Some(policy) => exec.resume_policy = policy,
            None => {
                tracing::warn!(key = "RELAY_RESUME_POLICY", value = %raw, "invalid resume policy, ignoring");
            }
        }
    }
    if let Some(v) = read_string(&env, "RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a resume policy, accepting camelCase and kebab/snake spellings.
pub fn parse_resume_policy(val: &str) -> Option<ResumePolicy> {
    match val.to_lowercase().replace(['-', '_'], "").as_str() {
        "anycompletion" | "any" => Some(ResumePolicy::AnyCompletion),
        "allcomplete" | "all" => Some(ResumePolicy::AllComplete),
        _ => None,
    }
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_string<F: Fn(&str) -> Option<String>>(env: &F, name: &str) -> Option<String> {
    env(name).filter(|v| !v.is_empty())
}

fn read_bool<F: Fn(&str) -> Option<String>>(env: &F, name: &str) -> Option<bool> {
    let val = env(name)?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_u64<F: Fn(&str) -> Option<String>>(env: &F, name: &str, min: u64, max: u64) -> Option<u64> {
    let val = env(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
