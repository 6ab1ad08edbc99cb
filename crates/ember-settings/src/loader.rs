//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`EmberSettings::default()`]
//! 2. If `~/.ember/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ember_dir, EmberSettings};

/// Resolve the path to the settings file (`~/.ember/settings.json`).
pub fn settings_path() -> PathBuf {
    ember_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<EmberSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<EmberSettings> {
    let defaults = serde_json::to_value(EmberSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: EmberSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (file/default value stays).
pub fn apply_env_overrides(settings: &mut EmberSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable variable source.
pub fn apply_overrides_from<F>(settings: &mut EmberSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let number = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        parsed
    };
    let flag = |name: &str| {
        let val = lookup(name)?;
        let parsed = parse_bool(&val);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        parsed
    };

    // ── Job service ─────────────────────────────────────────────────
    if let Some(v) = string("RUNPOD_ENDPOINT_ID") {
        settings.job_service.endpoint_id = v;
    }
    // The ember-specific name wins over the platform one.
    if let Some(v) = string("EMBER_ENDPOINT_ID") {
        settings.job_service.endpoint_id = v;
    }
    if let Some(v) = string("EMBER_JOB_SERVICE_URL") {
        settings.job_service.base_url = v;
    }
    if let Some(v) = string("EMBER_API_KEY_ENV") {
        settings.job_service.api_key_env = v;
    }
    if let Some(v) = number("EMBER_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.job_service.request_timeout_ms = v;
    }

    // ── Orchestrator ────────────────────────────────────────────────
    if let Some(v) = number("EMBER_POLL_INTERVAL_MS", 50, 60_000) {
        settings.orchestrator.poll_interval_ms = v;
    }
    if let Some(v) = number("EMBER_READY_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.orchestrator.ready_timeout_ms = v;
    }
    if let Some(v) = number("EMBER_PREWARM_LEAD_MS", 0, 3_600_000) {
        settings.orchestrator.prewarm_lead_ms = v;
    }
    if let Some(v) = flag("EMBER_PROBE_ENDPOINT") {
        settings.orchestrator.probe_endpoint = v;
    }

    // ── Store / logging ─────────────────────────────────────────────
    if let Some(v) = string("EMBER_STORE_PATH") {
        settings.store.path = PathBuf::from(v);
    }
    if let Some(v) = string("EMBER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = flag("EMBER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
