//! Adapter settings with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`AdapterSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `ROOMCAST_*` environment variable overrides (highest priority)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};

pub const DEFAULT_KEY_PREFIX: &str = "socket.io";
pub const DEFAULT_REQUESTS_TIMEOUT_MS: u64 = 5_000;

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 600_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterSettings {
    /// Prefix of every pub/sub channel name.
    pub key_prefix: String,
    /// How long a distributed request waits for peer responses.
    pub requests_timeout_ms: u64,
    /// Publish responses on the requester's own channel instead of the
    /// shared one. Off by default for compatibility with older nodes.
    pub publish_on_specific_response_channel: bool,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            requests_timeout_ms: DEFAULT_REQUESTS_TIMEOUT_MS,
            publish_on_specific_response_channel: false,
        }
    }
}

impl AdapterSettings {
    pub fn requests_timeout(&self) -> Duration {
        Duration::from_millis(self.requests_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(SettingsError::InvalidValue("keyPrefix must not be empty".into()));
        }
        if self.requests_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "requestsTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Load settings from an optional JSON file with env var overrides.
///
/// A missing file yields the defaults. Invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<AdapterSettings> {
    let defaults = serde_json::to_value(AdapterSettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading adapter settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: AdapterSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Layer `source` over `target`. Objects merge key by key, anything else in
/// `source` replaces the target value, and `null` leaves the target as is.
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

/// Apply `ROOMCAST_*` environment variable overrides.
///
/// An unparsable or out-of-range value is logged and leaves the setting as
/// loaded.
pub fn apply_env_overrides(settings: &mut AdapterSettings) {
    if let Some(v) = read_env_string("ROOMCAST_KEY_PREFIX") {
        settings.key_prefix = v;
    }
    if let Some(v) = read_env_u64("ROOMCAST_REQUESTS_TIMEOUT_MS", MIN_TIMEOUT_MS, MAX_TIMEOUT_MS) {
        settings.requests_timeout_ms = v;
    }
    if let Some(v) = read_env_bool("ROOMCAST_PER_NODE_RESPONSES") {
        settings.publish_on_specific_response_channel = v;
    }
}

// ── Parsing ─────────────────────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
