//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DuetSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `DUET_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Objects merge recursively; arrays and primitives from the file replace
//! the default; `null` in the file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{DuetSettings, StoreBackend};

/// Resolve the settings file: `$DUET_CONFIG`, else `~/.duet/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = read_env_string("DUET_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".duet").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DuetSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<DuetSettings> {
    let defaults = serde_json::to_value(DuetSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DuetSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
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

/// Apply `DUET_*` environment overrides. Values that fail to parse or fall
/// outside their range are logged and ignored.
pub fn apply_env_overrides(settings: &mut DuetSettings) {
    if let Some(v) = read_env_string("DUET_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("DUET_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("DUET_ROOM") {
        settings.room.id = v;
    }
    if let Some(v) = read_env_string("DUET_PARTICIPANTS") {
        settings.room.participants = parse_list(&v);
    }

    if let Some(v) = read_env_u64("DUET_CYCLE_INTERVAL_MS", 50, 60_000) {
        settings.delivery.cycle_interval_ms = v;
    }
    if let Some(v) = read_env_usize("DUET_MAX_SESSIONS", 1, 100) {
        settings.delivery.max_sessions_per_identity = v;
    }
    if let Some(v) = read_env_u64("DUET_CONNECT_COOLDOWN_MS", 0, 60_000) {
        settings.delivery.connect_cooldown_ms = v;
    }

    if let Some(v) = read_env_string("DUET_STORE_BACKEND") {
        match serde_json::from_value::<StoreBackend>(Value::String(v.clone())) {
            Ok(backend) => settings.store.backend = backend,
            Err(_) => warn!(key = "DUET_STORE_BACKEND", value = %v, "unknown backend, ignoring"),
        }
    }
    if let Some(v) = read_env_string("DUET_SQLITE_PATH") {
        settings.store.sqlite_path = v;
    }
    if let Some(v) = read_env_usize("DUET_MAX_MESSAGES", 1, 1_000_000) {
        settings.store.max_messages = v;
    }
    if let Some(v) = read_env_u64("DUET_DEDUPE_WINDOW_MS", 0, 60_000) {
        settings.store.dedupe_window_ms = v;
    }
    if let Some(v) = read_env_u64("DUET_CACHE_TTL_MS", 0, 3_600_000) {
        settings.store.cache_ttl_ms = v;
    }

    if let Some(v) = read_env_string("DUET_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("DUET_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a string as a boolean (`true`/`1`/`yes`/`on`, `false`/`0`/`no`/`off`).
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Comma-separated list, trimmed, empties dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
