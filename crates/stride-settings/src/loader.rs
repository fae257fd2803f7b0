//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::StrideSettings;

/// `~/.stride`, falling back to `/tmp/.stride` without a home directory.
pub fn stride_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".stride")
}

/// Resolve the path to the settings file (`~/.stride/settings.json`).
pub fn settings_path() -> PathBuf {
    stride_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<StrideSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or inconsistent values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<StrideSettings> {
    let defaults = serde_json::to_value(StrideSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: StrideSettings = serde_json::from_value(merged)?;
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (falling back to file/default).
pub fn apply_env_overrides(settings: &mut StrideSettings) {
    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = read_env_string("STRIDE_BASE_URL") {
        settings.transport.base_url = v;
    }
    if let Some(v) = read_env_u64("STRIDE_CONNECT_TIMEOUT_MS", 100, 300_000) {
        settings.transport.connect_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("STRIDE_HANDSHAKE_TIMEOUT_MS", 100, 300_000) {
        settings.transport.handshake_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("STRIDE_IDLE_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.transport.idle_timeout_ms = v;
    }

    // ── Reconnect ───────────────────────────────────────────────────
    if let Some(v) = read_env_u64("STRIDE_INITIAL_DELAY_MS", 10, 600_000) {
        settings.reconnect.initial_delay_ms = v;
    }
    if let Some(v) = read_env_u64("STRIDE_MAX_DELAY_MS", 10, 600_000) {
        settings.reconnect.max_delay_ms = v;
    }

    // ── Stream / persistence ────────────────────────────────────────
    if let Some(v) = read_env_usize("STRIDE_REORDER_WINDOW", 1, 100_000) {
        settings.stream.reorder_window = v;
    }
    if let Some(v) = read_env_string("STRIDE_DB_PATH") {
        settings.persistence.db_path = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("STRIDE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("STRIDE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
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

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use crate::types::*;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"reconnect": {"initialDelayMs": 1000, "maxDelayMs": 8000}});
        let source = serde_json::json!({"reconnect": {"maxDelayMs": 4000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["reconnect"]["maxDelayMs"], 4000);
        assert_eq!(merged["reconnect"]["initialDelayMs"], 1000);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.stream.reorder_window, DEFAULT_REORDER_WINDOW);
        assert_eq!(
            settings.connectivity.final_threshold_ms,
            DEFAULT_FINAL_THRESHOLD_MS
        );
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"reconnect": {"maxDelayMs": 4000}, "persistence": {"debounceDeltas": 5}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.reconnect.max_delay_ms, 4000);
        assert_eq!(settings.persistence.debounce_deltas, 5);
        assert_eq!(settings.reconnect.initial_delay_ms, DEFAULT_INITIAL_DELAY_MS);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn load_inconsistent_values_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"connectivity": {"finalThresholdMs": 1000}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn load_zero_reorder_window_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"stream": {"reorderWindow": 0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn parse_bool_values() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("50", 100, 1000), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
        assert_eq!(parse_usize_range("0", 0, 10), Some(0));
    }
}
