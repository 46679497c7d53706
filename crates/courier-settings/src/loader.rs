//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `COURIER_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::CourierSettings;

/// Resolve the path to the settings file (`~/.courier/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// [`load_settings_from_path`] with an explicit environment lookup.
pub fn load_with_env(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CourierSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
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

/// Apply environment overrides read through `env`.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides(settings: &mut CourierSettings, env: impl Fn(&str) -> Option<String>) {
    let env = Env(&env);

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("COURIER_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("COURIER_MAX_FRAME_SIZE", 1024, 1 << 30) {
        settings.server.max_frame_size = v;
    }
    if let Some(v) = env.u64("COURIER_SHUTDOWN_GRACE_MS", 0, 600_000) {
        settings.server.shutdown_grace_ms = v;
    }
    if let Some(v) = env.string("COURIER_TLS_CERT") {
        settings.server.tls.cert_path = Some(v);
    }
    if let Some(v) = env.string("COURIER_TLS_KEY") {
        settings.server.tls.key_path = Some(v);
    }

    // ── Executor ────────────────────────────────────────────────────
    if let Some(v) = env.usize("COURIER_WORKERS", 1, 1024) {
        settings.executor.workers = v;
    }
    if let Some(v) = env.usize("COURIER_QUEUE_SIZE", 0, 1_000_000) {
        settings.executor.queue_size = v;
    }
    if let Some(v) = env.u64("COURIER_TASK_TIMEOUT_MS", 1, 3_600_000) {
        settings.executor.task_timeout_ms = v;
    }

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = env.u64("COURIER_INCOMING_HEARTBEAT_MS", 0, 3_600_000) {
        settings.client.incoming_heartbeat_ms = v;
    }
    if let Some(v) = env.u64("COURIER_OUTGOING_HEARTBEAT_MS", 0, 3_600_000) {
        settings.client.outgoing_heartbeat_ms = v;
    }
    if let Some(v) = env.u64("COURIER_NR_RETRIES", 0, 1_000).and_then(|v| u32::try_from(v).ok()) {
        settings.client.nr_retries = v;
    }
    if let Some(v) = env.u64("COURIER_CALL_TIMEOUT_MS", 1, 3_600_000) {
        settings.client.call_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("COURIER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers (thin wrappers) ─────────────────────────────────────────────

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.0)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
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
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let merged = deep_merge(
            serde_json::json!({"a": {"nested": true}}),
            serde_json::json!({"a": 42}),
        );
        assert_eq!(merged["a"], 42);
    }

    // ── load_with_env ───────────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_with_env(Path::new("/nonexistent/settings.json"), no_env).unwrap();
        assert_eq!(settings, CourierSettings::default());
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 61000}, "client": {"nrRetries": 0}}"#,
        )
        .unwrap();

        let settings = load_with_env(&path, no_env).unwrap();
        assert_eq!(settings.server.port, 61000);
        assert_eq!(settings.client.nr_retries, 0);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.client.reconnect_interval_ms, 2_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_with_env(&path, no_env), Err(SettingsError::Json(_))));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"executor": {"workers": 0}}"#).unwrap();
        assert!(matches!(
            load_with_env(&path, no_env),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 61000}}"#).unwrap();

        let env = env_of(&[
            ("COURIER_PORT", "62000"),
            ("COURIER_WORKERS", "3"),
            ("COURIER_LOG_JSON", "yes"),
            ("COURIER_NR_RETRIES", "0"),
        ]);
        let settings = load_with_env(&path, env).unwrap();
        assert_eq!(settings.server.port, 62000);
        assert_eq!(settings.executor.workers, 3);
        assert!(settings.logging.json);
        assert_eq!(settings.client.nr_retries, 0);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = CourierSettings::default();
        let env = env_of(&[
            ("COURIER_PORT", "not-a-port"),
            ("COURIER_WORKERS", "0"),
            ("COURIER_LOG_JSON", "maybe"),
            ("COURIER_HOST", ""),
        ]);
        apply_env_overrides(&mut settings, env);
        assert_eq!(settings, CourierSettings::default());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("80", 1, 100), Some(80));
        assert_eq!(parse_u16_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("5", 0, 4), None);
        assert_eq!(parse_usize_range("x", 0, 4), None);
    }
}
