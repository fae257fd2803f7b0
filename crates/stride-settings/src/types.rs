//! Settings types and their compiled defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

// ── Transport ───────────────────────────────────────────────────────────────

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8787";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// A connecting attempt that has not reached `streaming` by then counts as a disconnect.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;
/// No bytes for this long on an open stream is treated as a dead link.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 45_000;

// ── Reconnect ───────────────────────────────────────────────────────────────

pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 8_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Consecutive waits at the cap before auto-retry stops.
pub const DEFAULT_MAX_ATTEMPTS_AT_CAP: u32 = 3;
pub const DEFAULT_RATE_LIMIT_MIN_DELAY_MS: u64 = 10_000;
/// Fatal failures before the rendering layer is told to escalate.
pub const MAX_FATAL_RETRIES_BEFORE_ESCALATION: u32 = 3;

// ── Stream ──────────────────────────────────────────────────────────────────

/// Out-of-order events held before a sequence gap is skipped.
pub const DEFAULT_REORDER_WINDOW: usize = 64;

// ── Persistence ─────────────────────────────────────────────────────────────

pub const DEFAULT_DEBOUNCE_DELTAS: u32 = 20;
pub const DEFAULT_DEBOUNCE_INTERVAL_MS: u64 = 750;
pub const DEFAULT_DB_FILE: &str = "progress.db";

// ── Connectivity ────────────────────────────────────────────────────────────

pub const DEFAULT_MEDIUM_THRESHOLD_MS: u64 = 5_000;
pub const DEFAULT_LONG_THRESHOLD_MS: u64 = 15_000;
/// Past this, auto-retry stops and the overlay offers a retry button.
pub const DEFAULT_FINAL_THRESHOLD_MS: u64 = 30_000;
pub const DEFAULT_BACK_ONLINE_DISPLAY_MS: u64 = 2_000;

// ── Logging ─────────────────────────────────────────────────────────────────

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrideSettings {
    pub transport: TransportSettings,
    pub reconnect: ReconnectSettings,
    pub stream: StreamSettings,
    pub persistence: PersistenceSettings,
    pub connectivity: ConnectivitySettings,
    pub logging: LoggingSettings,
}

impl StrideSettings {
    /// Reject values that would make the state machines disagree or stall.
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconnect;
        if r.initial_delay_ms == 0 || r.initial_delay_ms > r.max_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "reconnect.initialDelayMs ({}) must be in 1..=maxDelayMs ({})",
                r.initial_delay_ms, r.max_delay_ms
            )));
        }
        if r.multiplier < 1.0 {
            return Err(SettingsError::InvalidValue(format!(
                "reconnect.multiplier ({}) must be >= 1.0",
                r.multiplier
            )));
        }
        let c = &self.connectivity;
        if !(c.medium_threshold_ms < c.long_threshold_ms && c.long_threshold_ms < c.final_threshold_ms)
        {
            return Err(SettingsError::InvalidValue(format!(
                "connectivity thresholds must increase: medium {} < long {} < final {}",
                c.medium_threshold_ms, c.long_threshold_ms, c.final_threshold_ms
            )));
        }
        if self.stream.reorder_window == 0 {
            return Err(SettingsError::InvalidValue(
                "stream.reorderWindow must be > 0".into(),
            ));
        }
        if self.persistence.debounce_deltas == 0 {
            return Err(SettingsError::InvalidValue(
                "persistence.debounceDeltas must be > 0".into(),
            ));
        }
        if self.transport.handshake_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.handshakeTimeoutMs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Remote inference endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Backoff policy for reconnecting a dropped stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts_at_cap: u32,
    pub rate_limit_min_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_attempts_at_cap: DEFAULT_MAX_ATTEMPTS_AT_CAP,
            rate_limit_min_delay_ms: DEFAULT_RATE_LIMIT_MIN_DELAY_MS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    pub reorder_window: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }
}

/// Local progress persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    pub debounce_deltas: u32,
    pub debounce_interval_ms: u64,
    /// Database path; relative paths resolve against `~/.stride`.
    pub db_path: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            debounce_deltas: DEFAULT_DEBOUNCE_DELTAS,
            debounce_interval_ms: DEFAULT_DEBOUNCE_INTERVAL_MS,
            db_path: DEFAULT_DB_FILE.to_string(),
        }
    }
}

impl PersistenceSettings {
    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms)
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.db_path);
        if path.is_absolute() {
            path
        } else {
            crate::loader::stride_dir().join(path)
        }
    }
}

/// Escalation thresholds for the reconnecting overlay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectivitySettings {
    pub medium_threshold_ms: u64,
    pub long_threshold_ms: u64,
    pub final_threshold_ms: u64,
    pub back_online_display_ms: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            medium_threshold_ms: DEFAULT_MEDIUM_THRESHOLD_MS,
            long_threshold_ms: DEFAULT_LONG_THRESHOLD_MS,
            final_threshold_ms: DEFAULT_FINAL_THRESHOLD_MS,
            back_online_display_ms: DEFAULT_BACK_ONLINE_DISPLAY_MS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            json: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        StrideSettings::default().validate().unwrap();
    }

    #[test]
    fn defaults_serialize_camel_case() {
        let json = serde_json::to_value(StrideSettings::default()).unwrap();
        assert_eq!(json["transport"]["handshakeTimeoutMs"], DEFAULT_HANDSHAKE_TIMEOUT_MS);
        assert_eq!(json["stream"]["reorderWindow"], DEFAULT_REORDER_WINDOW);
        assert_eq!(json["connectivity"]["finalThresholdMs"], DEFAULT_FINAL_THRESHOLD_MS);
    }

    #[test]
    fn thresholds_must_increase() {
        let mut settings = StrideSettings::default();
        settings.connectivity.long_threshold_ms = settings.connectivity.final_threshold_ms;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn initial_delay_must_not_exceed_cap() {
        let mut settings = StrideSettings::default();
        settings.reconnect.initial_delay_ms = settings.reconnect.max_delay_ms + 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn reorder_window_must_be_positive() {
        let mut settings = StrideSettings::default();
        settings.stream.reorder_window = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("reorderWindow")
        ));
    }

    #[test]
    fn absolute_db_path_is_kept() {
        let p = PersistenceSettings {
            db_path: "/var/lib/stride/p.db".into(),
            ..Default::default()
        };
        assert_eq!(p.resolved_db_path(), PathBuf::from("/var/lib/stride/p.db"));
    }

    #[test]
    fn relative_db_path_resolves_under_stride_dir() {
        let p = PersistenceSettings::default();
        assert!(p.resolved_db_path().ends_with(".stride/progress.db"));
    }
}
