use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "stride_client" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines when true, human-readable output otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from the textual level used in settings files; unknown levels fall back to INFO.
    pub fn from_level_str(level: &str, json: bool) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json,
        }
    }
}

/// Handle returned by [`init_telemetry`]; keeps the filter reloadable.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        if let Some(handle) = &self.reload {
            if let Err(e) = handle.reload(EnvFilter::new(&directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Filter directive string for a base level plus per-module overrides.
pub fn filter_directives(base: Level, modules: &[(String, Level)]) -> String {
    let mut filter = base.to_string().to_lowercase();
    for (module, level) in modules {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Initialize the global tracing subscriber. Call once at startup; a second
/// call leaves the first subscriber in place and returns a guard without a
/// reload handle.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        base_level: config.log_level,
        level_filter: Arc::new(RwLock::new(config.module_levels)),
        reload: installed.then_some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let modules = vec![
            ("stride_client".to_string(), Level::DEBUG),
            ("stride_store".to_string(), Level::WARN),
        ];
        assert_eq!(
            filter_directives(Level::INFO, &modules),
            "info,stride_client=debug,stride_store=warn"
        );
    }

    #[test]
    fn level_str_falls_back_to_info() {
        assert_eq!(TelemetryConfig::from_level_str("debug", false).log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_level_str("loud", false).log_level, Level::INFO);
    }

    #[test]
    fn guard_tracks_module_levels() {
        let guard = init_telemetry(TelemetryConfig::default());
        guard.set_module_level("stride_transport", Level::TRACE);
        guard.set_module_level("stride_transport", Level::DEBUG);
        assert_eq!(
            guard.module_levels(),
            vec![("stride_transport".to_string(), Level::DEBUG)]
        );
    }
}
