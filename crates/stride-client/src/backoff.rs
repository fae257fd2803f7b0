use std::time::Duration;

use stride_core::StreamErrorReason;
use stride_settings::ReconnectSettings;

/// Capped, deterministic backoff. Delays never decrease with the attempt
/// number and never exceed `max` except for rate limiting, which may
/// demand a longer wait.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Consecutive waits at the cap before auto-retry stops.
    pub max_attempts_at_cap: u32,
    pub rate_limit_min: Duration,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.initial_delay_ms),
            max: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier.max(1.0),
            max_attempts_at_cap: settings.max_attempts_at_cap,
            rate_limit_min: Duration::from_millis(settings.rate_limit_min_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = ms.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for `attempt` after a failure of the given kind.
    pub fn delay_for(&self, attempt: u32, reason: &StreamErrorReason) -> Duration {
        let base = self.delay(attempt);
        match reason {
            StreamErrorReason::RateLimited { retry_after } => base
                .max(self.rate_limit_min)
                .max(retry_after.unwrap_or_default()),
            _ => base,
        }
    }

    pub fn is_capped(&self, delay: Duration) -> bool {
        delay >= self.max
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}
