//! Exponential backoff for replay attempts and worker cycles.

use std::time::Duration;

use rand::Rng;

use crate::config::ReplayConfig;

/// Delay schedule: `initial * factor^attempt`, capped, with ±jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fraction of the delay added or removed at random (0.1 = ±10%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.backoff_initial_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` failures (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX) as f64;
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX) as f64;

        // 2^31 is already far beyond any cap
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms * self.backoff_factor.max(1.0).powi(exp)).min(max_ms);

        let jitter = if self.jitter_percent > 0.0 {
            let range = base_ms * self.jitter_percent.clamp(0.0, 1.0);
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}
