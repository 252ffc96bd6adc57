//! Exponential backoff schedule for reconnect attempts
//!
//! Delays grow as base * 2^n up to a cap: 1s, 2s, 4s, 8s... A success
//! resets the schedule to the base delay.

use std::time::Duration;

/// Configuration for the backoff schedule
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay
    pub base: Duration,
    /// Ceiling the delay never exceeds
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }
}

/// Doubling backoff with a cap
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn with_defaults() -> Self {
        Self::new(BackoffConfig::default())
    }

    /// Delay to wait before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(31);
        let delay = self
            .config
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of attempts consumed since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Back to the base delay after a successful attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
