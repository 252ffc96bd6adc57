//! Circuit breaker wrapping reconnect attempts
//!
//! States:
//! - Closed: attempts pass through, consecutive failures are counted
//! - Open: attempts are rejected immediately
//! - HalfOpen: exactly one trial attempt is in flight
//!
//! Every transition and call outcome is visible through [`CircuitStats`]
//! so connection health can be reported to the presentation layer.

use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Normal operation - attempts pass through
    #[default]
    Closed,
    /// Dependency is failing - attempts are rejected immediately
    Open,
    /// One trial attempt is allowed to probe recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to stay in Open state before allowing a trial attempt
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Observable snapshot of breaker health
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected_calls: u64,
    /// Seconds since the last state transition, if any has occurred
    pub secs_since_transition: Option<u64>,
}

/// Circuit breaker for managing reconnect failures
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    rejected_calls: u64,
    config: CircuitBreakerConfig,
    opened_at: Option<Instant>,
    last_transition: Option<Instant>,
    /// Set while the single half-open probe is outstanding
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            rejected_calls: 0,
            config,
            opened_at: None,
            last_transition: None,
            trial_in_flight: false,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Check whether an attempt is allowed right now.
    ///
    /// In Open state the recovery timeout is consulted; once it elapses
    /// the breaker moves to HalfOpen and admits exactly one trial. Further
    /// calls while that trial is outstanding are rejected.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    tracing::info!("Circuit breaker transitioning to HalfOpen state");
                    self.transition(CircuitState::HalfOpen);
                    self.trial_in_flight = true;
                    true
                } else {
                    self.rejected_calls += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    self.rejected_calls += 1;
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful attempt
    ///
    /// In Closed state: resets the consecutive failure count.
    /// In HalfOpen state: the trial succeeded, the circuit closes and all
    /// counters reset.
    pub fn record_success(&mut self) {
        self.total_successes += 1;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                tracing::info!("Circuit breaker closed after successful trial");
                self.transition(CircuitState::Closed);
                self.consecutive_failures = 0;
                self.trial_in_flight = false;
                self.opened_at = None;
            }
            CircuitState::Open => {
                // Success reported without a permitted attempt; ignore
            }
        }
    }

    /// Record a failed attempt
    ///
    /// In Closed state: counts toward the failure threshold.
    /// In HalfOpen state: the trial failed, the circuit reopens and the
    /// recovery timer restarts.
    pub fn record_failure(&mut self) {
        self.total_failures += 1;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        self.consecutive_failures
                    );
                    self.transition(CircuitState::Open);
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Circuit breaker re-opened, trial attempt failed");
                self.transition(CircuitState::Open);
                self.opened_at = Some(Instant::now());
                self.trial_in_flight = false;
            }
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
            }
        }
    }

    /// Reset to the initial closed state
    pub fn reset(&mut self) {
        self.transition(CircuitState::Closed);
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    /// Snapshot breaker health for the presentation layer
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            rejected_calls: self.rejected_calls,
            secs_since_transition: self.last_transition.map(|t| t.elapsed().as_secs()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == CircuitState::Closed
    }

    fn transition(&mut self, to: CircuitState) {
        if self.state != to {
            self.state = to;
            self.last_transition = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::with_defaults();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_closed());
        assert!(!cb.is_open());
    }

    #[test]
    fn test_closed_allows_attempts() {
        let mut cb = CircuitBreaker::with_defaults();
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_failure_threshold_opens_circuit() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let mut cb = CircuitBreaker::new(config);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_circuit_rejects_attempts_fast() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(60));
        let mut cb = CircuitBreaker::new(config);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt());
        assert_eq!(cb.stats().rejected_calls, 1);
    }

    #[test]
    fn test_success_resets_failure_count_in_closed_state() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let mut cb = CircuitBreaker::new(config);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.stats().consecutive_failures, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_exactly_one_trial_after_recovery_timeout() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(1));
        let mut cb = CircuitBreaker::new(config);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(5));

        // First call after the timeout is the trial
        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // A second caller is rejected while the trial is outstanding
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_trial_success_closes_circuit() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(1));
        let mut cb = CircuitBreaker::new(config);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.can_attempt());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_trial_failure_reopens_and_restarts_timer() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(20));
        let mut cb = CircuitBreaker::new(config);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.can_attempt());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Timer restarted: still rejecting right away
        assert!(!cb.can_attempt());

        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_stats_counters() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(2);
        let mut cb = CircuitBreaker::new(config);

        cb.record_success();
        cb.record_failure();
        let stats = cb.stats();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.consecutive_failures, 1);
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);
        let mut cb = CircuitBreaker::new(config);

        cb.record_failure();
        assert!(cb.is_open());

        cb.reset();
        assert!(cb.is_closed());
        assert!(cb.can_attempt());
    }
}
