//! Shared resilience utilities
//!
//! - Circuit breaker gating reconnect attempts
//! - Exponential backoff schedule between attempts

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{Backoff, BackoffConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
