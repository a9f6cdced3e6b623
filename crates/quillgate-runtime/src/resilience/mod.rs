//! Resilience patterns for calls to external collaborators.
//!
//! This module provides a circuit breaker per upstream (critic, generator).
//! Timeouts are applied at each call site.

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Upstream};
