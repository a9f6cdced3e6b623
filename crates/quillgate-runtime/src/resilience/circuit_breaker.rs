//! Circuit breaker to prevent cascade failures.
//!
//! When an upstream fails repeatedly, the circuit opens and subsequent
//! calls short-circuit: critic criteria become unevaluated and generator
//! requests fail fast as unavailable.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::duration_str;

/// An external service guarded by its own circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Upstream {
    Critic,
    Generator,
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Upstream::Critic => f.write_str("critic"),
            Upstream::Generator => f.write_str("generator"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before opening circuit
    pub failure_threshold: u32,

    /// Time before attempting recovery
    #[serde(with = "duration_str")]
    pub recovery_timeout: Duration,

    /// Successes needed to close circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Normal operation
    Closed { failures: u32 },

    /// Circuit is open, all calls short-circuit
    Open { opened_at: Instant },

    /// Testing if circuit can close
    HalfOpen { successes: u32 },
}

/// Circuit breaker shared by every run of the process.
///
/// Each upstream has its own circuit to allow independent recovery.
pub struct CircuitBreaker {
    states: RwLock<HashMap<Upstream, CircuitState>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Check if the circuit is open for an upstream.
    ///
    /// Returns true if the call should not be attempted.
    pub fn is_open(&self, upstream: Upstream) -> bool {
        let states = self.states.read();
        match states.get(&upstream) {
            Some(CircuitState::Open { opened_at }) => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    drop(states);
                    self.transition_to_half_open(upstream);
                    false
                } else {
                    true
                }
            }
            Some(CircuitState::HalfOpen { .. }) => false, // Allow test calls
            _ => false,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, upstream: Upstream) {
        let mut states = self.states.write();
        match states.get(&upstream).cloned() {
            Some(CircuitState::HalfOpen { successes }) => {
                if successes + 1 >= self.config.success_threshold {
                    states.insert(upstream, CircuitState::Closed { failures: 0 });
                    tracing::info!(%upstream, "Circuit closed after successful recovery");
                } else {
                    states.insert(
                        upstream,
                        CircuitState::HalfOpen {
                            successes: successes + 1,
                        },
                    );
                }
            }
            Some(CircuitState::Closed { .. }) => {
                states.insert(upstream, CircuitState::Closed { failures: 0 });
            }
            _ => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, upstream: Upstream) {
        let mut states = self.states.write();
        let failures = match states.get(&upstream).cloned() {
            Some(CircuitState::Closed { failures }) => failures + 1,
            None => 1,
            Some(CircuitState::HalfOpen { .. }) => {
                states.insert(
                    upstream,
                    CircuitState::Open {
                        opened_at: Instant::now(),
                    },
                );
                tracing::warn!(%upstream, "Circuit reopened after failed recovery attempt");
                return;
            }
            Some(CircuitState::Open { .. }) => return,
        };

        if failures >= self.config.failure_threshold {
            states.insert(
                upstream,
                CircuitState::Open {
                    opened_at: Instant::now(),
                },
            );
            tracing::warn!(%upstream, failures, "Circuit opened after repeated failures");
        } else {
            states.insert(upstream, CircuitState::Closed { failures });
        }
    }

    fn transition_to_half_open(&self, upstream: Upstream) {
        let mut states = self.states.write();
        if matches!(states.get(&upstream), Some(CircuitState::Open { .. })) {
            states.insert(upstream, CircuitState::HalfOpen { successes: 0 });
            tracing::info!(%upstream, "Circuit half-open, allowing a recovery test");
        }
    }

    /// Get current state of a circuit.
    pub fn state(&self, upstream: Upstream) -> CircuitState {
        self.states
            .read()
            .get(&upstream)
            .cloned()
            .unwrap_or(CircuitState::Closed { failures: 0 })
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.states.write().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
