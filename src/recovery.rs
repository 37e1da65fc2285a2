// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Circuit breaking for external connections
//!
//! Guards every external dependency of the gateway: exporters writing to
//! destinations, collectors talking to devices, and the control-plane client.
//! Time is passed in explicitly so the breaker can be driven from any clock.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    #[default]
    Closed,
    /// Failing - rejecting requests until the cool-down ends
    Open,
    /// Cool-down elapsed - exactly one probe is allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    pub cool_down: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state, reported by components through their health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_until_ms: Option<u64>,
}

/// Circuit breaker for fault tolerance
///
/// CLOSED lets traffic through and counts consecutive failures. Reaching the
/// threshold opens the circuit for the cool-down. After the cool-down the
/// first caller gets the single HALF_OPEN probe; its success closes the
/// circuit, its failure reopens it and restarts the cool-down.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    open_until_ms: Option<u64>,
    probe_in_flight: bool,
    config: CircuitConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    /// Create a circuit breaker with custom configuration
    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until_ms: None,
            probe_in_flight: false,
            config,
        }
    }

    /// Ask for permission to make a call at `now_ms`
    ///
    /// Returns false while the circuit is open, and for every caller after
    /// the first once the circuit is half-open.
    pub fn try_acquire(&mut self, now_ms: u64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.open_until_ms.is_some_and(|until| now_ms >= until) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.open_until_ms = None;
        self.probe_in_flight = false;
    }

    /// Record a failed call at `now_ms`
    pub fn record_failure(&mut self, now_ms: u64) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now_ms);
                }
            }
            CircuitState::HalfOpen => self.open(now_ms),
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, now_ms: u64) {
        self.state = CircuitState::Open;
        self.probe_in_flight = false;
        self.open_until_ms = Some(now_ms + self.config.cool_down.as_millis() as u64);
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Get current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    /// Milliseconds until a probe is allowed, zero unless open
    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        match (self.state, self.open_until_ms) {
            (CircuitState::Open, Some(until)) => until.saturating_sub(now_ms),
            _ => 0,
        }
    }

    /// Snapshot for health reporting
    pub fn status(&self) -> CircuitStatus {
        CircuitStatus {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            open_until_ms: match self.state {
                CircuitState::Open => self.open_until_ms,
                _ => None,
            },
        }
    }

    /// Reset the circuit breaker to initial state
    pub fn reset(&mut self) {
        self.record_success();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitConfig {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_circuit_state_default() {
        assert_eq!(CircuitState::default(), CircuitState::Closed);
        assert_eq!(CircuitState::HalfOpen.as_str(), "HALF_OPEN");
    }

    #[test]
    fn test_opens_after_five_consecutive_failures() {
        let mut cb = breaker();
        for i in 0..4 {
            assert!(cb.try_acquire(i));
            cb.record_failure(i);
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(cb.try_acquire(4));
        cb.record_failure(4);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().open_until_ms, Some(30_004));
        assert!(!cb.try_acquire(5));
        assert_eq!(cb.retry_after_ms(10_004), 20_000);
    }

    #[test]
    fn test_success_resets_count() {
        let mut cb = breaker();
        cb.record_failure(0);
        cb.record_failure(1);
        assert_eq!(cb.failure_count(), 2);
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_exactly_one_half_open_probe() {
        let mut cb = breaker();
        for i in 0..5 {
            cb.record_failure(i);
        }
        assert!(!cb.try_acquire(20_000));

        assert!(cb.try_acquire(30_004));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.try_acquire(30_005));
        assert!(!cb.try_acquire(30_006));
    }

    #[test]
    fn test_probe_success_closes() {
        let mut cb = breaker();
        for i in 0..5 {
            cb.record_failure(i);
        }
        assert!(cb.try_acquire(40_000));
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.try_acquire(40_001));
    }

    #[test]
    fn test_probe_failure_reopens_with_new_cool_down() {
        let mut cb = breaker();
        for i in 0..5 {
            cb.record_failure(i);
        }
        assert!(cb.try_acquire(40_000));
        cb.record_failure(40_000);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire(69_999));
        assert!(cb.try_acquire(70_000));
    }

    #[test]
    fn test_reset() {
        let mut cb = breaker();
        for i in 0..5 {
            cb.record_failure(i);
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status(), CircuitStatus::default());
    }
}
