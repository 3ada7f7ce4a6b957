//! Three-state fail-fast guard, one instance per external dependency.
//!
//! Adapted from the domain-keyed `DashMap<String, DomainHealth>` circuit
//! breaker: here each named dependency (`"psi_api"`, `"google_ai"`) gets its
//! own breaker rather than sharing one keyed by crawled domain, since the
//! audit control plane only ever talks to two fixed external APIs.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    successes_in_half_open: u32,
    half_open_in_flight: u32,
    last_failure: Option<Instant>,
    state_entered_at: Instant,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            successes_in_half_open: 0,
            half_open_in_flight: 0,
            last_failure: None,
            state_entered_at: Instant::now(),
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.state_entered_at = Instant::now();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub seconds_in_state: f64,
}

/// A single named circuit breaker. State transitions are serialized under one lock;
/// the Open→HalfOpen timeout check is performed lazily inside `can_execute`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Whether a call should be allowed through. Performs the lazy
    /// Open→HalfOpen transition and increments the half-open in-flight
    /// counter when returning `true` from `HalfOpen`.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    inner.transition(CircuitState::HalfOpen);
                    inner.successes_in_half_open = 0;
                    inner.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.total_calls += 1;
        inner.total_successes += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.successes_in_half_open += 1;
            if inner.half_open_in_flight > 0 {
                inner.half_open_in_flight -= 1;
            }
            if inner.successes_in_half_open >= self.config.success_threshold {
                inner.transition(CircuitState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Open);
                inner.half_open_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::new();
    }

    pub fn state(&self) -> CircuitState {
        // Querying state alone also performs the lazy timeout check, matching
        // the spec's "the state query implicitly performs the Open→HalfOpen check".
        let should_probe = {
            let inner = self.inner.lock();
            inner.state == CircuitState::Open
                && inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(false)
        };
        if should_probe {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open {
                inner.transition(CircuitState::HalfOpen);
                inner.successes_in_half_open = 0;
            }
        }
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            seconds_in_state: inner.state_entered_at.elapsed().as_secs_f64(),
        }
    }
}

/// Fixed names for the two circuit breakers this crate ever constructs.
pub const PSI_CIRCUIT_BREAKER: &str = "psi_api";
pub const AI_CIRCUIT_BREAKER: &str = "google_ai";

/// Owns the two named breakers guarding the field-data API and the
/// generative-model API. Constructed once at startup and shared via `Arc`.
pub struct CircuitBreakerRegistry {
    pub psi: CircuitBreaker,
    pub ai: CircuitBreaker,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self {
            psi: CircuitBreaker::new(CircuitBreakerConfig::default()),
            ai: CircuitBreaker::new(CircuitBreakerConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: recovery,
            half_open_max_calls: 1,
            success_threshold,
        })
    }

    #[test]
    fn closed_allows_calls_and_tracks_success() {
        let cb = breaker(3, 2, Duration::from_secs(60));
        assert!(cb.can_execute());
        cb.record_success();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_successes, 1);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(3, 2, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(cb.can_execute() || cb.stats().state == CircuitState::Open);
            cb.record_failure();
        }
        assert_eq!(cb.stats().state, CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn half_open_after_recovery_timeout_then_closes_on_successes() {
        let cb = breaker(2, 2, Duration::from_millis(50));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.stats().state, CircuitState::Open);

        std::thread::sleep(Duration::from_millis(80));
        assert!(cb.can_execute());
        assert_eq!(cb.stats().state, CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.stats().state, CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.stats().state, CircuitState::Closed);
    }

    #[test]
    fn any_failure_in_half_open_reopens() {
        let cb = breaker(1, 2, Duration::from_millis(20));
        cb.record_failure();
        assert_eq!(cb.stats().state, CircuitState::Open);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_execute());
        assert_eq!(cb.stats().state, CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.stats().state, CircuitState::Open);
    }

    #[test]
    fn reset_forces_closed() {
        let cb = breaker(1, 1, Duration::from_secs(60));
        cb.record_failure();
        assert_eq!(cb.stats().state, CircuitState::Open);
        cb.reset();
        assert_eq!(cb.stats().state, CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[test]
    fn half_open_limits_concurrent_in_flight_calls() {
        let cb = breaker(1, 5, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_execute());
        // half_open_max_calls is 1, so a second concurrent probe is rejected.
        assert!(!cb.can_execute());
    }
}
