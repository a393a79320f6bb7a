//! Circuit breaker pattern for resilience.
//!
//! Prevents cascading failures by tracking consecutive failures of a
//! dependency and temporarily refusing calls to it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use concord_types::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,

    /// Circuit is open, requests are blocked.
    Open,

    /// Recovery timeout elapsed; the next outcome decides the state.
    HalfOpen,
}

impl CircuitState {
    /// Contribution of this state to the aggregate health score.
    pub fn health_weight(&self) -> f64 {
        match self {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A state change of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub dependency: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    last_transition: DateTime<Utc>,
}

/// Circuit breaker for a single dependency.
///
/// - Closed: calls allowed; consecutive failures ≥ threshold opens it
/// - Open: calls refused until the recovery timeout elapses
/// - Half-Open: the next success closes it, the next failure re-opens it
///
/// The Open → Half-Open transition is observed lazily, on the next query
/// or recorded outcome after the timeout.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker for a dependency.
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_at: None,
                last_transition: Utc::now(),
            }),
        }
    }

    /// Get the dependency name.
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.observe().0
    }

    /// Current state plus the timeout transition it triggered, if any.
    pub fn observe(&self) -> (CircuitState, Option<StateTransition>) {
        let mut inner = self.lock();
        let transition = self.check_timeout(&mut inner);
        (inner.state, transition)
    }

    /// Whether a call may be attempted.
    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Record a successful call. Returns the transitions it caused.
    pub fn record_success(&self) -> Vec<StateTransition> {
        let mut inner = self.lock();
        let mut transitions: Vec<StateTransition> =
            self.check_timeout(&mut inner).into_iter().collect();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(
                    dependency = %self.dependency,
                    "Circuit breaker closing after successful probe"
                );
                transitions.push(self.transition_to(&mut inner, CircuitState::Closed));
            }
            CircuitState::Open => {
                debug!(
                    dependency = %self.dependency,
                    "Success recorded while circuit open"
                );
            }
        }

        transitions
    }

    /// Record a failed call. Returns the transitions it caused.
    pub fn record_failure(&self) -> Vec<StateTransition> {
        let mut inner = self.lock();
        let mut transitions: Vec<StateTransition> =
            self.check_timeout(&mut inner).into_iter().collect();

        inner.last_failure_at = Some(Utc::now());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        dependency = %self.dependency,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opening due to failures"
                    );
                    transitions.push(self.transition_to(&mut inner, CircuitState::Open));
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    dependency = %self.dependency,
                    "Circuit breaker re-opening after half-open failure"
                );
                transitions.push(self.transition_to(&mut inner, CircuitState::Open));
            }
            CircuitState::Open => {}
        }

        transitions
    }

    /// Force the circuit to a specific state.
    pub fn force_state(&self, new_state: CircuitState) -> Option<StateTransition> {
        let mut inner = self.lock();
        if inner.state == new_state {
            return None;
        }
        info!(
            dependency = %self.dependency,
            old_state = %inner.state,
            new_state = %new_state,
            "Circuit breaker state forced"
        );
        Some(self.transition_to(&mut inner, new_state))
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) -> Option<StateTransition> {
        self.force_state(CircuitState::Closed)
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock();
        CircuitBreakerStats {
            dependency: self.dependency.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout_ms,
            last_transition: inner.last_transition,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move Open → Half-Open once the recovery timeout has passed.
    fn check_timeout(&self, inner: &mut BreakerInner) -> Option<StateTransition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        if opened_at.elapsed() < self.config.recovery_timeout() {
            return None;
        }

        info!(
            dependency = %self.dependency,
            "Circuit breaker transitioning to half-open after timeout"
        );
        Some(self.transition_to(inner, CircuitState::HalfOpen))
    }

    /// Transition to a new state, resetting counters as needed.
    fn transition_to(&self, inner: &mut BreakerInner, new_state: CircuitState) -> StateTransition {
        let from = inner.state;
        let at = Utc::now();
        inner.state = new_state;
        inner.last_transition = at;

        match new_state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.opened_at = None;
            }
        }

        StateTransition {
            dependency: self.dependency.clone(),
            from,
            to: new_state,
            at,
        }
    }
}

/// Statistics for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Dependency name.
    pub dependency: String,

    /// Current state.
    pub state: CircuitState,

    /// Consecutive failures since the last success or close.
    pub consecutive_failures: u32,

    /// Time of the most recent failure.
    pub last_failure_at: Option<DateTime<Utc>>,

    /// Configured failure threshold.
    pub failure_threshold: u32,

    /// Configured recovery timeout.
    pub recovery_timeout_ms: u64,

    /// Time of last state transition.
    pub last_transition: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_closed_to_open() {
        let breaker = CircuitBreaker::new("policy", test_config());

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let transitions = breaker.record_failure();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, CircuitState::Open);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_success_resets_failures() {
        let breaker = CircuitBreaker::new("policy", test_config());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_to_half_open_after_timeout() {
        let breaker = CircuitBreaker::new("policy", test_config());
        breaker.force_state(CircuitState::Open);

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_timeout_closes() {
        let breaker = CircuitBreaker::new("policy", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_millis(150)).await;
        let transitions = breaker.record_success();

        let states: Vec<_> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(states, vec![CircuitState::HalfOpen, CircuitState::Closed]);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_timeout_reopens() {
        let breaker = CircuitBreaker::new("policy", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_millis(150)).await;
        let transitions = breaker.record_failure();

        let states: Vec<_> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(states, vec![CircuitState::HalfOpen, CircuitState::Open]);

        // The reopened circuit waits a full timeout again.
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_open_is_ignored() {
        let breaker = CircuitBreaker::new("policy", test_config());
        breaker.force_state(CircuitState::Open);

        assert!(breaker.record_success().is_empty());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
