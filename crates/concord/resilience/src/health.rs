//! Health aggregation over per-dependency circuit breakers.
//!
//! The registry owns one [`CircuitBreaker`] per dependency name and publishes
//! a fresh [`HealthSnapshot`] every time any breaker changes state.
//! Snapshots are never rewritten after publication.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use concord_types::CircuitBreakerConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState, StateTransition};
use crate::error::GuardError;

/// Coarse health classification derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            HealthStatus::Healthy
        } else if score >= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Aggregate view of all monitored dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub dependencies: BTreeMap<String, CircuitBreakerStats>,

    /// Mean state weight over all dependencies, in [0.0, 1.0].
    pub health_score: f64,

    pub status: HealthStatus,

    pub computed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    fn from_stats(dependencies: BTreeMap<String, CircuitBreakerStats>) -> Self {
        let health_score = if dependencies.is_empty() {
            1.0
        } else {
            let total: f64 = dependencies.values().map(|s| s.state.health_weight()).sum();
            total / dependencies.len() as f64
        };

        Self {
            dependencies,
            health_score,
            status: HealthStatus::from_score(health_score),
            computed_at: Utc::now(),
        }
    }

    pub fn state_of(&self, dependency: &str) -> Option<CircuitState> {
        self.dependencies.get(dependency).map(|s| s.state)
    }

    /// Dependencies whose circuit is currently open.
    pub fn open_circuits(&self) -> Vec<&str> {
        self.dependencies
            .values()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.dependency.as_str())
            .collect()
    }
}

/// Circuit breakers keyed by dependency name, plus health aggregation.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    snapshot_tx: watch::Sender<HealthSnapshot>,
    transition_tx: broadcast::Sender<StateTransition>,
}

impl CircuitBreakerRegistry {
    /// Create a registry; breakers are created on first use with `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(HealthSnapshot::from_stats(BTreeMap::new()));
        let (transition_tx, _) = broadcast::channel(256);

        Self {
            config,
            breakers: DashMap::new(),
            snapshot_tx,
            transition_tx,
        }
    }

    /// Get or create the breaker for a dependency.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return existing.clone();
        }
        let breaker = self
            .breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config.clone())))
            .clone();
        self.publish(Vec::new());
        breaker
    }

    pub fn record_success(&self, dependency: &str) {
        let transitions = self.breaker(dependency).record_success();
        self.publish(transitions);
    }

    pub fn record_failure(&self, dependency: &str) {
        let transitions = self.breaker(dependency).record_failure();
        self.publish(transitions);
    }

    pub fn current_state(&self, dependency: &str) -> CircuitState {
        let (state, transition) = self.breaker(dependency).observe();
        self.publish(transition.into_iter().collect());
        state
    }

    /// True unless the dependency's circuit is open.
    pub fn is_healthy(&self, dependency: &str) -> bool {
        self.current_state(dependency) != CircuitState::Open
    }

    /// Force a dependency's circuit open (used by fault injection).
    pub fn force_open(&self, dependency: &str) {
        let transition = self.breaker(dependency).force_state(CircuitState::Open);
        self.publish(transition.into_iter().collect());
    }

    /// Close a dependency's circuit and clear its failure count.
    pub fn reset(&self, dependency: &str) {
        let transition = self.breaker(dependency).reset();
        self.publish(transition.into_iter().collect());
    }

    /// Compute the current snapshot, applying any due timeout transitions.
    pub fn snapshot(&self) -> HealthSnapshot {
        let (snapshot, transitions) = self.collect();
        if !transitions.is_empty() {
            self.announce(&transitions);
            self.snapshot_tx.send_replace(snapshot.clone());
        }
        snapshot
    }

    /// Receive every snapshot published after a state change.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Receive individual state transitions.
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transition_tx.subscribe()
    }

    pub fn dependencies(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    /// Run `call` under the dependency's breaker.
    ///
    /// Fails fast without polling `call` when the circuit is open; otherwise
    /// records the outcome.
    #[instrument(skip(self, call))]
    pub async fn guard<F, T, E>(&self, dependency: &str, call: F) -> Result<T, GuardError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.is_healthy(dependency) {
            debug!(dependency, "Call refused, circuit open");
            return Err(GuardError::CircuitOpen(dependency.to_string()));
        }

        match call.await {
            Ok(value) => {
                self.record_success(dependency);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(dependency);
                Err(GuardError::Failed(e))
            }
        }
    }

    /// [`guard`](Self::guard) with a deadline; expiry counts as a failure.
    pub async fn guard_with_timeout<F, T, E>(
        &self,
        dependency: &str,
        timeout: Duration,
        call: F,
    ) -> Result<T, GuardError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.is_healthy(dependency) {
            return Err(GuardError::CircuitOpen(dependency.to_string()));
        }

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => {
                self.record_success(dependency);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(dependency);
                Err(GuardError::Failed(e))
            }
            Err(_) => {
                warn!(dependency, timeout_ms = timeout.as_millis() as u64, "Guarded call timed out");
                self.record_failure(dependency);
                Err(GuardError::TimedOut {
                    dependency: dependency.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn collect(&self) -> (HealthSnapshot, Vec<StateTransition>) {
        // Clone the breakers out first so no shard lock is held while
        // individual breaker locks are taken.
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();

        let mut transitions = Vec::new();
        let mut stats = BTreeMap::new();
        for breaker in breakers {
            if let (_, Some(transition)) = breaker.observe() {
                transitions.push(transition);
            }
            stats.insert(breaker.dependency().to_string(), breaker.stats());
        }

        (HealthSnapshot::from_stats(stats), transitions)
    }

    /// Recompute and publish a snapshot if anything changed.
    fn publish(&self, mut transitions: Vec<StateTransition>) {
        let known = self.snapshot_tx.borrow().dependencies.len();
        if transitions.is_empty() && known == self.breakers.len() {
            return;
        }

        let (snapshot, timeout_transitions) = self.collect();
        transitions.extend(timeout_transitions);
        self.announce(&transitions);
        debug!(
            health_score = snapshot.health_score,
            status = %snapshot.status,
            "Health snapshot recomputed"
        );
        self.snapshot_tx.send_replace(snapshot);
    }

    fn announce(&self, transitions: &[StateTransition]) {
        for transition in transitions {
            // No subscribers is fine.
            let _ = self.transition_tx.send(transition.clone());
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_ms: 100,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_failures_open_the_circuit() {
        let registry = registry();

        registry.record_failure("opa");
        assert!(registry.is_healthy("opa"));
        registry.record_failure("opa");

        assert_eq!(registry.current_state("opa"), CircuitState::Open);
        assert!(!registry.is_healthy("opa"));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_timeout_then_outcome_decides_state() {
        let registry = registry();
        registry.record_failure("opa");
        registry.record_failure("opa");
        registry.record_failure("redis");
        registry.record_failure("redis");

        tokio::time::advance(Duration::from_millis(100)).await;
        registry.record_success("opa");
        registry.record_failure("redis");

        assert_eq!(registry.current_state("opa"), CircuitState::Closed);
        assert_eq!(registry.current_state("redis"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_scores_states() {
        let registry = registry();
        assert_eq!(registry.snapshot().health_score, 1.0);

        registry.record_success("a");
        registry.record_failure("b");
        registry.record_failure("b");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.dependencies.len(), 2);
        assert!((snapshot.health_score - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert_eq!(snapshot.open_circuits(), vec!["b"]);

        tokio::time::advance(Duration::from_millis(100)).await;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.state_of("b"), Some(CircuitState::HalfOpen));
        assert!((snapshot.health_score - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_are_published_on_state_change() {
        let registry = registry();
        let mut rx = registry.subscribe();
        rx.borrow_and_update();

        registry.record_failure("opa");
        registry.record_failure("opa");

        assert!(rx.has_changed().unwrap());
        let published = rx.borrow_and_update().clone();
        assert_eq!(published.state_of("opa"), Some(CircuitState::Open));

        // A failure on an already-open circuit is not a state change.
        registry.record_failure("opa");
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_broadcast() {
        let registry = registry();
        let mut rx = registry.transitions();

        registry.record_failure("opa");
        registry.record_failure("opa");

        let transition = rx.recv().await.unwrap();
        assert_eq!(transition.dependency, "opa");
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_fails_fast_when_open() {
        let registry = registry();
        registry.force_open("opa");

        let mut called = false;
        let result: Result<(), GuardError<String>> = registry
            .guard("opa", async {
                called = true;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert!(!called);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_records_outcomes() {
        let registry = registry();

        let _ = registry
            .guard("opa", async { Err::<(), _>("boom".to_string()) })
            .await;
        let _ = registry
            .guard("opa", async { Err::<(), _>("boom".to_string()) })
            .await;

        assert_eq!(registry.current_state("opa"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_timeout_counts_as_failure() {
        let registry = registry();

        let result = registry
            .guard_with_timeout("slow", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<(), String>(())
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(registry.breaker("slow").stats().consecutive_failures, 1);
    }
}
