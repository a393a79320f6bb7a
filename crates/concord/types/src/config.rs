//! Bus configuration.
//!
//! [`BusConfig`] is constructed once and handed, by value or behind an `Arc`,
//! to every component at construction time. Nothing in Concord reads global
//! mutable configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BusError, BusResult};

/// Policy commitment compiled into the bus when none is configured.
pub const DEFAULT_POLICY_COMMITMENT: &str = "cdd01ef066bc6cf2";

/// Top-level configuration for a bus deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Commitment token every message must carry.
    #[serde(default = "default_policy_commitment")]
    pub policy_commitment: String,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub chaos: ChaosConfig,

    #[serde(default)]
    pub dag: DagConfig,

    #[serde(default)]
    pub saga: SagaConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            policy_commitment: default_policy_commitment(),
            validation: ValidationConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            recovery: RecoveryConfig::default(),
            router: RouterConfig::default(),
            audit: AuditConfig::default(),
            chaos: ChaosConfig::default(),
            dag: DagConfig::default(),
            saga: SagaConfig::default(),
        }
    }
}

impl BusConfig {
    /// Configuration bound to a specific policy commitment.
    pub fn with_commitment(commitment: impl Into<String>) -> Self {
        Self {
            policy_commitment: commitment.into(),
            ..Default::default()
        }
    }

    /// Reject configurations that cannot be run safely.
    pub fn validate(&self) -> BusResult<()> {
        if self.policy_commitment.trim().is_empty() {
            return Err(BusError::Configuration(
                "policy_commitment must not be empty".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(BusError::Configuration(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.recovery.max_attempts == 0 {
            return Err(BusError::Configuration(
                "recovery.max_attempts must be at least 1".into(),
            ));
        }
        if self.router.inbound_queue_capacity == 0 || self.audit.queue_capacity == 0 {
            return Err(BusError::Configuration(
                "queue capacities must be at least 1".into(),
            ));
        }
        if self.dag.max_parallelism == 0 {
            return Err(BusError::Configuration(
                "dag.max_parallelism must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.validation.impact_threshold) {
            return Err(BusError::Configuration(
                "validation.impact_threshold must be within [0, 1]".into(),
            ));
        }
        if self.validation.strategies.is_empty() {
            return Err(BusError::Configuration(
                "validation.strategies must name at least one strategy".into(),
            ));
        }
        Ok(())
    }
}

/// Validation strategies that can be named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    StaticHash,
    Expiry,
    DynamicPolicy,
}

/// Validation pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Deny when the policy backend errors or times out.
    #[serde(default = "default_true")]
    pub fail_closed: bool,

    /// Policy document path sent to the backend.
    #[serde(default = "default_policy_path")]
    pub policy_path: String,

    #[serde(default = "default_policy_timeout_ms")]
    pub policy_timeout_ms: u64,

    /// Strategies composed into the pipeline, in order.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,

    /// Impact score at or above which a message is flagged.
    #[serde(default = "default_impact_threshold")]
    pub impact_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            fail_closed: true,
            policy_path: default_policy_path(),
            policy_timeout_ms: default_policy_timeout_ms(),
            strategies: default_strategies(),
            impact_threshold: default_impact_threshold(),
        }
    }
}

impl ValidationConfig {
    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(self.policy_timeout_ms)
    }
}

/// Circuit breaker thresholds, shared by every monitored dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before allowing a probe.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Base and cap of a backoff curve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl BackoffConfig {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Recovery orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Failures (original call included) after which a task is exhausted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_exponential")]
    pub exponential: BackoffConfig,

    #[serde(default = "default_linear")]
    pub linear: BackoffConfig,

    /// Delay before re-checking a task whose dependency circuit is open.
    #[serde(default = "default_circuit_recheck_ms")]
    pub circuit_recheck_ms: u64,

    /// Interval of the background recovery worker.
    #[serde(default = "default_worker_interval_ms")]
    pub worker_interval_ms: u64,

    /// Exhausted tasks kept for inspection; the oldest is dropped first.
    #[serde(default = "default_exhausted_capacity")]
    pub exhausted_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            exponential: default_exponential(),
            linear: default_linear(),
            circuit_recheck_ms: default_circuit_recheck_ms(),
            worker_interval_ms: default_worker_interval_ms(),
            exhausted_capacity: default_exhausted_capacity(),
        }
    }
}

impl RecoveryConfig {
    pub fn circuit_recheck(&self) -> Duration {
        Duration::from_millis(self.circuit_recheck_ms)
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }
}

/// Message router configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Deadline for a single handler invocation.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Capacity of the queue backing `receive`.
    #[serde(default = "default_queue_capacity")]
    pub inbound_queue_capacity: usize,

    /// Refuse delivery across tenants.
    #[serde(default = "default_true")]
    pub tenant_isolation: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            inbound_queue_capacity: default_queue_capacity(),
            tenant_isolation: true,
        }
    }
}

impl RouterConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Audit queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Events buffered before the oldest is dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Safety limits for controlled fault injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaosConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_scenarios")]
    pub max_concurrent_scenarios: usize,

    /// Largest number of targets one scenario may affect.
    #[serde(default = "default_max_blast_radius")]
    pub max_blast_radius: usize,

    #[serde(default = "default_max_scenario_duration_ms")]
    pub max_duration_ms: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_scenarios: default_max_scenarios(),
            max_blast_radius: default_max_blast_radius(),
            max_duration_ms: default_max_scenario_duration_ms(),
        }
    }
}

impl ChaosConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// DAG executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagConfig {
    #[serde(default = "default_task_timeout_ms")]
    pub default_node_timeout_ms: u64,

    /// Upper bound on nodes running at once.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_ms: default_task_timeout_ms(),
            max_parallelism: default_max_parallelism(),
        }
    }
}

impl DagConfig {
    pub fn default_node_timeout(&self) -> Duration {
        Duration::from_millis(self.default_node_timeout_ms)
    }
}

/// Saga coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaConfig {
    #[serde(default = "default_task_timeout_ms")]
    pub default_step_timeout_ms: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: default_task_timeout_ms(),
        }
    }
}

impl SagaConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_policy_commitment() -> String {
    DEFAULT_POLICY_COMMITMENT.to_string()
}

fn default_policy_path() -> String {
    "concord/governance/allow".to_string()
}

fn default_policy_timeout_ms() -> u64 {
    1_000
}

fn default_strategies() -> Vec<StrategyKind> {
    vec![
        StrategyKind::StaticHash,
        StrategyKind::Expiry,
        StrategyKind::DynamicPolicy,
    ]
}

fn default_impact_threshold() -> f64 {
    0.8
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_exponential() -> BackoffConfig {
    BackoffConfig::new(100, 30_000)
}

fn default_linear() -> BackoffConfig {
    BackoffConfig::new(1_000, 60_000)
}

fn default_circuit_recheck_ms() -> u64 {
    1_000
}

fn default_worker_interval_ms() -> u64 {
    100
}

fn default_exhausted_capacity() -> usize {
    1_024
}

fn default_handler_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_max_scenarios() -> usize {
    3
}

fn default_max_blast_radius() -> usize {
    2
}

fn default_max_scenario_duration_ms() -> u64 {
    300_000
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_max_parallelism() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fail_closed() {
        let config = BusConfig::default();
        assert!(config.validation.fail_closed);
        assert_eq!(config.policy_commitment, DEFAULT_POLICY_COMMITMENT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_commitment_is_rejected() {
        let config = BusConfig::with_commitment("  ");
        assert!(matches!(config.validate(), Err(BusError::Configuration(_))));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut config = BusConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: BusConfig = serde_json::from_value(serde_json::json!({
            "policy_commitment": "abc123",
            "validation": { "fail_closed": false },
            "circuit_breaker": { "failure_threshold": 2 }
        }))
        .unwrap();

        assert_eq!(config.policy_commitment, "abc123");
        assert!(!config.validation.fail_closed);
        assert_eq!(config.validation.policy_timeout(), Duration::from_secs(1));
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout_ms, 30_000);
        assert_eq!(config.recovery.exponential.base(), Duration::from_millis(100));
    }
}
