//! Error types for concord-resilience.

use thiserror::Error;

use crate::chaos::ScenarioId;
use crate::recovery::OperationId;

/// Errors raised by resilience components.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Circuit breaker is open, the call was not attempted.
    #[error("dependency unavailable, circuit open: {0}")]
    DependencyUnavailable(String),

    /// Deadline exceeded.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Recovery task not tracked by the orchestrator.
    #[error("recovery task not found: {0}")]
    TaskNotFound(OperationId),

    /// Recovery task is in a state that does not allow the request.
    #[error("recovery task {operation_id} is {state}, cannot {action}")]
    InvalidTaskState {
        operation_id: OperationId,
        state: String,
        action: &'static str,
    },

    /// A retried operation failed again.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error(transparent)]
    Chaos(#[from] ChaosError),
}

/// Reasons a fault-injection scenario is refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChaosError {
    #[error("fault injection is disabled")]
    Disabled,

    #[error("emergency stop is active")]
    EmergencyStopped,

    #[error("policy commitment mismatch")]
    CommitmentMismatch,

    #[error("blast radius {requested} outside allowed range 1..={max}")]
    BlastRadiusExceeded { requested: usize, max: usize },

    #[error("probability {0} outside [0, 1]")]
    InvalidProbability(f64),

    #[error("scenario duration {requested_ms}ms outside allowed range 1..={max_ms}ms")]
    InvalidDuration { requested_ms: u64, max_ms: u64 },

    #[error("too many active scenarios (max {0})")]
    TooManyScenarios(usize),

    #[error("scenario not found: {0}")]
    ScenarioNotFound(ScenarioId),
}

/// Outcome of a call made through a circuit breaker guard.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The circuit was open; the call was never made.
    #[error("dependency unavailable, circuit open: {0}")]
    CircuitOpen(String),

    /// The call exceeded its deadline.
    #[error("call to {dependency} timed out after {timeout_ms}ms")]
    TimedOut { dependency: String, timeout_ms: u64 },

    /// The call ran and failed.
    #[error("call failed: {0}")]
    Failed(E),
}

impl<E> GuardError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GuardError::CircuitOpen(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GuardError::TimedOut { .. })
    }
}

/// Result type for resilience operations.
pub type ResilienceResult<T> = Result<T, ResilienceError>;
