//! Concord Resilience - keeping the bus standing when dependencies fail
//!
//! - [`CircuitBreakerRegistry`]: per-dependency circuit breakers and the
//!   aggregated [`HealthSnapshot`]
//! - [`RecoveryOrchestrator`]: priority queue of failed operations retried
//!   under exponential, linear, immediate, or manual strategies
//! - [`ChaosEngine`]: controlled fault injection with safety limits
//!
//! Every caller that wraps an external call must check
//! [`CircuitBreakerRegistry::is_healthy`] first and record the outcome after;
//! [`CircuitBreakerRegistry::guard`] does both.

#![deny(unsafe_code)]

pub mod chaos;
pub mod circuit_breaker;
pub mod error;
pub mod health;
pub mod recovery;

pub use chaos::{ChaosEngine, ChaosFault, FaultKind, ScenarioId, ScenarioSpec, ScenarioSummary};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState, StateTransition};
pub use error::{ChaosError, GuardError, ResilienceError, ResilienceResult};
pub use health::{CircuitBreakerRegistry, HealthSnapshot, HealthStatus};
pub use recovery::{
    DelayStrategy, ExponentialBackoff, Immediate, LinearBackoff, Manual, OperationId,
    RecoveryEvent, RecoveryExecutor, RecoveryOrchestrator, RecoveryPriority, RecoveryStrategy,
    RecoveryTask, ScheduleOutcome, StrategyTable, TaskState,
};
