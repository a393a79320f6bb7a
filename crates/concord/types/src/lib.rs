//! Concord Types - shared vocabulary of the Concord message bus
//!
//! Every other Concord crate speaks in these types:
//!
//! - [`AgentMessage`]: the unit of communication, always carrying a policy commitment
//! - [`ValidationResult`]: the mergeable verdict produced by validation strategies
//! - [`AgentRegistration`]: a registered agent with its capabilities and tenant
//! - [`BusConfig`]: the immutable configuration handed to every component
//! - [`Cancellation`]: cooperative cancellation for long-running executions

#![deny(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod ids;
pub mod message;
pub mod registration;
pub mod validation;

pub use cancel::{Cancellation, CancellationHandle};
pub use config::{
    AuditConfig, BackoffConfig, BusConfig, ChaosConfig, CircuitBreakerConfig, DagConfig,
    RecoveryConfig, RouterConfig, SagaConfig, StrategyKind, ValidationConfig,
    DEFAULT_POLICY_COMMITMENT,
};
pub use error::{BusError, BusResult, RoutingFailure};
pub use ids::{AgentId, ConversationId, MessageId, TenantId};
pub use message::{AgentMessage, MessageType, Priority, Recipient};
pub use registration::AgentRegistration;
pub use validation::{Decision, ValidationResult};
