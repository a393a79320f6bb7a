//! Error taxonomy shared across the bus.
//!
//! Validation failures are not errors: they are returned as
//! [`ValidationResult`](crate::ValidationResult) values. Routing failures are
//! kept distinct from validation so callers can tell "denied" from
//! "undeliverable".

use thiserror::Error;

use crate::ids::{AgentId, TenantId};

/// Why a validated message could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingFailure {
    #[error("unknown recipient agent: {0}")]
    UnknownAgent(AgentId),

    #[error("agent {agent} belongs to tenant {agent_tenant}, message is for tenant {message_tenant}")]
    TenantMismatch {
        agent: AgentId,
        agent_tenant: TenantId,
        message_tenant: TenantId,
    },

    #[error("no recipients registered for broadcast in tenant {0}")]
    NoRecipients(TenantId),

    #[error("agent registry unavailable: {0}")]
    RegistryUnavailable(String),
}

/// Errors raised by bus components.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("routing failed: {0}")]
    Routing(#[from] RoutingFailure),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("agent already registered: {0}")]
    AlreadyRegistered(AgentId),

    #[error("handler {handler} failed: {reason}")]
    HandlerFailed { handler: String, reason: String },

    #[error("dependency unavailable (circuit open): {0}")]
    DependencyUnavailable(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
