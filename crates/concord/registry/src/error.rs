//! Registry error types

use concord_types::{AgentId, BusError};
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Agent already registered: {0}")]
    AlreadyRegistered(AgentId),

    #[error("Agent not found: {0}")]
    NotFound(AgentId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}

impl From<RegistryError> for BusError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyRegistered(id) => BusError::AlreadyRegistered(id),
            RegistryError::NotFound(id) => BusError::AgentNotFound(id),
            RegistryError::Storage(reason) => BusError::Transport(reason),
            RegistryError::Serialization(reason) => BusError::Serialization(reason),
        }
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
