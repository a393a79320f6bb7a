//! Error types for concord-daemon

use concord_types::BusError;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bus construction or runtime error
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Background task failed to shut down cleanly
    #[error("Background task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        DaemonError::Config(e.to_string())
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
