use thiserror::Error;

/// Errors returned by a policy backend.
#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    #[error("policy backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid policy response: {0}")]
    InvalidResponse(String),
}
