//! Saga errors and failure records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a forward action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    /// The action returned an error.
    Error,
    Timeout,
    Panic,
    /// The guarding circuit was open; the action was not attempted.
    DependencyUnavailable,
    /// Cancellation was requested before the step started.
    Cancelled,
}

impl std::fmt::Display for StepFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepFailureKind::Error => "error",
            StepFailureKind::Timeout => "timeout",
            StepFailureKind::Panic => "panic",
            StepFailureKind::DependencyUnavailable => "dependency_unavailable",
            StepFailureKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The failure that triggered a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub kind: StepFailureKind,
    pub reason: String,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step {} failed ({}): {}", self.step, self.kind, self.reason)
    }
}

/// A compensation that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SagaError {
    /// A step failed and every completed step was compensated.
    #[error("{failure}; rolled back {} step(s)", .compensated.len())]
    StepFailed {
        failure: StepFailure,
        compensated: Vec<String>,
    },

    /// A step failed and at least one compensation failed too.
    #[error(
        "{failure}; {} compensation(s) failed: {}",
        .compensation_failures.len(),
        .compensation_failures
            .iter()
            .map(|f| f.step.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )]
    CompensationFailed {
        failure: StepFailure,
        compensated: Vec<String>,
        compensation_failures: Vec<CompensationFailure>,
    },

    #[error("duplicate step: {0}")]
    DuplicateStep(String),

    #[error("invalid saga state: {0}")]
    InvalidState(String),
}

impl SagaError {
    /// The step failure behind a rollback, if this error is one.
    pub fn failure(&self) -> Option<&StepFailure> {
        match self {
            SagaError::StepFailed { failure, .. }
            | SagaError::CompensationFailed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

pub type SagaResult<T> = Result<T, SagaError>;
