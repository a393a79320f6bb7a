//! Mock strategies and policy backends for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use concord_types::{AgentMessage, ValidationResult};

use crate::error::PolicyError;
use crate::policy::{PolicyBackend, PolicyDecision, PolicyRequest};
use crate::strategy::ValidationStrategy;

/// Strategy that always returns the same result and counts its calls.
pub struct FixedStrategy {
    name: String,
    result: ValidationResult,
    pub calls: AtomicUsize,
}

impl FixedStrategy {
    pub fn allow(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: ValidationResult::valid(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn deny(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: ValidationResult::invalid(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.result.add_warning(warning);
        self
    }
}

#[async_trait]
impl ValidationStrategy for FixedStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _message: &AgentMessage) -> ValidationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Policy backend with a scripted answer.
pub struct MockPolicyBackend {
    answer: Result<PolicyDecision, PolicyError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockPolicyBackend {
    pub fn allow_all() -> Self {
        Self::answering(Ok(PolicyDecision::allow()))
    }

    pub fn deny_all(violations: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::answering(Ok(PolicyDecision::deny(violations)))
    }

    pub fn unavailable() -> Self {
        Self::answering(Err(PolicyError::Unavailable("connection refused".into())))
    }

    fn answering(answer: Result<PolicyDecision, PolicyError>) -> Self {
        Self {
            answer,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyBackend for MockPolicyBackend {
    async fn evaluate(&self, _request: PolicyRequest) -> Result<PolicyDecision, PolicyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer.clone()
    }
}
