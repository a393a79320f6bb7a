use std::sync::Arc;

use async_trait::async_trait;
use concord_types::{AgentMessage, ValidationResult};
use tracing::debug;

/// A single validation check.
#[async_trait]
pub trait ValidationStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, message: &AgentMessage) -> ValidationResult;
}

/// Runs strategies in declared order and merges every result.
///
/// There is no short-circuit: a failing strategy does not stop later ones
/// from reporting their findings.
#[derive(Clone, Default)]
pub struct CompositeStrategy {
    strategies: Vec<Arc<dyn ValidationStrategy>>,
}

impl CompositeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ValidationStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn push(&mut self, strategy: Arc<dyn ValidationStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[async_trait]
impl ValidationStrategy for CompositeStrategy {
    fn name(&self) -> &str {
        "composite"
    }

    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        let mut merged = ValidationResult::valid();
        for strategy in &self.strategies {
            let result = strategy.validate(message).await;
            if !result.is_valid {
                debug!(
                    message_id = %message.id,
                    strategy = strategy.name(),
                    errors = ?result.errors,
                    "Validation strategy rejected message"
                );
            }
            merged.merge(result);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::FixedStrategy;
    use concord_types::MessageType;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn message() -> AgentMessage {
        AgentMessage::new("a", "b", MessageType::Query, json!({}), "c0ffee")
    }

    #[tokio::test]
    async fn empty_composite_is_valid() {
        let result = CompositeStrategy::new().validate(&message()).await;
        assert!(result.is_allowed());
    }

    #[tokio::test]
    async fn runs_every_strategy_without_short_circuit() {
        let first = Arc::new(FixedStrategy::deny("first", "bad commitment"));
        let second = Arc::new(FixedStrategy::allow("second").with_warning("slow path"));
        let third = Arc::new(FixedStrategy::deny("third", "expired"));

        let composite = CompositeStrategy::new()
            .with_strategy(first.clone())
            .with_strategy(second.clone())
            .with_strategy(third.clone());

        let result = composite.validate(&message()).await;

        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["bad commitment", "expired"]);
        assert_eq!(result.warnings, vec!["slow path"]);
        for strategy in [&first, &second, &third] {
            assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
        }
        assert_eq!(composite.strategy_names(), vec!["first", "second", "third"]);
    }
}
