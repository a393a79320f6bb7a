//! Policy commitment check.

use async_trait::async_trait;
use concord_types::{AgentMessage, ValidationResult};
use serde_json::json;

use crate::strategy::ValidationStrategy;

/// Compares the message's policy commitment with the configured one.
///
/// Both sides are hashed and the digests compared; `blake3::Hash` equality is
/// constant-time, so the comparison does not leak the matching prefix length.
pub struct StaticHashStrategy {
    expected: blake3::Hash,
}

impl StaticHashStrategy {
    pub fn new(commitment: impl AsRef<str>) -> Self {
        Self {
            expected: blake3::hash(commitment.as_ref().as_bytes()),
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        blake3::hash(candidate.as_bytes()) == self.expected
    }
}

#[async_trait]
impl ValidationStrategy for StaticHashStrategy {
    fn name(&self) -> &str {
        "static_hash"
    }

    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        if message.policy_commitment.is_empty() {
            return ValidationResult::invalid("missing policy commitment");
        }
        if !self.matches(&message.policy_commitment) {
            return ValidationResult::invalid("policy commitment mismatch");
        }
        ValidationResult::valid().with_metadata("commitment_verified", json!(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::MessageType;

    fn message(commitment: &str) -> AgentMessage {
        AgentMessage::new("a", "b", MessageType::Command, json!({"op": 1}), commitment)
    }

    #[tokio::test]
    async fn matching_commitment_is_valid() {
        let strategy = StaticHashStrategy::new("cdd01ef066bc6cf2");
        let result = strategy.validate(&message("cdd01ef066bc6cf2")).await;
        assert!(result.is_allowed());
        assert_eq!(result.metadata["commitment_verified"], json!(true));
    }

    #[tokio::test]
    async fn mismatched_commitment_is_denied() {
        let strategy = StaticHashStrategy::new("cdd01ef066bc6cf2");
        let result = strategy.validate(&message("cdd01ef066bc6cf3")).await;
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["policy commitment mismatch"]);
    }

    #[tokio::test]
    async fn empty_commitment_is_denied() {
        let strategy = StaticHashStrategy::new("cdd01ef066bc6cf2");
        let result = strategy.validate(&message("")).await;
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["missing policy commitment"]);
    }
}
