use async_trait::async_trait;
use concord_types::{AgentMessage, ValidationResult};

use crate::strategy::ValidationStrategy;

/// Rejects messages past their `expires_at`.
#[derive(Debug, Clone, Default)]
pub struct ExpiryStrategy;

#[async_trait]
impl ValidationStrategy for ExpiryStrategy {
    fn name(&self) -> &str {
        "expiry"
    }

    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        match message.expires_at {
            Some(expires_at) if message.is_expired() => {
                ValidationResult::invalid(format!("message expired at {}", expires_at.to_rfc3339()))
            }
            _ => ValidationResult::valid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use concord_types::MessageType;
    use serde_json::json;

    fn message() -> AgentMessage {
        AgentMessage::new("a", "b", MessageType::Event, json!(null), "c")
    }

    #[tokio::test]
    async fn unexpired_and_unbounded_messages_pass() {
        assert!(ExpiryStrategy.validate(&message()).await.is_valid);

        let later = message().with_expiry(Utc::now() + Duration::hours(1));
        assert!(ExpiryStrategy.validate(&later).await.is_valid);
    }

    #[tokio::test]
    async fn expired_message_is_rejected() {
        let stale = message().with_expiry(Utc::now() - Duration::seconds(1));
        let result = ExpiryStrategy.validate(&stale).await;
        assert!(!result.is_valid);
        assert!(result.errors[0].starts_with("message expired at"));
    }
}
