//! Dynamic policy evaluation through an external backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_resilience::{CircuitBreakerRegistry, GuardError};
use concord_types::{AgentMessage, ValidationConfig, ValidationResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::PolicyError;
use crate::strategy::ValidationStrategy;

/// Dependency name of the policy backend in the circuit breaker registry.
pub const POLICY_BACKEND: &str = "policy_backend";

/// Query sent to the policy backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub input: serde_json::Value,
    pub policy_path: String,
}

/// Backend verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default)]
    pub violations: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            violations: Vec::new(),
        }
    }

    pub fn deny(violations: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allow: false,
            violations: violations.into_iter().map(Into::into).collect(),
        }
    }
}

/// External policy evaluation service.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    async fn evaluate(&self, request: PolicyRequest) -> Result<PolicyDecision, PolicyError>;
}

/// Asks a [`PolicyBackend`] whether the message is allowed.
///
/// When the backend errors, times out, or its circuit is open the strategy
/// denies (fail-closed). Fail-open must be configured explicitly; it turns
/// those cases into an allow with a warning and is logged on every use.
pub struct DynamicPolicyStrategy {
    backend: Arc<dyn PolicyBackend>,
    breakers: Arc<CircuitBreakerRegistry>,
    policy_path: String,
    timeout: Duration,
    fail_closed: bool,
}

impl DynamicPolicyStrategy {
    pub fn new(
        backend: Arc<dyn PolicyBackend>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: &ValidationConfig,
    ) -> Self {
        if config.fail_closed {
            info!(
                policy_path = %config.policy_path,
                mode = "fail_closed",
                "Dynamic policy validation configured fail-closed: backend outages will deny messages"
            );
        } else {
            warn!(
                policy_path = %config.policy_path,
                mode = "fail_open",
                "Dynamic policy validation configured fail-open: backend outages will allow messages"
            );
        }

        Self {
            backend,
            breakers,
            policy_path: config.policy_path.clone(),
            timeout: config.policy_timeout(),
            fail_closed: config.fail_closed,
        }
    }

    pub fn is_fail_closed(&self) -> bool {
        self.fail_closed
    }

    fn mode(&self) -> &'static str {
        if self.fail_closed {
            "fail_closed"
        } else {
            "fail_open"
        }
    }

    fn unavailable(&self, message: &AgentMessage, reason: String) -> ValidationResult {
        let result = if self.fail_closed {
            ValidationResult::invalid(format!("policy evaluation unavailable: {}", reason))
        } else {
            warn!(
                message_id = %message.id,
                reason = %reason,
                "Policy evaluation unavailable, allowing message (fail-open)"
            );
            ValidationResult::valid()
                .with_warning(format!("policy evaluation skipped (fail-open): {}", reason))
        };
        result
            .with_metadata("policy_mode", json!(self.mode()))
            .with_metadata("policy_evaluated", json!(false))
    }
}

#[async_trait]
impl ValidationStrategy for DynamicPolicyStrategy {
    fn name(&self) -> &str {
        "dynamic_policy"
    }

    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        let input = match serde_json::to_value(message) {
            Ok(input) => input,
            Err(e) => return self.unavailable(message, format!("cannot encode message: {}", e)),
        };
        let request = PolicyRequest {
            input,
            policy_path: self.policy_path.clone(),
        };

        let outcome = self
            .breakers
            .guard_with_timeout(POLICY_BACKEND, self.timeout, self.backend.evaluate(request))
            .await;

        match outcome {
            Ok(decision) if decision.allow => ValidationResult::valid()
                .with_metadata("policy_mode", json!(self.mode()))
                .with_metadata("policy_evaluated", json!(true)),
            Ok(decision) => {
                let mut result = ValidationResult::valid()
                    .with_metadata("policy_mode", json!(self.mode()))
                    .with_metadata("policy_evaluated", json!(true));
                if decision.violations.is_empty() {
                    result.add_error(format!("denied by policy {}", self.policy_path));
                }
                for violation in decision.violations {
                    result.add_error(violation);
                }
                result
            }
            Err(GuardError::CircuitOpen(_)) => {
                self.unavailable(message, "policy backend circuit open".to_string())
            }
            Err(GuardError::TimedOut { timeout_ms, .. }) => {
                self.unavailable(message, format!("policy backend timed out after {}ms", timeout_ms))
            }
            Err(GuardError::Failed(e)) => self.unavailable(message, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockPolicyBackend;
    use concord_resilience::CircuitState;
    use concord_types::{CircuitBreakerConfig, MessageType};

    fn message() -> AgentMessage {
        AgentMessage::new("a", "b", MessageType::TaskRequest, json!({"task": "x"}), "c")
    }

    fn breakers() -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_ms: 30_000,
        }))
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn logged_while(f: impl FnOnce()) -> String {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        logs.text()
    }

    #[test]
    fn construction_logs_the_failure_mode() {
        let closed = logged_while(|| {
            strategy(MockPolicyBackend::allow_all(), true);
        });
        assert!(closed.contains("INFO"));
        assert!(closed.contains("fail_closed"));

        let open = logged_while(|| {
            strategy(MockPolicyBackend::allow_all(), false);
        });
        assert!(open.contains("WARN"));
        assert!(open.contains("fail_open"));
    }

    fn strategy(backend: MockPolicyBackend, fail_closed: bool) -> DynamicPolicyStrategy {
        DynamicPolicyStrategy::new(
            Arc::new(backend),
            breakers(),
            &ValidationConfig {
                fail_closed,
                policy_timeout_ms: 50,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn allow_decision_is_valid() {
        let result = strategy(MockPolicyBackend::allow_all(), true)
            .validate(&message())
            .await;
        assert!(result.is_allowed());
        assert_eq!(result.metadata["policy_evaluated"], json!(true));
    }

    #[tokio::test]
    async fn violations_become_errors() {
        let backend = MockPolicyBackend::deny_all(["payload exceeds quota", "tenant suspended"]);
        let result = strategy(backend, true).validate(&message()).await;
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["payload exceeds quota", "tenant suspended"]);
    }

    #[tokio::test]
    async fn backend_error_fails_closed_by_default() {
        let result = strategy(MockPolicyBackend::unavailable(), true)
            .validate(&message())
            .await;
        assert!(!result.is_valid);
        assert_eq!(result.metadata["policy_mode"], json!("fail_closed"));
    }

    #[tokio::test]
    async fn backend_error_fails_open_when_configured() {
        let result = strategy(MockPolicyBackend::unavailable(), false)
            .validate(&message())
            .await;
        assert!(result.is_allowed());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.metadata["policy_mode"], json!("fail_open"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_and_fails_closed() {
        let backend = MockPolicyBackend::allow_all().with_delay(Duration::from_secs(5));
        let result = strategy(backend, true).validate(&message()).await;
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("timed out after 50ms"));
    }

    #[tokio::test]
    async fn open_circuit_skips_backend() {
        let backend = Arc::new(MockPolicyBackend::unavailable());
        let breakers = breakers();
        let strategy = DynamicPolicyStrategy::new(
            backend.clone(),
            breakers.clone(),
            &ValidationConfig::default(),
        );

        strategy.validate(&message()).await;
        strategy.validate(&message()).await;
        assert_eq!(breakers.current_state(POLICY_BACKEND), CircuitState::Open);
        assert_eq!(backend.calls(), 2);

        let result = strategy.validate(&message()).await;
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("circuit open"));
        assert_eq!(backend.calls(), 2);
    }
}
