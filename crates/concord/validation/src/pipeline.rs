//! Pipeline assembly from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use concord_resilience::CircuitBreakerRegistry;
use concord_types::{BusConfig, BusError, BusResult, StrategyKind};
use tracing::info;

use crate::expiry::ExpiryStrategy;
use crate::policy::{DynamicPolicyStrategy, PolicyBackend};
use crate::static_hash::StaticHashStrategy;
use crate::strategy::{CompositeStrategy, ValidationStrategy};

/// Build the composite strategy named by `config.validation.strategies`.
///
/// Naming `dynamic_policy` without supplying a backend is a configuration
/// error.
pub fn build_pipeline(
    config: &BusConfig,
    backend: Option<Arc<dyn PolicyBackend>>,
    breakers: Arc<CircuitBreakerRegistry>,
) -> BusResult<CompositeStrategy> {
    let mut table: HashMap<StrategyKind, Arc<dyn ValidationStrategy>> = HashMap::new();
    table.insert(
        StrategyKind::StaticHash,
        Arc::new(StaticHashStrategy::new(&config.policy_commitment)),
    );
    table.insert(StrategyKind::Expiry, Arc::new(ExpiryStrategy));
    if let Some(backend) = backend {
        table.insert(
            StrategyKind::DynamicPolicy,
            Arc::new(DynamicPolicyStrategy::new(backend, breakers, &config.validation)),
        );
    }

    let mut pipeline = CompositeStrategy::new();
    for kind in &config.validation.strategies {
        let strategy = table.get(kind).ok_or_else(|| {
            BusError::Configuration(format!(
                "validation strategy {:?} requires a policy backend",
                kind
            ))
        })?;
        pipeline.push(Arc::clone(strategy));
    }

    info!(strategies = ?pipeline.strategy_names(), "Validation pipeline built");
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockPolicyBackend;
    use concord_types::{AgentMessage, MessageType, ValidationConfig};
    use serde_json::json;

    fn config(strategies: Vec<StrategyKind>) -> BusConfig {
        BusConfig {
            validation: ValidationConfig {
                strategies,
                ..Default::default()
            },
            ..BusConfig::with_commitment("cdd01ef066bc6cf2")
        }
    }

    #[tokio::test]
    async fn default_pipeline_orders_strategies() {
        let pipeline = build_pipeline(
            &BusConfig::with_commitment("cdd01ef066bc6cf2"),
            Some(Arc::new(MockPolicyBackend::allow_all())),
            Arc::new(CircuitBreakerRegistry::default()),
        )
        .unwrap();

        assert_eq!(
            pipeline.strategy_names(),
            vec!["static_hash", "expiry", "dynamic_policy"]
        );
    }

    #[test]
    fn dynamic_policy_without_backend_is_rejected() {
        let result = build_pipeline(
            &config(vec![StrategyKind::StaticHash, StrategyKind::DynamicPolicy]),
            None,
            Arc::new(CircuitBreakerRegistry::default()),
        );
        assert!(matches!(result, Err(BusError::Configuration(_))));
    }

    #[tokio::test]
    async fn mismatched_commitment_fails_and_backend_still_runs() {
        let backend = Arc::new(MockPolicyBackend::allow_all());
        let pipeline = build_pipeline(
            &BusConfig::with_commitment("cdd01ef066bc6cf2"),
            Some(backend.clone()),
            Arc::new(CircuitBreakerRegistry::default()),
        )
        .unwrap();

        let message = AgentMessage::new("a", "b", MessageType::Command, json!({}), "forged");
        let result = pipeline.validate(&message).await;

        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["policy commitment mismatch"]);
        assert_eq!(backend.calls(), 1);
    }
}
