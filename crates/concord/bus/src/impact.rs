use async_trait::async_trait;
use concord_types::AgentMessage;

/// Estimates how consequential a message is, in [0, 1].
///
/// The bus scores messages that arrive without an impact score and flags
/// those at or above the configured threshold.
#[async_trait]
pub trait ImpactScorer: Send + Sync {
    async fn score(&self, message: &AgentMessage) -> f64;
}

/// Scores every message the same.
#[derive(Debug, Clone)]
pub struct FixedImpactScorer(pub f64);

#[async_trait]
impl ImpactScorer for FixedImpactScorer {
    async fn score(&self, _message: &AgentMessage) -> f64 {
        self.0
    }
}
