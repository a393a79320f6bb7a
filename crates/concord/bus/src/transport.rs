//! Cross-process delivery over a publish/subscribe substrate.
//!
//! Buses sharing a transport publish every locally delivered message on the
//! tenant's topic and re-inject what other buses publish. Re-injected
//! messages are validated again; nothing arriving from the wire is trusted.

use std::collections::HashMap;

use async_trait::async_trait;
use concord_types::{AgentMessage, BusResult, TenantId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity of one bus instance on a shared transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// A message on the wire, tagged with the bus that published it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: NodeId,
    pub message: AgentMessage,
}

/// Topic carrying a tenant's messages.
pub fn tenant_topic(tenant: &TenantId) -> String {
    format!("concord.{}.messages", tenant)
}

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<()>;

    async fn subscribe(&self, topic: &str) -> BusResult<mpsc::Receiver<Envelope>>;
}

/// In-process transport. Slow subscribers lose messages rather than
/// blocking publishers.
pub struct InMemoryPubSub {
    topics: RwLock<HashMap<String, Vec<mpsc::Sender<Envelope>>>>,
    buffer: usize,
}

impl InMemoryPubSub {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubTransport for InMemoryPubSub {
    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<()> {
        let topics = self.topics.read().await;
        let Some(subscribers) = topics.get(topic) else {
            return Ok(());
        };

        let mut closed = 0;
        for sender in subscribers {
            match sender.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic, "Subscriber channel full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed += 1,
            }
        }
        drop(topics);

        if closed > 0 {
            let mut topics = self.topics.write().await;
            if let Some(subscribers) = topics.get_mut(topic) {
                subscribers.retain(|s| !s.is_closed());
            }
            debug!(topic, removed = closed, "Cleaned up closed subscriptions");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> BusResult<mpsc::Receiver<Envelope>> {
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        debug!(topic, "New subscription registered");
        Ok(receiver)
    }
}
