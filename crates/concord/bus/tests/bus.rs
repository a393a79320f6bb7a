use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_bus::{
    tenant_topic, Envelope, InMemoryPubSub, MessageBus, MessageHandler, NodeId, PubSubTransport,
};
use concord_registry::{InMemoryKeyValueStore, KeyValueAgentRegistry, KeyValueStore};
use concord_resilience::CircuitBreakerRegistry;
use concord_types::{
    AgentMessage, AgentRegistration, BusConfig, BusResult, Cancellation, MessageType, StrategyKind,
    TenantId, ValidationConfig,
};
use concord_validation::build_pipeline;
use serde_json::json;

const COMMITMENT: &str = "cdd01ef066bc6cf2";

struct Counter {
    calls: AtomicUsize,
}

impl Counter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    async fn handle(&self, _message: &AgentMessage) -> BusResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Panicking;

#[async_trait]
impl MessageHandler for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn handle(&self, _message: &AgentMessage) -> BusResult<()> {
        panic!("index out of bounds")
    }
}

fn node(store: Arc<dyn KeyValueStore>, transport: Arc<InMemoryPubSub>) -> Arc<MessageBus> {
    let config = BusConfig {
        validation: ValidationConfig {
            strategies: vec![StrategyKind::StaticHash, StrategyKind::Expiry],
            ..Default::default()
        },
        ..BusConfig::with_commitment(COMMITMENT)
    };
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
    let pipeline = build_pipeline(&config, None, breakers.clone()).unwrap();
    let bus = MessageBus::builder(
        config,
        Arc::new(KeyValueAgentRegistry::new(store, None)),
        Arc::new(pipeline),
    )
    .with_breakers(breakers)
    .with_transport(transport)
    .build()
    .unwrap();
    Arc::new(bus)
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn messages_cross_buses_sharing_a_transport() {
    let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
    let transport = Arc::new(InMemoryPubSub::default());
    let sender = node(store.clone(), transport.clone());
    let receiver = node(store, transport);
    let tenant = TenantId::new("acme");
    let (handle, cancellation) = Cancellation::new();

    let sender_bridge = sender.bridge(&tenant, cancellation.clone()).await.unwrap();
    let receiver_bridge = receiver.bridge(&tenant, cancellation).await.unwrap();

    sender
        .register_agent(AgentRegistration::new("executor", "worker").with_tenant("acme"))
        .await
        .unwrap();
    let local = Counter::new();
    let remote = Counter::new();
    sender.register_handler(MessageType::Command, local.clone());
    receiver.register_handler(MessageType::Command, remote.clone());

    let receipt = sender
        .send(
            AgentMessage::new("planner", "executor", MessageType::Command, json!({}), COMMITMENT)
                .with_tenant("acme"),
        )
        .await;
    assert!(receipt.is_delivered());

    assert!(eventually(|| remote.calls() == 1).await);
    // The sender skips its own envelopes.
    assert_eq!(local.calls(), 1);

    handle.cancel();
    sender_bridge.await.unwrap();
    receiver_bridge.await.unwrap();
}

#[tokio::test]
async fn remote_messages_are_validated_again() {
    let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
    let transport = Arc::new(InMemoryPubSub::default());
    let receiver = node(store, transport.clone());
    let tenant = TenantId::new("acme");
    let (handle, cancellation) = Cancellation::new();
    let bridge = receiver.bridge(&tenant, cancellation).await.unwrap();

    receiver
        .register_agent(AgentRegistration::new("executor", "worker").with_tenant("acme"))
        .await
        .unwrap();
    let counter = Counter::new();
    receiver.register_handler(MessageType::Command, counter.clone());

    let forged = AgentMessage::new("rogue", "executor", MessageType::Command, json!({}), "0000")
        .with_tenant("acme");
    transport
        .publish(
            &tenant_topic(&tenant),
            Envelope {
                origin: NodeId::generate(),
                message: forged,
            },
        )
        .await
        .unwrap();

    let mut rejected = 0;
    for _ in 0..100 {
        rejected = receiver.metrics().await.rejected;
        if rejected == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rejected, 1);
    assert_eq!(counter.calls(), 0);

    handle.cancel();
    bridge.await.unwrap();
}

#[tokio::test]
async fn other_tenants_traffic_is_not_bridged() {
    let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
    let transport = Arc::new(InMemoryPubSub::default());
    let sender = node(store.clone(), transport.clone());
    let receiver = node(store, transport.clone());
    let (handle, cancellation) = Cancellation::new();
    let bridge = receiver
        .bridge(&TenantId::new("acme"), cancellation)
        .await
        .unwrap();

    sender
        .register_agent(AgentRegistration::new("ledger", "worker").with_tenant("globex"))
        .await
        .unwrap();
    let counter = Counter::new();
    receiver.register_handler(MessageType::Event, counter.clone());

    let receipt = sender
        .send(
            AgentMessage::new("clerk", "ledger", MessageType::Event, json!({}), COMMITMENT)
                .with_tenant("globex"),
        )
        .await;
    assert!(receipt.is_delivered());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.calls(), 0);
    assert_eq!(receiver.metrics().await.sent, 0);
    assert_eq!(
        transport
            .subscriber_count(&tenant_topic(&TenantId::new("globex")))
            .await,
        0
    );

    handle.cancel();
    bridge.await.unwrap();
}

#[tokio::test]
async fn panicking_handler_does_not_disturb_its_peers() {
    let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
    let bus = node(store, Arc::new(InMemoryPubSub::default()));
    bus.register_agent(AgentRegistration::new("executor", "worker").with_tenant("acme"))
        .await
        .unwrap();
    let counter = Counter::new();
    bus.register_handler(MessageType::Command, Arc::new(Panicking));
    bus.register_handler(MessageType::Command, counter.clone());

    let receipt = bus
        .send(
            AgentMessage::new("planner", "executor", MessageType::Command, json!({}), COMMITMENT)
                .with_tenant("acme"),
        )
        .await;

    assert!(receipt.validation.is_allowed());
    let report = receipt.report().unwrap();
    assert_eq!(report.handlers_invoked, 2);
    assert_eq!(report.handler_failures.len(), 1);
    assert_eq!(counter.calls(), 1);

    let metrics = bus.metrics().await;
    assert_eq!(metrics.handler_panics, 1);
    assert_eq!(metrics.delivered, 1);
    assert_eq!(metrics.registered_agents, 1);

    // The bus keeps serving after the panic.
    let second = bus
        .send(
            AgentMessage::new("planner", "executor", MessageType::Command, json!({}), COMMITMENT)
                .with_tenant("acme"),
        )
        .await;
    assert!(second.is_delivered());
    assert_eq!(counter.calls(), 2);
}
