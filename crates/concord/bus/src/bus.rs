//! The message router and processor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_registry::{AgentRegistry, RegistryError};
use concord_resilience::{
    ChaosEngine, CircuitBreakerRegistry, OperationId, RecoveryEvent, RecoveryExecutor,
    RecoveryOrchestrator, RecoveryPriority, RecoveryStrategy, RecoveryTask, ResilienceError,
    ResilienceResult, ScheduleOutcome, TaskState,
};
use concord_types::{
    AgentId, AgentMessage, AgentRegistration, BusConfig, BusError, BusResult, Cancellation,
    MessageId, MessageType, Priority, Recipient, RoutingFailure, TenantId, ValidationResult,
};
use concord_validation::ValidationStrategy;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditEvent, AuditKind, AuditQueue};
use crate::handler::{
    self, HandlerFailure, HandlerFailureKind, HandlerId, HandlerTable, MessageHandler,
    RegisteredHandler,
};
use crate::impact::ImpactScorer;
use crate::metrics::{BusMetrics, MetricsSnapshot};
use crate::transport::{tenant_topic, Envelope, NodeId, PubSubTransport};

/// Dependency name of the agent registry in the circuit breaker registry.
pub const AGENT_REGISTRY: &str = "agent_registry";

/// Dependency name of the pub/sub transport in the circuit breaker registry.
pub const PUBSUB: &str = "pubsub";

/// Where a validated message went.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub message_id: MessageId,
    pub recipients: Vec<AgentId>,
    pub handlers_invoked: usize,
    pub handler_failures: Vec<HandlerFailure>,
}

impl DeliveryReport {
    pub fn all_handlers_succeeded(&self) -> bool {
        self.handler_failures.is_empty()
    }
}

/// Outcome of [`MessageBus::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub validation: ValidationResult,
    /// `None` when validation refused the message and routing never ran.
    pub delivery: Option<Result<DeliveryReport, RoutingFailure>>,
}

impl SendReceipt {
    pub fn is_delivered(&self) -> bool {
        matches!(self.delivery, Some(Ok(_)))
    }

    pub fn routing_failure(&self) -> Option<&RoutingFailure> {
        match &self.delivery {
            Some(Err(failure)) => Some(failure),
            _ => None,
        }
    }

    pub fn report(&self) -> Option<&DeliveryReport> {
        match &self.delivery {
            Some(Ok(report)) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
struct PendingRetry {
    message: AgentMessage,
    handler_id: HandlerId,
}

/// Assembles a [`MessageBus`] from its collaborators.
pub struct MessageBusBuilder {
    config: BusConfig,
    registry: Arc<dyn AgentRegistry>,
    validator: Arc<dyn ValidationStrategy>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    recovery: Option<Arc<RecoveryOrchestrator>>,
    audit: Option<Arc<AuditQueue>>,
    scorer: Option<Arc<dyn ImpactScorer>>,
    chaos: Option<Arc<ChaosEngine>>,
    transport: Option<Arc<dyn PubSubTransport>>,
}

impl MessageBusBuilder {
    pub fn new(
        config: BusConfig,
        registry: Arc<dyn AgentRegistry>,
        validator: Arc<dyn ValidationStrategy>,
    ) -> Self {
        Self {
            config,
            registry,
            validator,
            breakers: None,
            recovery: None,
            audit: None,
            scorer: None,
            chaos: None,
            transport: None,
        }
    }

    /// Share breakers with the validation pipeline and recovery orchestrator.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Schedule failed handler invocations for retry.
    pub fn with_recovery(mut self, recovery: Arc<RecoveryOrchestrator>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditQueue>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_impact_scorer(mut self, scorer: Arc<dyn ImpactScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Consult `chaos` before every handler invocation.
    pub fn with_chaos(mut self, chaos: Arc<ChaosEngine>) -> Self {
        self.chaos = Some(chaos);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn PubSubTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> BusResult<MessageBus> {
        self.config.validate()?;

        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(CircuitBreakerRegistry::new(
                self.config.circuit_breaker.clone(),
            ))
        });
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.router.inbound_queue_capacity);
        let node_id = NodeId::generate();

        info!(
            node_id = %node_id,
            tenant_isolation = self.config.router.tenant_isolation,
            handler_timeout_ms = self.config.router.handler_timeout_ms,
            "Message bus created"
        );

        Ok(MessageBus {
            config: self.config,
            node_id,
            registry: self.registry,
            validator: self.validator,
            breakers,
            recovery: self.recovery,
            audit: self.audit,
            scorer: self.scorer,
            chaos: self.chaos,
            transport: self.transport,
            handlers: HandlerTable::default(),
            metrics: BusMetrics::default(),
            retries: DashMap::new(),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        })
    }
}

/// Validates, routes, and dispatches agent messages.
///
/// A message reaches handlers only after the validation pipeline allows it.
/// Handler errors, panics, and timeouts are isolated per handler: they are
/// counted, audited, and scheduled for retry, and never change the
/// validation outcome or affect other handlers.
pub struct MessageBus {
    config: BusConfig,
    node_id: NodeId,
    registry: Arc<dyn AgentRegistry>,
    validator: Arc<dyn ValidationStrategy>,
    breakers: Arc<CircuitBreakerRegistry>,
    recovery: Option<Arc<RecoveryOrchestrator>>,
    audit: Option<Arc<AuditQueue>>,
    scorer: Option<Arc<dyn ImpactScorer>>,
    chaos: Option<Arc<ChaosEngine>>,
    transport: Option<Arc<dyn PubSubTransport>>,
    handlers: HandlerTable,
    metrics: BusMetrics,
    retries: DashMap<OperationId, PendingRetry>,
    inbound_tx: mpsc::Sender<AgentMessage>,
    inbound_rx: Mutex<mpsc::Receiver<AgentMessage>>,
}

impl MessageBus {
    pub fn builder(
        config: BusConfig,
        registry: Arc<dyn AgentRegistry>,
        validator: Arc<dyn ValidationStrategy>,
    ) -> MessageBusBuilder {
        MessageBusBuilder::new(config, registry, validator)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub async fn register_agent(&self, registration: AgentRegistration) -> BusResult<()> {
        Ok(self.registry.register(registration).await?)
    }

    /// Returns whether the agent was registered.
    pub async fn unregister_agent(&self, agent_id: &AgentId) -> BusResult<bool> {
        Ok(self.registry.unregister(agent_id).await?)
    }

    /// Register `handler` for every message of `kind`.
    pub fn register_handler(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let name = handler.name().to_string();
        let id = self.handlers.register(kind, handler);
        info!(handler_id = %id, handler = %name, kind = ?kind, "Handler registered");
        id
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let removed = self.handlers.unregister(id);
        debug!(handler_id = %id, removed, "Handler unregistered");
        removed
    }

    /// Validate and deliver one message.
    ///
    /// The validation outcome is always returned. Routing failures are
    /// reported in [`SendReceipt::delivery`], separately from validation.
    pub async fn send(&self, message: AgentMessage) -> SendReceipt {
        self.process(message, Origin::Local).await
    }

    /// Send one validated copy of `message` to every agent of the sender's
    /// tenant except the sender.
    pub async fn broadcast(&self, message: AgentMessage) -> HashMap<AgentId, ValidationResult> {
        let agents = match self.tenant_agents(&message.tenant_id, &message.from).await {
            Ok(agents) => agents,
            Err(failure) => {
                self.metrics.record_routing_failure();
                warn!(message_id = %message.id, error = %failure, "Broadcast could not list recipients");
                return HashMap::new();
            }
        };

        let copies = agents.into_iter().map(|agent| {
            let copy = message.readdressed(agent.clone());
            async move { (agent, self.process(copy, Origin::Local).await.validation) }
        });
        futures::future::join_all(copies).await.into_iter().collect()
    }

    /// Next delivered message, or `None` if none arrives within `timeout`.
    pub async fn receive(&self, timeout: Duration) -> Option<AgentMessage> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::time::timeout(timeout, inbound.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let registered_agents = match self.registry.count().await {
            Ok(count) => count,
            Err(e) => {
                debug!(error = %e, "Agent count unavailable");
                0
            }
        };
        let audit_dropped = self.audit.as_ref().map(|a| a.dropped()).unwrap_or(0);
        self.metrics.snapshot(registered_agents, audit_dropped)
    }

    /// Start re-running failed handler invocations, if a recovery
    /// orchestrator is attached.
    ///
    /// Retries the orchestrator gives up on or cancels are forgotten as the
    /// events arrive. The returned task ends after the worker does.
    pub fn spawn_recovery_worker(self: &Arc<Self>, cancellation: Cancellation) -> Option<JoinHandle<()>> {
        let recovery = self.recovery.clone()?;
        let executor: Arc<dyn RecoveryExecutor> = Arc::clone(self) as Arc<dyn RecoveryExecutor>;
        let mut events = recovery.subscribe();
        let worker = recovery.spawn_worker(executor, cancellation.clone());

        let bus = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(RecoveryEvent::Cancelled { operation_id })
                        | Ok(RecoveryEvent::Exhausted { operation_id, .. }) => {
                            if bus.retries.remove(&operation_id).is_some() {
                                debug!(operation_id = %operation_id, "Retry abandoned");
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Missed recovery events, pruning retries");
                            bus.prune_retries(&recovery);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            if let Err(e) = worker.await {
                warn!(error = %e, "Recovery worker ended abnormally");
            }
        }))
    }

    /// Handler retries awaiting the recovery worker.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Drop retries the orchestrator no longer tracks as live.
    fn prune_retries(&self, recovery: &RecoveryOrchestrator) {
        self.retries.retain(|operation_id, _| {
            recovery
                .status(operation_id)
                .is_some_and(|task| task.state != TaskState::Exhausted)
        });
    }

    /// Deliver messages other buses publish for `tenant`.
    pub async fn bridge(
        self: &Arc<Self>,
        tenant: &TenantId,
        cancellation: Cancellation,
    ) -> BusResult<JoinHandle<()>> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| BusError::Configuration("no pub/sub transport attached".into()))?;
        let topic = tenant_topic(tenant);
        let mut inbound = transport.subscribe(&topic).await?;
        info!(topic = %topic, node_id = %self.node_id, "Bridging remote messages");

        let bus = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = cancellation.cancelled() => break,
                    envelope = inbound.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                if envelope.origin == bus.node_id {
                    continue;
                }
                debug!(origin = %envelope.origin, message_id = %envelope.message.id, "Remote message received");
                bus.process(envelope.message, Origin::Remote).await;
            }
            debug!(topic = %topic, "Bridge stopped");
        }))
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, kind = ?message.kind))]
    async fn process(&self, message: AgentMessage, origin: Origin) -> SendReceipt {
        self.metrics.record_sent();
        let message = self.score(message).await;
        let message_id = message.id;

        let mut validation = self.validator.validate(&message).await;
        self.flag_impact(&message, &mut validation);

        if !validation.is_allowed() {
            self.metrics.record_rejected();
            info!(errors = ?validation.errors, "Message rejected by validation");
            self.audit(AuditKind::Rejected, &message, Some(validation.errors.join("; ")));
            return SendReceipt {
                message_id,
                validation,
                delivery: None,
            };
        }
        self.metrics.record_accepted();

        let recipients = match self.resolve(&message).await {
            Ok(recipients) => recipients,
            Err(failure) => {
                self.metrics.record_routing_failure();
                warn!(error = %failure, "Message could not be routed");
                self.audit(AuditKind::RoutingFailed, &message, Some(failure.to_string()));
                return SendReceipt {
                    message_id,
                    validation,
                    delivery: Some(Err(failure)),
                };
            }
        };

        let (handlers_invoked, handler_failures) = self.dispatch(&message).await;
        self.enqueue_inbound(&message);
        self.metrics.record_delivered();
        self.audit(AuditKind::Delivered, &message, None);
        debug!(
            recipients = recipients.len(),
            handlers_invoked,
            handler_failures = handler_failures.len(),
            "Message delivered"
        );

        if origin == Origin::Local {
            self.publish(&message).await;
        }

        SendReceipt {
            message_id,
            validation,
            delivery: Some(Ok(DeliveryReport {
                message_id,
                recipients,
                handlers_invoked,
                handler_failures,
            })),
        }
    }

    async fn score(&self, message: AgentMessage) -> AgentMessage {
        match (&self.scorer, message.impact_score) {
            (Some(scorer), None) => {
                let score = scorer.score(&message).await;
                message.with_impact_score(score)
            }
            _ => message,
        }
    }

    fn flag_impact(&self, message: &AgentMessage, validation: &mut ValidationResult) {
        let Some(score) = message.impact_score else {
            return;
        };
        validation.metadata.insert("impact_score".into(), json!(score));
        if score >= self.config.validation.impact_threshold {
            validation.add_warning(format!("high impact score {:.2} requires review", score));
        }
    }

    async fn resolve(&self, message: &AgentMessage) -> Result<Vec<AgentId>, RoutingFailure> {
        match &message.to {
            Recipient::Agent(agent_id) => {
                let registration = self
                    .lookup(agent_id)
                    .await?
                    .ok_or_else(|| RoutingFailure::UnknownAgent(agent_id.clone()))?;

                if self.config.router.tenant_isolation && registration.tenant_id != message.tenant_id {
                    return Err(RoutingFailure::TenantMismatch {
                        agent: agent_id.clone(),
                        agent_tenant: registration.tenant_id,
                        message_tenant: message.tenant_id.clone(),
                    });
                }
                Ok(vec![agent_id.clone()])
            }
            Recipient::Broadcast => {
                let agents = self.tenant_agents(&message.tenant_id, &message.from).await?;
                if agents.is_empty() {
                    return Err(RoutingFailure::NoRecipients(message.tenant_id.clone()));
                }
                Ok(agents)
            }
        }
    }

    async fn lookup(&self, agent_id: &AgentId) -> Result<Option<AgentRegistration>, RoutingFailure> {
        let registry = &self.registry;
        self.breakers
            .guard(AGENT_REGISTRY, async move {
                match registry.get(agent_id).await {
                    Ok(registration) => Ok(Some(registration)),
                    Err(RegistryError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| RoutingFailure::RegistryUnavailable(e.to_string()))
    }

    /// Agents a broadcast from `sender` reaches, sorted by ID.
    async fn tenant_agents(
        &self,
        tenant: &TenantId,
        sender: &AgentId,
    ) -> Result<Vec<AgentId>, RoutingFailure> {
        let registry = &self.registry;
        let isolated = self.config.router.tenant_isolation;
        let registrations = self
            .breakers
            .guard(AGENT_REGISTRY, async move {
                if isolated {
                    registry.list_for_tenant(tenant).await
                } else {
                    registry.list_all().await
                }
            })
            .await
            .map_err(|e| RoutingFailure::RegistryUnavailable(e.to_string()))?;

        let mut agents: Vec<AgentId> = registrations
            .into_iter()
            .map(|r| r.agent_id)
            .filter(|id| id != sender)
            .collect();
        agents.sort();
        Ok(agents)
    }

    /// Run every handler for the message's kind concurrently.
    async fn dispatch(&self, message: &AgentMessage) -> (usize, Vec<HandlerFailure>) {
        let handlers = self.handlers.for_kind(message.kind);
        if handlers.is_empty() {
            debug!("No handlers registered for message kind");
            return (0, Vec::new());
        }

        let timeout = self.config.router.handler_timeout();
        let outcomes = futures::future::join_all(
            handlers
                .iter()
                .map(|registered| self.run_handler(registered, message, timeout)),
        )
        .await;

        let failures: Vec<HandlerFailure> = outcomes.into_iter().filter_map(Result::err).collect();
        for failure in &failures {
            self.handler_failed(message, failure);
            self.schedule_retry(message, failure);
        }
        (handlers.len(), failures)
    }

    async fn run_handler(
        &self,
        registered: &RegisteredHandler,
        message: &AgentMessage,
        timeout: Duration,
    ) -> Result<(), HandlerFailure> {
        if let Some(chaos) = &self.chaos {
            if let Err(fault) = chaos.apply(registered.handler.name()).await {
                return Err(HandlerFailure {
                    handler_id: registered.id,
                    handler: registered.handler.name().to_string(),
                    kind: HandlerFailureKind::Injected,
                    reason: fault.to_string(),
                });
            }
        }
        handler::invoke(registered, message, timeout).await
    }

    fn handler_failed(&self, message: &AgentMessage, failure: &HandlerFailure) {
        self.metrics.record_handler_failure();
        match failure.kind {
            HandlerFailureKind::Timeout => self.metrics.record_handler_timeout(),
            HandlerFailureKind::Panic => self.metrics.record_handler_panic(),
            HandlerFailureKind::Error | HandlerFailureKind::Injected => {}
        }
        warn!(
            message_id = %message.id,
            handler = %failure.handler,
            kind = ?failure.kind,
            reason = %failure.reason,
            "Handler failed"
        );
        self.audit(
            AuditKind::HandlerFailed,
            message,
            Some(format!("{}: {}", failure.handler, failure.reason)),
        );
    }

    fn schedule_retry(&self, message: &AgentMessage, failure: &HandlerFailure) {
        let Some(recovery) = &self.recovery else {
            return;
        };

        let operation_id = OperationId::new(format!("{}/{}", message.id, failure.handler_id));
        self.retries.insert(
            operation_id.clone(),
            PendingRetry {
                message: message.clone(),
                handler_id: failure.handler_id,
            },
        );

        let outcome = recovery.schedule(
            operation_id.clone(),
            failure.reason.clone(),
            RecoveryStrategy::ExponentialBackoff,
            recovery_priority(message.priority),
        );
        self.metrics.record_retry_scheduled();
        if matches!(outcome, ScheduleOutcome::Exhausted { .. }) {
            self.retries.remove(&operation_id);
        }
    }

    fn enqueue_inbound(&self, message: &AgentMessage) {
        match self.inbound_tx.try_send(message.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_inbound_dropped();
                debug!(message_id = %message.id, "Inbound queue full, message not queued");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn publish(&self, message: &AgentMessage) {
        let Some(transport) = &self.transport else {
            return;
        };
        let topic = tenant_topic(&message.tenant_id);
        let envelope = Envelope {
            origin: self.node_id,
            message: message.clone(),
        };

        if let Err(e) = self
            .breakers
            .guard(PUBSUB, transport.publish(&topic, envelope))
            .await
        {
            warn!(message_id = %message.id, topic = %topic, error = %e, "Publish to transport failed");
        }
    }

    fn audit(&self, kind: AuditKind, message: &AgentMessage, detail: Option<String>) {
        if let Some(audit) = &self.audit {
            audit.push(AuditEvent::for_message(kind, message, detail));
        }
    }
}

#[async_trait]
impl RecoveryExecutor for MessageBus {
    async fn execute(&self, task: &RecoveryTask) -> ResilienceResult<()> {
        let operation_id = &task.operation_id;
        let pending = self.retries.get(operation_id).map(|r| r.value().clone());
        let Some(retry) = pending else {
            return Ok(());
        };
        let Some(registered) = self.handlers.find(retry.handler_id) else {
            debug!(operation_id = %operation_id, "Handler gone, retry dropped");
            self.retries.remove(operation_id);
            return Ok(());
        };
        if retry.message.is_expired() {
            debug!(operation_id = %operation_id, "Message expired, retry dropped");
            self.retries.remove(operation_id);
            return Ok(());
        }

        let timeout = self.config.router.handler_timeout();
        match self.run_handler(&registered, &retry.message, timeout).await {
            Ok(()) => {
                self.retries.remove(operation_id);
                info!(
                    operation_id = %operation_id,
                    attempt = task.next_attempt(),
                    "Handler retry succeeded"
                );
                Ok(())
            }
            Err(failure) => {
                self.handler_failed(&retry.message, &failure);
                let last_attempt = self
                    .recovery
                    .as_ref()
                    .map(|r| task.next_attempt() >= r.config().max_attempts)
                    .unwrap_or(true);
                if last_attempt {
                    self.retries.remove(operation_id);
                }
                Err(ResilienceError::OperationFailed(failure.reason))
            }
        }
    }
}

fn recovery_priority(priority: Priority) -> RecoveryPriority {
    match priority {
        Priority::Low => RecoveryPriority::Low,
        Priority::Normal => RecoveryPriority::Normal,
        Priority::High => RecoveryPriority::High,
        Priority::Critical => RecoveryPriority::Critical,
    }
}
