//! Concord Bus - governance-aware message routing
//!
//! The [`MessageBus`] validates every message before anything else sees it,
//! routes it to registered agents within the sender's tenant, and dispatches
//! it to the handlers registered for its kind:
//!
//! - **Validation first**: a message refused by the pipeline never reaches a
//!   handler, the inbound queue, or the transport
//! - **Handler isolation**: errors, panics, and timeouts are contained per
//!   handler and optionally retried through the recovery orchestrator
//! - **Audit**: every outcome is recorded on a bounded, drop-oldest queue
//! - **Transport**: buses sharing a [`PubSubTransport`] see each other's
//!   messages, re-validated on arrival

#![deny(unsafe_code)]

pub mod audit;
pub mod bus;
pub mod handler;
pub mod impact;
pub mod metrics;
pub mod transport;

pub use audit::{AuditEvent, AuditKind, AuditQueue, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use bus::{DeliveryReport, MessageBus, MessageBusBuilder, SendReceipt, AGENT_REGISTRY, PUBSUB};
pub use handler::{FnHandler, HandlerFailure, HandlerFailureKind, HandlerId, MessageHandler};
pub use impact::{FixedImpactScorer, ImpactScorer};
pub use metrics::MetricsSnapshot;
pub use transport::{tenant_topic, Envelope, InMemoryPubSub, NodeId, PubSubTransport};
