//! Fire-and-forget audit trail.
//!
//! Audit events are pushed onto a bounded in-memory queue and drained to an
//! [`AuditSink`] by a background task. When the queue is full the oldest
//! event is dropped and counted; a slow or failing sink never blocks or fails
//! message processing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_types::{AgentMessage, BusResult, Cancellation, MessageId, TenantId};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Rejected,
    Delivered,
    RoutingFailed,
    HandlerFailed,
}

/// One audit record. Payloads are never stored, only their digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub message_id: MessageId,
    pub from: String,
    pub to: String,
    pub tenant_id: TenantId,
    /// blake3 digest of the JSON payload, hex encoded.
    pub payload_digest: String,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn for_message(kind: AuditKind, message: &AgentMessage, detail: Option<String>) -> Self {
        Self {
            kind,
            message_id: message.id,
            from: message.from.to_string(),
            to: message.to.to_string(),
            tenant_id: message.tenant_id.clone(),
            payload_digest: blake3::hash(message.payload.to_string().as_bytes())
                .to_hex()
                .to_string(),
            detail,
            recorded_at: Utc::now(),
        }
    }
}

/// Persistent destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> BusResult<()>;
}

/// Sink that writes audit events to the log.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> BusResult<()> {
        info!(
            target: "concord::audit",
            kind = ?event.kind,
            message_id = %event.message_id,
            from = %event.from,
            to = %event.to,
            tenant_id = %event.tenant_id,
            payload_digest = %event.payload_digest,
            detail = event.detail.as_deref().unwrap_or(""),
            "audit"
        );
        Ok(())
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> BusResult<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

/// Bounded drop-oldest queue in front of an [`AuditSink`].
pub struct AuditQueue {
    capacity: usize,
    events: Mutex<VecDeque<AuditEvent>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl AuditQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an event, evicting the oldest one if the queue is full.
    pub fn push(&self, event: AuditEvent) {
        {
            let mut events = self.lock();
            if events.len() >= self.capacity {
                events.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "Audit queue full, dropped oldest event");
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Events evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Hand every queued event to `sink`. Sink failures are logged.
    pub async fn drain_to(&self, sink: &dyn AuditSink) -> usize {
        let mut drained = 0;
        loop {
            let next = self.lock().pop_front();
            let Some(event) = next else {
                break;
            };
            let message_id = event.message_id;
            if let Err(e) = sink.record(event).await {
                warn!(message_id = %message_id, error = %e, "Audit sink failed, event lost");
            }
            drained += 1;
        }
        drained
    }

    /// Drain continuously until cancelled, then flush what is left.
    pub fn spawn_drain(
        self: &Arc<Self>,
        sink: Arc<dyn AuditSink>,
        cancellation: Cancellation,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                queue.drain_to(sink.as_ref()).await;
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = queue.notify.notified() => {}
                }
            }
            let flushed = queue.drain_to(sink.as_ref()).await;
            debug!(flushed, "Audit drain stopped");
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{BusError, MessageType};
    use serde_json::json;
    use std::time::Duration;

    fn event(n: u64) -> AuditEvent {
        let message = AgentMessage::new("a", "b", MessageType::Event, json!({ "n": n }), "c");
        AuditEvent::for_message(AuditKind::Delivered, &message, Some(n.to_string()))
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _event: AuditEvent) -> BusResult<()> {
            Err(BusError::Transport("ledger offline".into()))
        }
    }

    #[test]
    fn full_queue_drops_oldest_and_counts() {
        let queue = AuditQueue::new(2);
        queue.push(event(1));
        queue.push(event(2));
        queue.push(event(3));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn drain_preserves_order_of_survivors() {
        let queue = AuditQueue::new(2);
        for n in 1..=3 {
            queue.push(event(n));
        }
        let sink = InMemoryAuditSink::new();

        assert_eq!(queue.drain_to(&sink).await, 2);
        let details: Vec<_> = sink.events().into_iter().filter_map(|e| e.detail).collect();
        assert_eq!(details, vec!["2", "3"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failing_sink_does_not_stall_queue() {
        let queue = AuditQueue::new(8);
        queue.push(event(1));
        queue.push(event(2));

        assert_eq!(queue.drain_to(&FailingSink).await, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn background_drain_delivers_and_flushes() {
        let queue = Arc::new(AuditQueue::new(16));
        let sink = Arc::new(InMemoryAuditSink::new());
        let (handle, cancellation) = Cancellation::new();
        let drain = queue.spawn_drain(sink.clone(), cancellation);

        queue.push(event(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(event(2));
        handle.cancel();
        drain.await.unwrap();

        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn payload_digest_is_stable() {
        let message = AgentMessage::new("a", "b", MessageType::Event, json!({"k": "v"}), "c");
        let first = AuditEvent::for_message(AuditKind::Rejected, &message, None);
        let second = AuditEvent::for_message(AuditKind::Delivered, &message, None);
        assert_eq!(first.payload_digest, second.payload_digest);
        assert_eq!(first.payload_digest.len(), 64);
    }
}
