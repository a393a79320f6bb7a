//! Message handlers and their isolated invocation.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_types::{AgentMessage, BusResult, MessageType};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Receives delivered messages of the kinds it is registered for.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: &AgentMessage) -> BusResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler built from an async closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(AgentMessage) -> Fut + Send + Sync,
    Fut: Future<Output = BusResult<()>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(AgentMessage) -> Fut + Send + Sync,
    Fut: Future<Output = BusResult<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: &AgentMessage) -> BusResult<()> {
        (self.f)(message.clone()).await
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredHandler {
    pub id: HandlerId,
    pub handler: Arc<dyn MessageHandler>,
}

/// Handlers keyed by message kind.
#[derive(Default)]
pub(crate) struct HandlerTable {
    by_kind: DashMap<MessageType, Vec<RegisteredHandler>>,
}

impl HandlerTable {
    pub fn register(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = HandlerId::generate();
        self.by_kind
            .entry(kind)
            .or_default()
            .push(RegisteredHandler { id, handler });
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut removed = false;
        for mut entry in self.by_kind.iter_mut() {
            let before = entry.len();
            entry.retain(|h| h.id != id);
            removed |= entry.len() != before;
        }
        removed
    }

    /// Snapshot of the handlers for `kind`; no shard lock outlives the call.
    pub fn for_kind(&self, kind: MessageType) -> Vec<RegisteredHandler> {
        self.by_kind
            .get(&kind)
            .map(|handlers| handlers.value().clone())
            .unwrap_or_default()
    }

    pub fn find(&self, id: HandlerId) -> Option<RegisteredHandler> {
        self.by_kind
            .iter()
            .find_map(|entry| entry.iter().find(|h| h.id == id).cloned())
    }
}

/// How one handler invocation went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerFailureKind {
    Error,
    Panic,
    Timeout,
    /// A fault injected before the handler ran.
    Injected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub handler_id: HandlerId,
    pub handler: String,
    pub kind: HandlerFailureKind,
    pub reason: String,
}

/// Run one handler with a deadline, catching errors and panics.
pub(crate) async fn invoke(
    registered: &RegisteredHandler,
    message: &AgentMessage,
    timeout: Duration,
) -> Result<(), HandlerFailure> {
    let call = AssertUnwindSafe(registered.handler.handle(message)).catch_unwind();
    let failure = |kind, reason: String| HandlerFailure {
        handler_id: registered.id,
        handler: registered.handler.name().to_string(),
        kind,
        reason,
    };

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(failure(HandlerFailureKind::Error, e.to_string())),
        Ok(Err(panic)) => Err(failure(HandlerFailureKind::Panic, panic_message(panic))),
        Err(_) => Err(failure(
            HandlerFailureKind::Timeout,
            format!("timed out after {}ms", timeout.as_millis()),
        )),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
