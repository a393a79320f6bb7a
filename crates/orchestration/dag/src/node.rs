//! Graph nodes and their outcomes.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outputs of a node's dependencies, keyed by node ID.
pub type NodeInputs = BTreeMap<String, Value>;

pub(crate) type NodeWork<C> =
    Arc<dyn Fn(Arc<C>, NodeInputs) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// A unit of work with declared dependencies.
pub struct DagNode<C> {
    pub(crate) id: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) guard: Option<String>,
    pub(crate) work: NodeWork<C>,
}

impl<C> DagNode<C> {
    /// `work` receives the shared context and the outputs of every
    /// dependency.
    pub fn new<F, Fut>(id: impl Into<String>, work: F) -> Self
    where
        F: Fn(Arc<C>, NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            timeout: None,
            guard: None,
            work: Arc::new(move |ctx, inputs| Box::pin(work(ctx, inputs))),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Override the executor's default node timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run only while `dependency`'s circuit is closed, and record the outcome
    /// against it.
    pub fn guarded_by(mut self, dependency: impl Into<String>) -> Self {
        self.guard = Some(dependency.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Not run because a dependency did not succeed.
    Skipped,
    /// Not run because the execution was cancelled.
    Cancelled,
}

impl NodeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Succeeded)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::TimedOut => "timed_out",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What happened to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Wall time of the run; `None` for nodes that never ran.
    pub duration: Option<Duration>,
}

impl NodeReport {
    pub(crate) fn succeeded(output: Value, duration: Duration) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            output: Some(output),
            error: None,
            duration: Some(duration),
        }
    }

    pub(crate) fn failed(status: NodeStatus, error: String, duration: Option<Duration>) -> Self {
        Self {
            status,
            output: None,
            error: Some(error),
            duration,
        }
    }
}
