//! Dependency-graph execution.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use concord_resilience::CircuitBreakerRegistry;
use concord_types::{Cancellation, DagConfig};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{DagError, DagResult};
use crate::node::{DagNode, NodeInputs, NodeReport, NodeStatus, NodeWork};

/// Outcome of every node of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagReport {
    pub nodes: BTreeMap<String, NodeReport>,
    /// Nodes in the order they finished running.
    pub completion_order: Vec<String>,
    pub cancelled: bool,
}

impl DagReport {
    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|r| r.status)
    }

    pub fn output(&self, id: &str) -> Option<&Value> {
        self.nodes.get(id).and_then(|r| r.output.as_ref())
    }

    /// Whether every node succeeded.
    pub fn is_success(&self) -> bool {
        self.nodes.values().all(|r| r.status.is_success())
    }

    pub fn with_status(&self, status: NodeStatus) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Runs named nodes to completion, concurrently where dependencies allow.
///
/// A node starts only after every dependency succeeded. A failed or timed
/// out node marks everything downstream of it skipped; independent branches
/// keep running and the report carries a status for every node.
pub struct DagExecutor<C> {
    config: DagConfig,
    nodes: BTreeMap<String, DagNode<C>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl<C> DagExecutor<C>
where
    C: Send + Sync + 'static,
{
    /// A `max_parallelism` of 0 is raised to 1.
    pub fn new(mut config: DagConfig) -> Self {
        if config.max_parallelism == 0 {
            warn!("DAG max_parallelism is 0, running nodes one at a time");
            config.max_parallelism = 1;
        }
        Self {
            config,
            nodes: BTreeMap::new(),
            breakers: None,
        }
    }

    /// Breakers consulted and updated by guarded nodes.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn add_node<F, Fut>(
        &mut self,
        id: impl Into<String>,
        work: F,
        dependencies: &[&str],
    ) -> DagResult<()>
    where
        F: Fn(Arc<C>, NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let node = dependencies
            .iter()
            .fold(DagNode::new(id, work), |node, dep| node.depends_on(*dep));
        self.add_node_with(node)
    }

    pub fn add_node_with(&mut self, node: DagNode<C>) -> DagResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(DagError::DuplicateNode(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dependencies-first order of every node.
    ///
    /// Fails on unknown dependencies and on cycles; nothing is run.
    pub fn topological_order(&self) -> DagResult<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (id, node) in &self.nodes {
            in_degree.entry(id.as_str()).or_insert(0);
            for dep in &node.dependencies {
                if !self.nodes.contains_key(dep) {
                    return Err(DagError::UnknownDependency {
                        node: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(DagError::CyclicDependency(stuck));
        }
        Ok(order)
    }

    pub async fn execute(&self, ctx: C) -> DagResult<DagReport> {
        self.execute_with_cancel(ctx, Cancellation::never()).await
    }

    /// Execute until done or cancelled.
    ///
    /// Cancellation stops new nodes from starting; nodes already running
    /// finish or time out and their outcome is recorded. Nodes never started
    /// are reported `Cancelled`.
    #[instrument(skip_all, fields(nodes = self.nodes.len()))]
    pub async fn execute_with_cancel(
        &self,
        ctx: C,
        cancellation: Cancellation,
    ) -> DagResult<DagReport> {
        let order = self.topological_order()?;
        let ctx = Arc::new(ctx);
        let started = Instant::now();

        let mut waiting: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.as_str(), node.dependencies.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, node) in &self.nodes {
            for dep in &node.dependencies {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut ready: VecDeque<&str> = order
            .iter()
            .map(String::as_str)
            .filter(|id| waiting.get(id).copied() == Some(0))
            .collect();
        let mut report = DagReport::default();
        let mut running: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<(String, NodeReport)> = JoinSet::new();
        let mut cancelled = cancellation.is_cancelled();

        loop {
            while !cancelled && tasks.len() < self.config.max_parallelism {
                let Some(id) = ready.pop_front() else {
                    break;
                };
                let Some(node) = self.nodes.get(id) else {
                    continue;
                };
                let inputs = node
                    .dependencies
                    .iter()
                    .filter_map(|dep| report.output(dep).map(|v| (dep.clone(), v.clone())))
                    .collect();
                running.insert(id.to_string());
                debug!(node = id, "Node started");
                tasks.spawn(run_node(
                    node.id.clone(),
                    Arc::clone(&node.work),
                    Arc::clone(&ctx),
                    inputs,
                    node.timeout.unwrap_or_else(|| self.config.default_node_timeout()),
                    node.guard.clone(),
                    self.breakers.clone(),
                ));
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = cancellation.cancelled(), if !cancelled => {
                    cancelled = true;
                    info!("Execution cancelled, draining in-flight nodes");
                    continue;
                }
            };

            let (id, node_report) = match joined {
                Some(Ok(finished)) => finished,
                Some(Err(e)) => {
                    warn!(error = %e, "Node task aborted");
                    continue;
                }
                None => break,
            };
            running.remove(&id);
            report.completion_order.push(id.clone());

            let Some((id, _)) = self.nodes.get_key_value(&id) else {
                continue;
            };
            let id = id.as_str();

            if node_report.status.is_success() {
                debug!(node = id, "Node succeeded");
                for dependent in dependents.get(id).into_iter().flatten() {
                    if let Some(count) = waiting.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 && !report.nodes.contains_key(*dependent) {
                            ready.push_back(*dependent);
                        }
                    }
                }
            } else {
                warn!(
                    node = id,
                    status = %node_report.status,
                    error = node_report.error.as_deref().unwrap_or(""),
                    "Node did not succeed, skipping dependents"
                );
                skip_downstream(id, &dependents, &mut report);
            }
            report.nodes.insert(id.to_string(), node_report);
        }

        for id in running {
            report.nodes.entry(id).or_insert_with(|| {
                NodeReport::failed(NodeStatus::Failed, "node task aborted".into(), None)
            });
        }
        for id in self.nodes.keys() {
            report.nodes.entry(id.clone()).or_insert_with(|| {
                NodeReport::failed(NodeStatus::Cancelled, "execution cancelled".into(), None)
            });
        }
        report.cancelled = cancelled;

        info!(
            succeeded = report.with_status(NodeStatus::Succeeded).len(),
            failed = report.with_status(NodeStatus::Failed).len(),
            timed_out = report.with_status(NodeStatus::TimedOut).len(),
            skipped = report.with_status(NodeStatus::Skipped).len(),
            cancelled = report.with_status(NodeStatus::Cancelled).len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "DAG execution finished"
        );
        Ok(report)
    }
}

/// Mark every node reachable from `failed` as skipped.
fn skip_downstream(failed: &str, dependents: &HashMap<&str, Vec<&str>>, report: &mut DagReport) {
    let mut stack: Vec<&str> = dependents.get(failed).cloned().unwrap_or_default();
    while let Some(id) = stack.pop() {
        if report.nodes.contains_key(id) {
            continue;
        }
        report.nodes.insert(
            id.to_string(),
            NodeReport::failed(
                NodeStatus::Skipped,
                format!("upstream node {} did not succeed", failed),
                None,
            ),
        );
        stack.extend(dependents.get(id).into_iter().flatten());
    }
}

async fn run_node<C>(
    id: String,
    work: NodeWork<C>,
    ctx: Arc<C>,
    inputs: NodeInputs,
    timeout: Duration,
    guard: Option<String>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
) -> (String, NodeReport)
where
    C: Send + Sync + 'static,
{
    let breaker = guard.as_deref().zip(breakers.as_deref());
    if let Some((dependency, breakers)) = breaker {
        if !breakers.is_healthy(dependency) {
            let error = format!("dependency unavailable, circuit open: {}", dependency);
            return (id, NodeReport::failed(NodeStatus::Failed, error, None));
        }
    }

    let started = Instant::now();
    let call = AssertUnwindSafe(work(ctx, inputs)).catch_unwind();
    let report = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(output))) => NodeReport::succeeded(output, started.elapsed()),
        Ok(Ok(Err(e))) => NodeReport::failed(NodeStatus::Failed, e, Some(started.elapsed())),
        Ok(Err(_)) => NodeReport::failed(
            NodeStatus::Failed,
            "node panicked".into(),
            Some(started.elapsed()),
        ),
        Err(_) => NodeReport::failed(
            NodeStatus::TimedOut,
            format!("timed out after {}ms", timeout.as_millis()),
            Some(started.elapsed()),
        ),
    };

    if let Some((dependency, breakers)) = breaker {
        if report.status.is_success() {
            breakers.record_success(dependency);
        } else {
            breakers.record_failure(dependency);
        }
    }
    (id, report)
}
