//! DAG executor errors.

use thiserror::Error;

/// Reasons a graph is refused before any node runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// Nodes that could not be ordered; each lies on or behind a cycle.
    #[error("cyclic dependency among nodes: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: String, dependency: String },

    #[error("duplicate node: {0}")]
    DuplicateNode(String),
}

pub type DagResult<T> = Result<T, DagError>;
