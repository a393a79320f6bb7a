//! Concord DAG - dependency-graph execution for multi-step agent workflows
//!
//! Nodes are named units of async work with declared dependencies. The
//! executor validates the graph up front (unknown dependencies and cycles are
//! configuration errors and nothing runs), then runs every node whose
//! dependencies succeeded, concurrently up to a parallelism bound.
//!
//! A node that fails or times out causes everything downstream of it to be
//! skipped, while independent branches run to completion. Nodes may be
//! guarded by a circuit breaker so work against an unavailable dependency
//! fails fast.

#![deny(unsafe_code)]

pub mod error;
pub mod executor;
pub mod node;

pub use error::{DagError, DagResult};
pub use executor::{DagExecutor, DagReport};
pub use node::{DagNode, NodeInputs, NodeReport, NodeStatus};
