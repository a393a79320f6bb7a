//! Concord Registry - who is on the bus
//!
//! This crate tracks registered agents, their capabilities, and their tenant:
//!
//! - **AgentRegistry**: the registry trait consumed by the router
//! - **InMemoryAgentRegistry**: single-process registry (degraded mode)
//! - **KeyValueAgentRegistry**: registry shared across processes through a
//!   [`KeyValueStore`]
//!
//! Use [`registry_for`] to pick the backend based on whether a key/value
//! store is available.

#![deny(unsafe_code)]

pub mod error;
pub mod kv;
pub mod memory;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

pub use error::{RegistryError, Result};
pub use kv::{InMemoryKeyValueStore, KeyValueAgentRegistry, KeyValueStore};
pub use memory::InMemoryAgentRegistry;
pub use registry::AgentRegistry;

/// Select a registry backend.
///
/// With a key/value store the registry is shared across processes and
/// entries expire after `ttl`; without one the registry lives in memory.
pub fn registry_for(
    store: Option<Arc<dyn KeyValueStore>>,
    ttl: Option<Duration>,
) -> Arc<dyn AgentRegistry> {
    match store {
        Some(store) => Arc::new(KeyValueAgentRegistry::new(store, ttl)),
        None => {
            tracing::info!("No key/value store configured, using in-memory agent registry");
            Arc::new(InMemoryAgentRegistry::new())
        }
    }
}
