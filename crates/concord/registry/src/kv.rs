//! Key/value backed registry for multi-process deployments.
//!
//! The bus only needs a minimal store: `get`, `set` with TTL, an atomic
//! `set_if_absent`, `delete`, and prefix listing. [`InMemoryKeyValueStore`]
//! is a reference implementation; production deployments back the trait
//! with a shared cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_types::{AgentId, AgentRegistration};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::registry::AgentRegistry;

const AGENT_KEY_PREFIX: &str = "concord:agent:";

/// Minimal key/value store interface.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Store `value` only if `key` is absent (or expired). Returns whether
    /// the value was written.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<bool>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

/// In-process key/value store honouring TTLs on read.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(stored) = self.entries.get(key) {
            if stored.is_live() {
                return Ok(Some(stored.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, stored| !stored.is_live());
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live() {
                    Ok(false)
                } else {
                    entry.insert(StoredValue::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(key)
            .map(|(_, stored)| stored.is_live())
            .unwrap_or(false))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live())
            .map(|e| e.key().clone())
            .collect())
    }
}

/// Agent registry persisted in a shared key/value store.
pub struct KeyValueAgentRegistry {
    store: Arc<dyn KeyValueStore>,
    ttl: Option<Duration>,
}

impl KeyValueAgentRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    fn key(agent_id: &AgentId) -> String {
        format!("{}{}", AGENT_KEY_PREFIX, agent_id)
    }

    /// Re-write a registration to extend its TTL.
    pub async fn refresh(&self, agent_id: &AgentId) -> Result<()> {
        let registration = self.get(agent_id).await?;
        let encoded = serde_json::to_string(&registration)?;
        self.store.set(&Self::key(agent_id), encoded, self.ttl).await
    }
}

#[async_trait]
impl AgentRegistry for KeyValueAgentRegistry {
    async fn register(&self, registration: AgentRegistration) -> Result<()> {
        let key = Self::key(&registration.agent_id);
        let encoded = serde_json::to_string(&registration)?;

        if !self.store.set_if_absent(&key, encoded, self.ttl).await? {
            return Err(RegistryError::AlreadyRegistered(registration.agent_id));
        }

        info!(
            agent_id = %registration.agent_id,
            tenant_id = %registration.tenant_id,
            "Agent registered in shared registry"
        );
        Ok(())
    }

    async fn unregister(&self, agent_id: &AgentId) -> Result<bool> {
        let removed = self.store.delete(&Self::key(agent_id)).await?;
        debug!(agent_id = %agent_id, removed, "Agent unregistered from shared registry");
        Ok(removed)
    }

    async fn get(&self, agent_id: &AgentId) -> Result<AgentRegistration> {
        match self.store.get(&Self::key(agent_id)).await? {
            Some(encoded) => Ok(serde_json::from_str(&encoded)?),
            None => Err(RegistryError::NotFound(agent_id.clone())),
        }
    }

    async fn contains(&self, agent_id: &AgentId) -> Result<bool> {
        Ok(self.store.get(&Self::key(agent_id)).await?.is_some())
    }

    async fn list_all(&self) -> Result<Vec<AgentRegistration>> {
        let mut registrations = Vec::new();
        for key in self.store.keys(AGENT_KEY_PREFIX).await? {
            // A key may expire between listing and reading.
            if let Some(encoded) = self.store.get(&key).await? {
                registrations.push(serde_json::from_str(&encoded)?);
            }
        }
        Ok(registrations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_for;

    fn shared_registry(ttl: Option<Duration>) -> (Arc<InMemoryKeyValueStore>, KeyValueAgentRegistry) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let registry = KeyValueAgentRegistry::new(store.clone(), ttl);
        (store, registry)
    }

    #[tokio::test]
    async fn registrations_round_trip_through_store() {
        let (store, registry) = shared_registry(None);
        let registration = AgentRegistration::new("planner", "llm").with_capability("plan");

        registry.register(registration.clone()).await.unwrap();

        assert_eq!(registry.get(&AgentId::new("planner")).await.unwrap(), registration);
        assert_eq!(store.keys(AGENT_KEY_PREFIX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn two_registries_share_one_store() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let node_a = KeyValueAgentRegistry::new(store.clone(), None);
        let node_b = KeyValueAgentRegistry::new(store, None);

        node_a
            .register(AgentRegistration::new("shared", "worker"))
            .await
            .unwrap();
        let duplicate = node_b
            .register(AgentRegistration::new("shared", "worker"))
            .await;

        assert!(matches!(duplicate, Err(RegistryError::AlreadyRegistered(_))));
        assert!(node_b.contains(&AgentId::new("shared")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn registrations_expire_after_ttl() {
        let (_store, registry) = shared_registry(Some(Duration::from_secs(30)));
        registry
            .register(AgentRegistration::new("ephemeral", "worker"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(!registry.contains(&AgentId::new("ephemeral")).await.unwrap());
        // An expired key does not block re-registration.
        registry
            .register(AgentRegistration::new("ephemeral", "worker"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_ttl() {
        let (_store, registry) = shared_registry(Some(Duration::from_secs(30)));
        let id = AgentId::new("heartbeat");
        registry
            .register(AgentRegistration::new("heartbeat", "worker"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        registry.refresh(&id).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert!(registry.contains(&id).await.unwrap());
    }

    #[tokio::test]
    async fn unregister_twice_is_a_no_op() {
        let (_store, registry) = shared_registry(None);
        let id = AgentId::new("gone");
        registry
            .register(AgentRegistration::new("gone", "worker"))
            .await
            .unwrap();

        assert!(registry.unregister(&id).await.unwrap());
        assert!(!registry.unregister(&id).await.unwrap());
    }

    #[tokio::test]
    async fn registry_for_without_store_is_in_memory() {
        let registry = registry_for(None, None);
        registry
            .register(AgentRegistration::new("local", "worker"))
            .await
            .unwrap();
        assert_eq!(registry.count().await.unwrap(), 1);
    }
}
