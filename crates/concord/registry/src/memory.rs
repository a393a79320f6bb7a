//! In-memory agent registry
//!
//! Used when the bus runs as a single process. Registrations live only as
//! long as the registry itself.

use async_trait::async_trait;
use concord_types::{AgentId, AgentRegistration};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::registry::AgentRegistry;

/// In-memory agent registry
pub struct InMemoryAgentRegistry {
    agents: DashMap<AgentId, AgentRegistration>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }
}

impl Default for InMemoryAgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn register(&self, registration: AgentRegistration) -> Result<()> {
        // The entry guard holds the shard lock, so check-and-insert is atomic.
        match self.agents.entry(registration.agent_id.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!(
                    agent_id = %registration.agent_id,
                    agent_type = %registration.agent_type,
                    tenant_id = %registration.tenant_id,
                    "Agent registered"
                );
                entry.insert(registration);
                Ok(())
            }
        }
    }

    async fn unregister(&self, agent_id: &AgentId) -> Result<bool> {
        let removed = self.agents.remove(agent_id).is_some();
        if removed {
            info!(agent_id = %agent_id, "Agent unregistered");
        } else {
            debug!(agent_id = %agent_id, "Unregister of unknown agent ignored");
        }
        Ok(removed)
    }

    async fn get(&self, agent_id: &AgentId) -> Result<AgentRegistration> {
        self.agents
            .get(agent_id)
            .map(|r| r.clone())
            .ok_or_else(|| RegistryError::NotFound(agent_id.clone()))
    }

    async fn contains(&self, agent_id: &AgentId) -> Result<bool> {
        Ok(self.agents.contains_key(agent_id))
    }

    async fn list_all(&self) -> Result<Vec<AgentRegistration>> {
        Ok(self.agents.iter().map(|r| r.value().clone()).collect())
    }

    async fn list_by_type(&self, agent_type: &str) -> Result<Vec<AgentRegistration>> {
        Ok(self
            .agents
            .iter()
            .filter(|r| r.agent_type == agent_type)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn list_by_capability(&self, capability: &str) -> Result<Vec<AgentRegistration>> {
        Ok(self
            .agents
            .iter()
            .filter(|r| r.has_capability(capability))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.agents.len())
    }
}
