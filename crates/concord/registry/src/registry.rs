//! Agent registry trait

use async_trait::async_trait;
use concord_types::{AgentId, AgentRegistration, TenantId};

use crate::error::Result;

/// Registry of agents reachable through the bus.
///
/// Implementations must serialize mutations: concurrent registration of the
/// same agent ID yields exactly one success, all other callers receive
/// [`RegistryError::AlreadyRegistered`](crate::RegistryError::AlreadyRegistered).
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Register an agent.
    async fn register(&self, registration: AgentRegistration) -> Result<()>;

    /// Remove an agent. Returns whether an entry was removed; removing an
    /// unknown agent is a no-op, not an error.
    async fn unregister(&self, agent_id: &AgentId) -> Result<bool>;

    /// Look up an agent.
    async fn get(&self, agent_id: &AgentId) -> Result<AgentRegistration>;

    /// Check whether an agent is registered.
    async fn contains(&self, agent_id: &AgentId) -> Result<bool>;

    /// All registrations.
    async fn list_all(&self) -> Result<Vec<AgentRegistration>>;

    /// Agents of a given type.
    async fn list_by_type(&self, agent_type: &str) -> Result<Vec<AgentRegistration>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.agent_type == agent_type)
            .collect())
    }

    /// Agents advertising a capability.
    async fn list_by_capability(&self, capability: &str) -> Result<Vec<AgentRegistration>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.has_capability(capability))
            .collect())
    }

    /// Agents belonging to a tenant.
    async fn list_for_tenant(&self, tenant_id: &TenantId) -> Result<Vec<AgentRegistration>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| &r.tenant_id == tenant_id)
            .collect())
    }

    /// Number of registered agents.
    async fn count(&self) -> Result<usize> {
        Ok(self.list_all().await?.len())
    }
}
