//! Agent messages.
//!
//! An [`AgentMessage`] is created by a sender, passes the validation pipeline
//! exactly once, is consumed by zero or more handlers, and is then dropped.
//! The bus never persists messages.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{AgentId, ConversationId, MessageId, TenantId};

/// Kind of a message; handlers are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Query,
    Response,
    Event,
    Notification,
    Heartbeat,
    GovernanceRequest,
    GovernanceResponse,
    ConstitutionalValidation,
    TaskRequest,
    TaskResponse,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Command => "command",
            MessageType::Query => "query",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Notification => "notification",
            MessageType::Heartbeat => "heartbeat",
            MessageType::GovernanceRequest => "governance_request",
            MessageType::GovernanceResponse => "governance_response",
            MessageType::ConstitutionalValidation => "constitutional_validation",
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
        };
        f.write_str(name)
    }
}

/// Message priority, ordered from `Low` to `Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single registered agent.
    Agent(AgentId),
    /// Every registered agent of the sender's tenant.
    Broadcast,
}

impl Recipient {
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            Recipient::Agent(id) => Some(id),
            Recipient::Broadcast => None,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Agent(id) => write!(f, "{}", id),
            Recipient::Broadcast => f.write_str("*"),
        }
    }
}

/// The unit of communication on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub from: AgentId,
    pub to: Recipient,
    pub kind: MessageType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub tenant_id: TenantId,
    /// Policy commitment ("constitutional hash") the sender claims to honour.
    pub policy_commitment: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub impact_score: Option<f64>,
}

impl AgentMessage {
    /// Create a message addressed to a single agent.
    pub fn new(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        kind: MessageType,
        payload: serde_json::Value,
        policy_commitment: impl Into<String>,
    ) -> Self {
        Self::with_recipient(
            from.into(),
            Recipient::Agent(to.into()),
            kind,
            payload,
            policy_commitment,
        )
    }

    /// Create a message addressed to every agent of the sender's tenant.
    pub fn broadcast(
        from: impl Into<AgentId>,
        kind: MessageType,
        payload: serde_json::Value,
        policy_commitment: impl Into<String>,
    ) -> Self {
        Self::with_recipient(
            from.into(),
            Recipient::Broadcast,
            kind,
            payload,
            policy_commitment,
        )
    }

    fn with_recipient(
        from: AgentId,
        to: Recipient,
        kind: MessageType,
        payload: serde_json::Value,
        policy_commitment: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::generate(),
            conversation_id: ConversationId::generate(),
            from,
            to,
            kind,
            payload,
            priority: Priority::default(),
            tenant_id: TenantId::default(),
            policy_commitment: policy_commitment.into(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            impact_score: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    /// Expire the message `ttl` after its creation time.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.expires_at = ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_impact_score(mut self, score: f64) -> Self {
        self.impact_score = Some(score.clamp(0.0, 1.0));
        self
    }

    /// Copy of this message re-addressed to `agent`, with a fresh ID.
    pub fn readdressed(&self, agent: AgentId) -> Self {
        let mut copy = self.clone();
        copy.id = MessageId::generate();
        copy.to = Recipient::Agent(agent);
        copy.updated_at = Utc::now();
        copy
    }

    /// Whether the message has passed its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
