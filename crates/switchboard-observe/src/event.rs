//! Actor, action, and entry types for the audit log.

use serde::{Deserialize, Serialize};

/// The class of identity that performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    /// An API-key holder acting as an agent.
    Agent,
    /// The OAuth reverse proxy.
    Proxy,
    /// The administrator.
    Admin,
    /// An unauthenticated caller (public endpoints, dev mode).
    Anonymous,
    /// The coordinator itself (scavenger, startup).
    System,
}

impl ActorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Proxy => "proxy",
            Self::Admin => "admin",
            Self::Anonymous => "anonymous",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for ActorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "proxy" => Ok(Self::Proxy),
            "admin" => Ok(Self::Admin),
            "anonymous" => Ok(Self::Anonymous),
            "system" => Ok(Self::System),
            _ => Err(()),
        }
    }
}

/// The identity behind an audited action.
#[derive(Debug, Clone)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    pub fn new(kind: ActorKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn system() -> Self {
        Self::new(ActorKind::System, "coordinator")
    }
}

/// The audited action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AuthSuccess,
    AuthFailure,
    AgentRegistered,
    AgentUnregistered,
    AgentsRemoved,
    MessageSent,
    MessagesAcked,
    KeyCreated,
    KeyRevoked,
    ScopeDenied,
    RateLimitExceeded,
    StoreError,
}

impl AuditAction {
    /// Canonical string label, used both at rest and as the query filter key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::AgentRegistered => "agent_registered",
            Self::AgentUnregistered => "agent_unregistered",
            Self::AgentsRemoved => "agents_removed",
            Self::MessageSent => "message_sent",
            Self::MessagesAcked => "messages_acked",
            Self::KeyCreated => "key_created",
            Self::KeyRevoked => "key_revoked",
            Self::ScopeDenied => "scope_denied",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::StoreError => "store_error",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the audited action succeeded, was denied, or failed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Failure => "failure",
        }
    }
}

/// A single row from the `audit_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Auto-incremented row id; also the ring ordering key.
    pub id: i64,
    /// ISO 8601 timestamp of when the action occurred.
    pub occurred_at: String,
    /// The class of the acting identity.
    pub actor_kind: String,
    /// The acting identity's principal id (agent id, key id, "admin", an IP).
    pub actor_id: String,
    /// The action label (e.g. `message_sent`).
    pub action: String,
    /// The entity acted on (agent id, message id, key id).
    pub resource: String,
    /// The outcome label.
    pub outcome: String,
    /// Structured action-specific detail as a JSON string.
    pub detail_json: String,
}
