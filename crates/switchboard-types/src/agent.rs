//! Agent identity and registry record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoordError;
use crate::MAX_AGENT_ID_LEN;

/// Derived liveness of an agent, computed from `last_seen` at read time.
/// Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a registration call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// No record existed; a fresh one was created.
    Created,
    /// The same session re-registered; only the heartbeat moved.
    Reconnected,
    /// A different session claimed an offline record.
    TookOver,
    /// A live collision forced a `-N` suffix onto the requested id.
    Suffixed,
}

/// A registry row as stored. `session_id` is opaque and client-supplied;
/// it exists only to arbitrate collisions and never leaves the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: String,
    pub display_name: Option<String>,
    pub description: String,
    pub capabilities: Vec<String>,
    pub session_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AgentRecord {
    /// Derives liveness against the configured heartbeat TTL.
    pub fn status(&self, heartbeat_ttl_secs: i64, now: DateTime<Utc>) -> AgentStatus {
        let age = now.signed_duration_since(self.last_seen).num_seconds();
        if age <= heartbeat_ttl_secs {
            AgentStatus::Online
        } else {
            AgentStatus::Offline
        }
    }

    /// The caller-facing projection with derived status and without the
    /// session id.
    pub fn view(&self, heartbeat_ttl_secs: i64, now: DateTime<Utc>) -> AgentView {
        AgentView {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            capabilities: self.capabilities.clone(),
            registered_at: self.registered_at,
            last_seen: self.last_seen,
            status: self.status(heartbeat_ttl_secs, now),
        }
    }
}

/// The wire shape of an agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub description: String,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: AgentStatus,
}

/// Validates the canonical agent id shape: `{machine}/{project}`.
///
/// Bare names without a slash are rejected, as are leading special
/// characters, over-length ids, and characters outside `[A-Za-z0-9_./-]`.
pub fn validate_agent_id(agent_id: &str) -> Result<(), CoordError> {
    if agent_id.is_empty() {
        return Err(CoordError::invalid_request("agent_id", "cannot be empty"));
    }
    if agent_id.len() > MAX_AGENT_ID_LEN {
        return Err(CoordError::invalid_request(
            "agent_id",
            "must be 64 characters or less",
        ));
    }
    let mut chars = agent_id.chars();
    let first = chars.next().unwrap_or('/');
    if !first.is_ascii_alphanumeric() {
        return Err(CoordError::invalid_request(
            "agent_id",
            "must start with an alphanumeric character",
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-')) {
        return Err(CoordError::invalid_request(
            "agent_id",
            "may only contain alphanumerics and _ . / -",
        ));
    }
    if !agent_id.contains('/') {
        return Err(CoordError::invalid_request(
            "agent_id",
            "bare machine names are not valid; use the machine/project form",
        ));
    }
    Ok(())
}
