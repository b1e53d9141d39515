//! Persistence operations for the audit ring.
//!
//! All writes go through [`record_event`], which inserts the entry and trims
//! rows beyond the ring bound in the same call. Reads go through
//! [`query_recent`], newest-first with optional action and actor filters.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::AuditError;
use crate::event::{Actor, AuditAction, AuditEntry, AuditOutcome};

/// Maximum number of retained audit entries.
pub const AUDIT_RING_MAX: i64 = 1_000;

/// Appends one entry to the audit ring.
///
/// The insert and the ring trim happen together, so the table never grows
/// more than one row beyond [`AUDIT_RING_MAX`].
///
/// # Errors
///
/// Returns `AuditError::Database` on SQL failure or
/// `AuditError::Serialization` if `detail` cannot be serialised.
pub fn record_event(
    conn: &Connection,
    actor: &Actor,
    action: AuditAction,
    resource: &str,
    outcome: AuditOutcome,
    detail: &serde_json::Value,
) -> Result<AuditEntry, AuditError> {
    let detail_json = serde_json::to_string(detail)?;
    let occurred_at = Utc::now().to_rfc3339();

    let id = conn.query_row(
        "INSERT INTO audit_log
            (occurred_at, actor_kind, actor_id, action, resource, outcome, detail_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING id",
        params![
            occurred_at,
            actor.kind.as_str(),
            actor.id,
            action.as_str(),
            resource,
            outcome.as_str(),
            detail_json,
        ],
        |row| row.get::<_, i64>(0),
    )?;

    conn.execute(
        "DELETE FROM audit_log WHERE id <= (
            SELECT id FROM audit_log ORDER BY id DESC LIMIT 1 OFFSET ?1
         )",
        params![AUDIT_RING_MAX],
    )?;

    tracing::debug!(
        action = action.as_str(),
        actor = %actor.id,
        resource,
        outcome = outcome.as_str(),
        "audit event recorded"
    );

    Ok(AuditEntry {
        id,
        occurred_at,
        actor_kind: actor.kind.as_str().to_string(),
        actor_id: actor.id.clone(),
        action: action.as_str().to_string(),
        resource: resource.to_string(),
        outcome: outcome.as_str().to_string(),
        detail_json,
    })
}

/// Filter criteria for audit queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Restrict to a single action label (e.g. `auth_failure`).
    pub action: Option<String>,
    /// Restrict to a single acting identity.
    pub actor_id: Option<String>,
    /// Maximum number of entries to return (default 100).
    pub limit: Option<i64>,
}

/// Queries recent audit entries, newest first.
pub fn query_recent(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let mut idx = 1u32;

    if let Some(ref action) = filter.action {
        clauses.push(format!("action = ?{idx}"));
        param_values.push(Box::new(action.clone()));
        idx += 1;
    }

    if let Some(ref actor_id) = filter.actor_id {
        clauses.push(format!("actor_id = ?{idx}"));
        param_values.push(Box::new(actor_id.clone()));
        idx += 1;
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let limit = filter.limit.unwrap_or(100);
    let sql = format!(
        "SELECT id, occurred_at, actor_kind, actor_id, action, resource, outcome, detail_json
         FROM audit_log
         {where_clause}
         ORDER BY id DESC
         LIMIT ?{idx}"
    );
    param_values.push(Box::new(limit));

    let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        Ok(AuditEntry {
            id: row.get(0)?,
            occurred_at: row.get(1)?,
            actor_kind: row.get(2)?,
            actor_id: row.get(3)?,
            action: row.get(4)?,
            resource: row.get(5)?,
            outcome: row.get(6)?,
            detail_json: row.get(7)?,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }

    Ok(entries)
}
