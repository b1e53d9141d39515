//! Admin REST handlers under `/admin/api/*`.
//!
//! Key lifecycle, audit queries, and registry administration. The auth
//! middleware has already required the admin credential for everything
//! here; in dev mode these endpoints are open like the rest.

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use switchboard_auth::composite_token;
use switchboard_observe::{Actor, ActorKind, AuditAction, AuditFilter, AuditOutcome};
use switchboard_types::{AgentStatus, CoordError};

use crate::api::{with_conn, ApiError};
use crate::middleware::audit;
use crate::rate_limit::enforce;
use crate::AppState;

/// Body for `POST /admin/api/keys`.
#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    #[serde(default = "default_pattern")]
    pub agent_pattern: String,
    #[serde(default)]
    pub description: String,
}

fn default_pattern() -> String {
    "*".to_string()
}

/// Handler for `POST /admin/api/keys`.
///
/// Returns the composite bearer token exactly once; only hashes are stored.
pub async fn create_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Response, ApiError> {
    enforce(&state, "register_key", "admin").await?;

    let pattern = body.agent_pattern.clone();
    let description = body.description.clone();
    let created = with_conn(&state.pool, move |conn| {
        switchboard_auth::create_key(conn, &pattern, &description)
    })
    .await?;

    audit(
        &state,
        Actor::new(ActorKind::Admin, "admin"),
        AuditAction::KeyCreated,
        created.record.key_id.clone(),
        AuditOutcome::Success,
        json!({ "agent_pattern": body.agent_pattern }),
    )
    .await;

    let token = composite_token(&state.auth, &created.api_key);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "key_id": created.record.key_id,
            "api_key": token,
            "agent_pattern": created.record.agent_pattern,
            "created_at": created.record.created_at,
        })),
    )
        .into_response())
}

/// Handler for `GET /admin/api/keys`. Metadata only, never secrets.
pub async fn list_keys_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let keys = with_conn(&state.pool, switchboard_auth::list_keys).await?;
    Ok(Json(json!({ "keys": keys })))
}

/// Handler for `DELETE /admin/api/keys/{keyId}`.
pub async fn revoke_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(key_id): Path<String>,
) -> Result<Response, ApiError> {
    let revoke_id = key_id.clone();
    let revoked = with_conn(&state.pool, move |conn| {
        switchboard_auth::revoke_key(conn, &revoke_id)
    })
    .await?;

    if !revoked {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Key '{key_id}' not found") })),
        )
            .into_response());
    }

    audit(
        &state,
        Actor::new(ActorKind::Admin, "admin"),
        AuditAction::KeyRevoked,
        key_id.clone(),
        AuditOutcome::Success,
        json!({}),
    )
    .await;

    Ok(Json(json!({ "status": "ok", "key_id": key_id })).into_response())
}

/// Query parameters for `GET /admin/api/audit`.
#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    /// Restrict to a single action label (e.g. `auth_failure`).
    pub action: Option<String>,
    /// Restrict to a single acting identity.
    pub actor: Option<String>,
    /// Maximum entries to return (default 100, max 1000).
    pub limit: Option<i64>,
}

/// Handler for `GET /admin/api/audit`. Entries come back newest-first.
pub async fn audit_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = AuditFilter {
        action: query.action,
        actor_id: query.actor,
        limit: Some(query.limit.unwrap_or(100).clamp(1, 1_000)),
    };
    let entries = with_conn(&state.pool, move |conn| {
        switchboard_observe::query_recent(conn, &filter)
            .map_err(|e| CoordError::store_unavailable(e))
    })
    .await?;
    Ok(Json(json!({ "count": entries.len(), "entries": entries })))
}

/// Query parameters for the admin agent listing and bulk removal.
#[derive(Debug, Deserialize)]
pub struct AgentsQuery {
    /// Glob over agent ids (e.g. `stress/*`).
    pub pattern: Option<String>,
    /// "online" or "offline".
    pub status: Option<String>,
}

fn parse_status(raw: Option<&str>) -> Result<Option<AgentStatus>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some("online") => Ok(Some(AgentStatus::Online)),
        Some("offline") => Ok(Some(AgentStatus::Offline)),
        Some(other) => Err(ApiError(CoordError::invalid_request(
            "status",
            &format!("'{other}' is not a status; use online or offline"),
        ))),
    }
}

/// Handler for `GET /admin/api/agents` with status and pattern filters.
pub async fn list_agents_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<AgentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = parse_status(query.status.as_deref())?;
    let pattern = query.pattern.clone();
    let heartbeat_ttl = state.settings.heartbeat_ttl_secs;

    let agents = with_conn(&state.pool, move |conn| {
        let now = Utc::now();
        let views = switchboard_registry::list(conn)?
            .iter()
            .map(|a| a.view(heartbeat_ttl, now))
            .filter(|view| match status {
                Some(wanted) => view.status == wanted,
                None => true,
            })
            .filter(|view| match pattern.as_deref() {
                Some(pattern) => switchboard_auth::pattern_allows(pattern, &view.id),
                None => true,
            })
            .collect::<Vec<_>>();
        Ok(views)
    })
    .await?;

    Ok(Json(json!({ "count": agents.len(), "agents": agents })))
}

/// Handler for `DELETE /admin/api/agents`.
///
/// Requires a pattern or a status filter; a bare `*` without a status is
/// refused so a typo cannot empty the registry.
pub async fn remove_agents_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<AgentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = parse_status(query.status.as_deref())?;
    let pattern = query
        .pattern
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    if pattern.is_none() && status.is_none() {
        return Err(ApiError(CoordError::invalid_request(
            "pattern",
            "supply a pattern (or status) to select agents for removal",
        )));
    }
    if pattern.as_deref() == Some("*") && status.is_none() {
        return Err(ApiError(CoordError::invalid_request(
            "pattern",
            "refusing to remove all agents; narrow the pattern or add status=offline",
        )));
    }

    let effective_pattern = pattern.unwrap_or_else(|| "*".to_string());
    let heartbeat_ttl = state.settings.heartbeat_ttl_secs;
    let pattern_for_db = effective_pattern.clone();
    let removed = with_conn(&state.pool, move |conn| {
        switchboard_registry::remove_matching(
            conn,
            &pattern_for_db,
            status,
            heartbeat_ttl,
            Utc::now(),
        )
    })
    .await?;

    for agent_id in &removed {
        state.hub.forget(agent_id);
    }

    audit(
        &state,
        Actor::new(ActorKind::Admin, "admin"),
        AuditAction::AgentsRemoved,
        effective_pattern.clone(),
        AuditOutcome::Success,
        json!({ "removed": removed.len() }),
    )
    .await;

    Ok(Json(json!({
        "status": "ok",
        "pattern": effective_pattern,
        "removed": removed.len(),
        "agent_ids": removed,
    })))
}
