//! REST handlers under `/agent/api/*`.
//!
//! This surface exists for processes that cannot speak the RPC surface:
//! enrollment hooks (`register`, `unregister`), inbox probes (`pending`),
//! external watchers (`wait`), and credential preflight (`validate`).

use axum::{
    body::Body,
    extract::{Extension, Query},
    http::Request,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use switchboard_auth::Principal;
use switchboard_messaging::{wait_for_messages, WaitOptions, Waited};
use switchboard_observe::{Actor, ActorKind, AuditAction, AuditOutcome};
use switchboard_registry::{RegisterRequest, UnregisterDisposition};
use switchboard_types::{
    validate_agent_id, CoordError, MAX_WAIT_SECS, MIN_WAIT_SECS,
};

use crate::api::{with_conn, ApiError};
use crate::middleware::{audit, client_ip, AuthContext, IdentityContext};
use crate::rate_limit::enforce;
use crate::AppState;

fn rest_actor(principal: &Principal, ip: &str) -> Actor {
    match principal {
        Principal::Agent { key_id, .. } => Actor::new(ActorKind::Agent, key_id.clone()),
        Principal::Proxy => Actor::new(ActorKind::Proxy, "proxy"),
        Principal::Admin => Actor::new(ActorKind::Admin, "admin"),
        Principal::Anonymous => Actor::new(ActorKind::Anonymous, ip.to_string()),
    }
}

/// Body accepted by `POST /agent/api/register` when the identity headers
/// are absent.
#[derive(Debug, Default, Deserialize)]
pub struct RegisterBody {
    pub machine: Option<String>,
    pub project: Option<String>,
    pub session_id: Option<String>,
    pub name: Option<String>,
    pub capabilities: Option<Vec<String>>,
}

/// Handler for `POST /agent/api/register`.
///
/// Identity comes from the headers (already canonicalized by the identity
/// middleware) or from `machine`/`project` in the JSON body. The response
/// carries the canonical id, which may differ from the requested one when a
/// collision was resolved.
pub async fn register_handler(req: Request<Body>) -> Result<Response, ApiError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .cloned()
        .ok_or_else(|| ApiError(CoordError::store_unavailable("application state missing")))?;
    let principal = req
        .extensions()
        .get::<AuthContext>()
        .map(|c| c.0.clone())
        .unwrap_or(Principal::Anonymous);
    let identity = req
        .extensions()
        .get::<IdentityContext>()
        .cloned()
        .unwrap_or_default();
    let ip = client_ip(&req, state.settings.behind_proxy);

    let body: RegisterBody = match axum::body::to_bytes(req.into_body(), 64 * 1024).await {
        Ok(bytes) if bytes.is_empty() => RegisterBody::default(),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| CoordError::invalid_request("body", &format!("invalid JSON: {e}")))?,
        Err(e) => {
            return Err(ApiError(CoordError::invalid_request(
                "body",
                &format!("unreadable body: {e}"),
            )))
        }
    };

    // Header identity wins; the body is the fallback for callers that
    // cannot set custom headers.
    let (requested, session_id) = match identity.agent_id {
        Some(id) => (id, identity.session_id),
        None => {
            let machine = body.machine.as_deref().unwrap_or_default().trim().to_string();
            if machine.is_empty() {
                return Err(ApiError(CoordError::invalid_request(
                    "machine",
                    "supply X-Machine-Name headers or machine/project in the body",
                )));
            }
            let composed = match body.project.as_deref().map(str::trim) {
                Some(project) if !project.is_empty() => format!("{machine}/{project}"),
                _ => machine,
            };
            validate_agent_id(&composed)?;
            principal.require_scope(&composed)?;
            (composed, body.session_id.clone())
        }
    };

    // Authenticated callers are limited per agent id; only anonymous
    // traffic is keyed by source address.
    let rate_identity = if matches!(principal, Principal::Anonymous) {
        ip.clone()
    } else {
        requested.clone()
    };
    enforce(&state, "rest_register", &rate_identity).await?;

    let heartbeat_ttl = state.settings.heartbeat_ttl_secs;
    let display_name = body.name.clone();
    let capabilities = body.capabilities.clone();
    let requested_for_db = requested.clone();
    let (view, outcome) = with_conn(&state.pool, move |conn| {
        let (record, outcome) = switchboard_registry::register(
            conn,
            &RegisterRequest {
                requested_id: &requested_for_db,
                session_id: session_id.as_deref(),
                display_name: display_name.as_deref(),
                capabilities: capabilities.as_deref(),
            },
            heartbeat_ttl,
            Utc::now(),
        )?;
        Ok((record.view(heartbeat_ttl, Utc::now()), outcome))
    })
    .await?;

    audit(
        &state,
        rest_actor(&principal, &ip),
        AuditAction::AgentRegistered,
        view.id.clone(),
        AuditOutcome::Success,
        json!({ "outcome": outcome, "source": "rest" }),
    )
    .await;

    let mut value = serde_json::to_value(view).map_err(CoordError::from)?;
    value["outcome"] = serde_json::to_value(outcome).map_err(CoordError::from)?;
    Ok(Json(value).into_response())
}

fn require_identity(identity: &IdentityContext) -> Result<String, ApiError> {
    identity.agent_id.clone().ok_or_else(|| {
        ApiError(
            CoordError::invalid_request(
                "agent_id",
                "missing identity headers",
            )
            .with_suggestion("Supply X-Machine-Name and X-Project-Name headers."),
        )
    })
}

/// Handler for `GET /agent/api/pending`.
///
/// Non-destructive peek at the inbox; nothing is consumed.
pub async fn pending_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<IdentityContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent_id = require_identity(&identity)?;
    enforce(&state, "rest_pending", &agent_id).await?;

    let message_ttl = state.settings.message_ttl_secs;
    let messages = with_conn(&state.pool, move |conn| {
        switchboard_messaging::inbox_snapshot(conn, &agent_id, message_ttl, Utc::now())
    })
    .await?;

    Ok(Json(json!({
        "count": messages.len(),
        "messages": messages,
    })))
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub timeout: Option<u64>,
}

/// Handler for `GET /agent/api/wait`.
///
/// Long-poll for an external watcher monitoring an offline agent's inbox.
/// Deliberately never updates the heartbeat: the watcher is not the agent,
/// and the agent should keep reading as offline while only the watcher is
/// alive. Agents themselves use the RPC `wait_for_message` tool, which does
/// heartbeat.
pub async fn wait_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<IdentityContext>,
    Query(query): Query<WaitQuery>,
) -> Result<Response, ApiError> {
    let agent_id = require_identity(&identity)?;
    enforce(&state, "rest_wait", &agent_id).await?;

    let timeout = query.timeout.unwrap_or(30);
    if !(MIN_WAIT_SECS..=MAX_WAIT_SECS).contains(&timeout) {
        return Err(ApiError(CoordError::invalid_request(
            "timeout",
            &format!("must be between {MIN_WAIT_SECS} and {MAX_WAIT_SECS} seconds"),
        )));
    }

    let waited = wait_for_messages(
        &state.pool,
        &state.hub,
        &agent_id,
        timeout,
        state.settings.message_ttl_secs,
        WaitOptions {
            heartbeat: false,
            reply_to: None,
        },
    )
    .await?;

    let response = match waited {
        Waited::Received(messages) => Json(json!({
            "count": messages.len(),
            "messages": messages,
            "status": "received",
        }))
        .into_response(),
        Waited::TimedOut => Json(json!({ "count": 0, "status": "timeout" })).into_response(),
        Waited::Shutdown => (
            [("Retry-After", "15")],
            Json(json!({ "count": 0, "status": "retry" })),
        )
            .into_response(),
    };
    Ok(response)
}

/// Handler for `POST /agent/api/unregister`.
///
/// `?keep=true` retains the record offline for the watcher pattern; a
/// non-empty inbox retains it regardless so queued messages survive until
/// the agent re-registers.
pub async fn unregister_handler(req: Request<Body>) -> Result<Json<serde_json::Value>, ApiError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .cloned()
        .ok_or_else(|| ApiError(CoordError::store_unavailable("application state missing")))?;
    let principal = req
        .extensions()
        .get::<AuthContext>()
        .map(|c| c.0.clone())
        .unwrap_or(Principal::Anonymous);
    let identity = req
        .extensions()
        .get::<IdentityContext>()
        .cloned()
        .unwrap_or_default();
    let ip = client_ip(&req, state.settings.behind_proxy);

    let agent_id = require_identity(&identity)?;
    principal.require_scope(&agent_id)?;
    let rate_identity = if matches!(principal, Principal::Anonymous) {
        ip.clone()
    } else {
        agent_id.clone()
    };
    enforce(&state, "rest_unregister", &rate_identity).await?;

    let keep = req
        .uri()
        .query()
        .map(|q| {
            q.split('&')
                .any(|pair| matches!(pair, "keep=true" | "keep=1" | "keep=yes"))
        })
        .unwrap_or(false);

    let unregister_id = agent_id.clone();
    let disposition = with_conn(&state.pool, move |conn| {
        switchboard_registry::unregister(conn, &unregister_id, keep)
    })
    .await?;

    if disposition == UnregisterDisposition::Removed {
        state.hub.forget(&agent_id);
    }

    audit(
        &state,
        rest_actor(&principal, &ip),
        AuditAction::AgentUnregistered,
        agent_id.clone(),
        AuditOutcome::Success,
        json!({ "kept": disposition == UnregisterDisposition::Retained }),
    )
    .await;

    let body = match disposition {
        UnregisterDisposition::Removed => json!({
            "status": "ok",
            "message": format!("Agent '{agent_id}' unregistered"),
            "kept": false,
        }),
        UnregisterDisposition::Retained => json!({
            "status": "ok",
            "message": format!("Agent '{agent_id}' marked offline and kept in registry"),
            "kept": true,
        }),
        UnregisterDisposition::NotFound => json!({
            "status": "ok",
            "message": format!("Agent '{agent_id}' was not registered"),
            "kept": false,
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub machine_name: Option<String>,
}

/// Handler for `GET /agent/api/validate`.
///
/// Credential preflight for launchers: confirms the token and, given a
/// machine name, probes it against the key's agent pattern before any
/// session starts.
pub async fn validate_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(principal)): Extension<AuthContext>,
    Query(query): Query<ValidateQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (key_id, pattern) = match &principal {
        Principal::Agent { key_id, pattern } => (key_id.clone(), pattern.clone()),
        Principal::Admin => ("admin".to_string(), "*".to_string()),
        Principal::Proxy => ("proxy".to_string(), "*".to_string()),
        Principal::Anonymous => ("anonymous".to_string(), "*".to_string()),
    };
    enforce(&state, "rest_validate", &key_id).await?;

    if let Some(machine_name) = query.machine_name.as_deref().map(str::trim) {
        if !machine_name.is_empty() {
            let probe = format!("{machine_name}/probe");
            principal.require_scope(&probe)?;
        }
    }

    Ok(Json(json!({
        "valid": true,
        "key_id": key_id,
        "agent_pattern": pattern,
    })))
}
