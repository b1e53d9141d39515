//! Authentication and identity middleware.
//!
//! The auth middleware maps the request path to a trust domain and
//! validates the bearer credential for it; the identity middleware derives
//! the canonical agent id from the identity headers, auto-registers and
//! heartbeats the calling agent, and attaches both results to request
//! extensions for the handlers.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use switchboard_auth::Principal;
use switchboard_observe::{record_event, Actor, ActorKind, AuditAction, AuditOutcome};
use switchboard_registry::RegisterRequest;
use switchboard_types::{validate_agent_id, CoordError};

use crate::api::{with_conn, ApiError};
use crate::AppState;

/// The authenticated principal, attached to every request.
#[derive(Clone, Debug)]
pub struct AuthContext(pub Principal);

/// The derived agent identity for `/agent/*` and `/oauth/*` requests.
#[derive(Clone, Debug, Default)]
pub struct IdentityContext {
    /// Canonical (possibly collision-suffixed) agent id, when the identity
    /// headers carried enough to compose one.
    pub agent_id: Option<String>,
    /// Opaque session marker from `X-Session-ID`.
    pub session_id: Option<String>,
}

fn header<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The client address used for anonymous rate-limit identities, honoring
/// proxy headers only when configured to sit behind one.
pub fn client_ip(req: &Request<Body>, behind_proxy: bool) -> String {
    if behind_proxy {
        if let Some(forwarded) = header(req, "x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                return first.trim().to_string();
            }
        }
        if let Some(real_ip) = header(req, "x-real-ip") {
            return real_ip.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn state_of(req: &Request<Body>) -> Result<Arc<AppState>, ApiError> {
    req.extensions()
        .get::<Arc<AppState>>()
        .cloned()
        .ok_or_else(|| {
            ApiError(CoordError::store_unavailable(
                "application state missing from request",
            ))
        })
}

fn audit_actor(principal: &Principal, fallback_id: &str) -> Actor {
    match principal {
        Principal::Agent { key_id, .. } => Actor::new(ActorKind::Agent, key_id.clone()),
        Principal::Proxy => Actor::new(ActorKind::Proxy, "proxy"),
        Principal::Admin => Actor::new(ActorKind::Admin, "admin"),
        Principal::Anonymous => Actor::new(ActorKind::Anonymous, fallback_id.to_string()),
    }
}

/// Best-effort audit write; never fails the request it describes.
pub(crate) async fn audit(
    state: &Arc<AppState>,
    actor: Actor,
    action: AuditAction,
    resource: String,
    outcome: AuditOutcome,
    detail: serde_json::Value,
) {
    let result = with_conn(&state.pool, move |conn| {
        record_event(conn, &actor, action, &resource, outcome, &detail)
            .map_err(|e| CoordError::store_unavailable(e))?;
        Ok(())
    })
    .await;
    if let Err(err) = result {
        tracing::warn!(error = %err, "audit write failed");
    }
}

/// Middleware validating bearer credentials by path prefix.
///
/// `/agent/*` takes the composite API-key token, `/oauth/*` the proxy
/// shared token, `/admin/*` the admin key; `/api/health` and unknown paths
/// pass through as anonymous. The resolved [`Principal`] lands in request
/// extensions as [`AuthContext`]. Auth failures are audited and rejected
/// before any component method runs.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let state = state_of(&req)?;
    let path = req.uri().path().to_string();
    let authorization = header(&req, "authorization").map(str::to_string);

    let domain = if path.starts_with("/agent") {
        Some("agent")
    } else if path.starts_with("/oauth") {
        Some("oauth")
    } else if path.starts_with("/admin") {
        Some("admin")
    } else {
        None
    };

    let attempt = match domain {
        None => Ok(Principal::Anonymous),
        Some("agent") => {
            let auth = state.auth.clone();
            let header_value = authorization.clone();
            with_conn(&state.pool, move |conn| {
                switchboard_auth::authenticate_agent(conn, &auth, header_value.as_deref())
            })
            .await
        }
        Some("oauth") => {
            switchboard_auth::authenticate_proxy(&state.auth, authorization.as_deref())
        }
        Some(_) => switchboard_auth::authenticate_admin(&state.auth, authorization.as_deref()),
    };

    match attempt {
        Ok(principal) => {
            if domain.is_some() && !state.auth.dev_mode() {
                let actor = audit_actor(&principal, &client_ip(&req, state.settings.behind_proxy));
                audit(
                    &state,
                    actor,
                    AuditAction::AuthSuccess,
                    path,
                    AuditOutcome::Success,
                    serde_json::json!({}),
                )
                .await;
            }
            req.extensions_mut().insert(AuthContext(principal));
            Ok(next.run(req).await)
        }
        Err(err) => {
            let ip = client_ip(&req, state.settings.behind_proxy);
            audit(
                &state,
                Actor::new(ActorKind::Anonymous, ip),
                AuditAction::AuthFailure,
                path,
                AuditOutcome::Denied,
                serde_json::json!({ "reason": err.message.clone() }),
            )
            .await;
            Err(ApiError(err))
        }
    }
}

/// Middleware deriving the canonical agent identity for `/agent/*` and
/// `/oauth/*` requests from `X-Machine-Name`, `X-Project-Name`, and
/// `X-Session-ID`.
///
/// A well-formed composite id is scope-checked against the principal and
/// auto-registered (which doubles as the heartbeat). Three paths only
/// derive without registering or heartbeating: the REST `wait` endpoint,
/// because the external watcher calling it is not the agent; the REST
/// `unregister` endpoint, where materializing a record just to delete it
/// would be wrong; and the REST `register` endpoint, whose handler performs
/// the one authoritative registration and reports its outcome.
pub async fn identity_middleware(mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let path = req.uri().path().to_string();
    if !path.starts_with("/agent") && !path.starts_with("/oauth") {
        return Ok(next.run(req).await);
    }

    let state = state_of(&req)?;
    let principal = req
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.0.clone())
        .unwrap_or(Principal::Anonymous);

    let machine = header(&req, "x-machine-name").map(str::to_string);
    let project = header(&req, "x-project-name").map(str::to_string);
    let session_id = header(&req, "x-session-id").map(str::to_string);

    let mut identity = IdentityContext {
        agent_id: None,
        session_id: session_id.clone(),
    };

    let composed = match (machine, project) {
        (Some(machine), Some(project)) => Some(format!("{machine}/{project}")),
        // A composite id may arrive whole in X-Machine-Name.
        (Some(machine), None) if machine.contains('/') => Some(machine),
        _ => None,
    };

    if let Some(agent_id) = composed {
        if validate_agent_id(&agent_id).is_err() {
            return Err(ApiError(CoordError::invalid_request(
                "agent_id",
                "identity headers do not form a valid machine/project id",
            )));
        }
        if let Err(err) = principal.require_scope(&agent_id) {
            let actor = audit_actor(&principal, "-");
            audit(
                &state,
                actor,
                AuditAction::ScopeDenied,
                agent_id.clone(),
                AuditOutcome::Denied,
                serde_json::json!({ "source": "identity_headers" }),
            )
            .await;
            return Err(ApiError(err));
        }

        let derive_only = path == "/agent/api/wait"
            || path == "/agent/api/unregister"
            || path == "/agent/api/register";
        if derive_only {
            identity.agent_id = Some(agent_id);
        } else {
            let heartbeat_ttl = state.settings.heartbeat_ttl_secs;
            let register_id = agent_id.clone();
            let register_session = session_id.clone();
            let (record, _) = with_conn(&state.pool, move |conn| {
                switchboard_registry::register(
                    conn,
                    &RegisterRequest {
                        requested_id: &register_id,
                        session_id: register_session.as_deref(),
                        ..Default::default()
                    },
                    heartbeat_ttl,
                    Utc::now(),
                )
            })
            .await?;
            identity.agent_id = Some(record.id);
        }
    }

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
