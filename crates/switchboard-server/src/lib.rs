//! Switchboard server library logic.
//!
//! The coordinator's HTTP surface: an RPC tool endpoint under `/agent/mcp`
//! and `/oauth/mcp`, a REST subset under `/agent/api/*` and `/admin/api/*`,
//! and the public health probe. Requests flow inbound through the auth
//! middleware (trust domain by path prefix), then the identity middleware
//! (canonical agent id from headers), then the handler, which applies the
//! per-operation rate limit before touching a component.

pub mod api;
pub mod api_admin;
pub mod api_agent;
pub mod background;
pub mod config;
pub mod middleware;
pub mod rate_limit;
pub mod rpc;

use axum::{
    routing::{delete, get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use switchboard_auth::AuthConfig;
use switchboard_db::DbPool;
use switchboard_messaging::NotifyHub;

use crate::api::{with_conn, ApiError};

/// Timing and proxy knobs shared across handlers.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Seconds of heartbeat silence before an agent reads as offline.
    pub heartbeat_ttl_secs: i64,
    /// Seconds a queued message survives without acknowledgment.
    pub message_ttl_secs: i64,
    /// Trust `X-Forwarded-For` / `X-Real-IP` for rate-limit identities.
    pub behind_proxy: bool,
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Per-agent wakeup channels for long-poll waits.
    pub hub: NotifyHub,
    /// Perimeter secrets.
    pub auth: AuthConfig,
    /// Timing and proxy knobs.
    pub settings: RuntimeSettings,
}

/// Health check handler.
///
/// Always public. Reports the count of currently online agents; a store
/// failure surfaces as 503, never a 4xx.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let heartbeat_ttl = state.settings.heartbeat_ttl_secs;
    let online = with_conn(&state.pool, move |conn| {
        switchboard_registry::count_online(conn, heartbeat_ttl, Utc::now())
    })
    .await?;
    Ok(Json(json!({
        "status": "ok",
        "agents_online": online,
    })))
}

/// Builds the application router with all routes and middleware.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/agent/mcp", post(rpc::rpc_handler))
        .route("/oauth/mcp", post(rpc::rpc_handler))
        .route("/agent/api/register", post(api_agent::register_handler))
        .route("/agent/api/pending", get(api_agent::pending_handler))
        .route("/agent/api/wait", get(api_agent::wait_handler))
        .route("/agent/api/unregister", post(api_agent::unregister_handler))
        .route("/agent/api/validate", get(api_agent::validate_handler))
        .route(
            "/admin/api/keys",
            post(api_admin::create_key_handler).get(api_admin::list_keys_handler),
        )
        .route(
            "/admin/api/keys/{keyId}",
            delete(api_admin::revoke_key_handler),
        )
        .route("/admin/api/audit", get(api_admin::audit_handler))
        .route(
            "/admin/api/agents",
            get(api_admin::list_agents_handler).delete(api_admin::remove_agents_handler),
        )
        .layer(axum::middleware::from_fn(middleware::identity_middleware))
        .layer(axum::middleware::from_fn(middleware::auth_middleware))
        .layer(Extension(Arc::new(state)))
}
