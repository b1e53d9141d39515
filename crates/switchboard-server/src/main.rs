//! Switchboard coordinator binary.
//!
//! Starts the axum HTTP server with structured logging, store
//! initialization, the background scavenger, and graceful shutdown on
//! SIGTERM/SIGINT. Shutdown wakes every parked long-poll waiter so clients
//! get a structured retry response instead of a severed connection.

use std::net::SocketAddr;
use std::sync::Arc;
use switchboard_auth::AuthConfig;
use switchboard_messaging::NotifyHub;
use switchboard_server::{app, background, config, AppState, RuntimeSettings};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("SWITCHBOARD_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("switchboard.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let auth = AuthConfig {
        server_secret: config.auth.server_secret.clone(),
        admin_key: config.auth.admin_key.clone(),
        proxy_token: config.auth.proxy_token.clone(),
    };
    if auth.dev_mode() {
        tracing::warn!(
            "no auth secrets configured (SERVER_SECRET, ADMIN_KEY, PROXY_BEARER_TOKEN); \
             authentication is DISABLED. Anyone with network access can use this coordinator"
        );
    } else {
        tracing::info!(
            server_secret = config.auth.server_secret.is_some(),
            admin_key = config.auth.admin_key.is_some(),
            proxy_token = config.auth.proxy_token.is_some(),
            "auth configured"
        );
        if config.auth.admin_key.is_some() && config.auth.server_secret.is_none() {
            tracing::warn!(
                "ADMIN_KEY is set without SERVER_SECRET; only the legacy bare admin \
                 token format will authenticate"
            );
        }
    }

    let pool = switchboard_db::open_pool(&config.store.path)
        .expect("failed to open the store — check store.path / STORE_URL");
    {
        let conn = pool
            .get()
            .expect("failed to get store connection for migrations");
        let applied =
            switchboard_db::run_migrations(&conn).expect("failed to run store migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied store migrations");
        }
    }

    let state = AppState {
        pool,
        hub: NotifyHub::new(),
        auth,
        settings: RuntimeSettings {
            heartbeat_ttl_secs: config.lifecycle.heartbeat_ttl_secs,
            message_ttl_secs: config.lifecycle.message_ttl_secs,
            behind_proxy: config.server.behind_proxy,
        },
    };
    let hub = state.hub.clone();
    let scavenger_state = Arc::new(state.clone());

    tokio::spawn(background::start_scavenger(
        scavenger_state,
        config.lifecycle.scavenge_interval_secs,
    ));

    let app = app(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting switchboard coordinator");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .expect("server error");

    tracing::info!("switchboard coordinator shut down");
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, then wakes parked waiters so
/// in-flight long-polls drain with a retry status before the listener
/// closes.
async fn shutdown_signal(hub: NotifyHub) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }

    hub.shutdown_all();
}
