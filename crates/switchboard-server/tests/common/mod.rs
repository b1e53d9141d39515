//! Shared harness for driving the router in-process.
#![allow(dead_code)]

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use switchboard_auth::AuthConfig;
use switchboard_db::DbPool;
use switchboard_messaging::NotifyHub;
use switchboard_server::{app, AppState, RuntimeSettings};
use tower::ServiceExt;

pub struct TestServer {
    pub app: Router,
    pub pool: DbPool,
    pub hub: NotifyHub,
    _dir: tempfile::TempDir,
}

pub fn server_with_auth(auth: AuthConfig) -> TestServer {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("switchboard.db");
    let pool = switchboard_db::open_pool(path.to_str().unwrap()).expect("store should open");
    {
        let conn = pool.get().unwrap();
        switchboard_db::run_migrations(&conn).unwrap();
    }

    let hub = NotifyHub::new();
    let state = AppState {
        pool: pool.clone(),
        hub: hub.clone(),
        auth,
        settings: RuntimeSettings {
            heartbeat_ttl_secs: 900,
            message_ttl_secs: 24 * 3_600,
            behind_proxy: false,
        },
    };

    TestServer {
        app: app(state),
        pool,
        hub,
        _dir: dir,
    }
}

/// A server in dev mode: no secrets, auth disabled.
pub fn dev_server() -> TestServer {
    server_with_auth(AuthConfig::default())
}

pub fn request(method: &str, uri: &str, headers: &[(&str, &str)], body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string())),
        None => builder.body(Body::empty()),
    };
    let mut request = request.expect("request should build");
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40_000);
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

/// An RPC tool call against `/agent/mcp` with the given identity headers.
pub fn rpc(tool: &str, args: Value, headers: &[(&str, &str)]) -> Request<Body> {
    request(
        "POST",
        "/agent/mcp",
        headers,
        Some(serde_json::json!({ "tool": tool, "args": args })),
    )
}

pub async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should complete");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body should be JSON")
    };
    (status, value)
}

/// Identity headers for an agent session.
pub fn agent_headers<'a>(machine: &'a str, project: &'a str, session: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        ("x-machine-name", machine),
        ("x-project-name", project),
        ("x-session-id", session),
    ]
}
