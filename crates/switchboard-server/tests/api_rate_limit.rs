mod common;

use axum::http::StatusCode;
use common::{agent_headers, call, dev_server, request, rpc, server_with_auth};
use serde_json::json;
use switchboard_auth::AuthConfig;

#[tokio::test]
async fn eleventh_send_in_the_window_is_limited() {
    let server = dev_server();
    let a = agent_headers("lab", "alpha", "sa");
    let b = agent_headers("lab", "beta", "sb");
    call(&server.app, rpc("register_agent", json!({}), &a)).await;
    call(&server.app, rpc("register_agent", json!({}), &b)).await;

    for i in 1..=10 {
        let (status, body) = call(
            &server.app,
            rpc(
                "send_message",
                json!({ "target": "lab/beta", "message": format!("burst {i}") }),
                &a,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "send {i} should pass: {body}");
    }

    let (status, body) = call(
        &server.app,
        rpc(
            "send_message",
            json!({ "target": "lab/beta", "message": "one too many" }),
            &a,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");

    // Once the window rows age out, sending works again.
    {
        let conn = server.pool.get().unwrap();
        conn.execute("DELETE FROM rate_events", []).unwrap();
    }
    let (status, _) = call(
        &server.app,
        rpc(
            "send_message",
            json!({ "target": "lab/beta", "message": "fresh window" }),
            &a,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn rate_limits_key_on_the_sender_identity() {
    let server = dev_server();
    let a = agent_headers("lab", "alpha", "sa");
    let b = agent_headers("lab", "beta", "sb");
    let c = agent_headers("lab", "gamma", "sc");
    call(&server.app, rpc("register_agent", json!({}), &a)).await;
    call(&server.app, rpc("register_agent", json!({}), &b)).await;
    call(&server.app, rpc("register_agent", json!({}), &c)).await;

    for _ in 0..10 {
        call(
            &server.app,
            rpc(
                "send_message",
                json!({ "target": "lab/beta", "message": "from alpha" }),
                &a,
            ),
        )
        .await;
    }
    let (status, _) = call(
        &server.app,
        rpc(
            "send_message",
            json!({ "target": "lab/beta", "message": "blocked" }),
            &a,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // A different sender still goes through.
    let (status, _) = call(
        &server.app,
        rpc(
            "send_message",
            json!({ "target": "lab/beta", "message": "from gamma" }),
            &c,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn key_creation_is_rate_limited() {
    let server = server_with_auth(AuthConfig {
        server_secret: Some("perimeter".to_string()),
        admin_key: Some("root-key".to_string()),
        proxy_token: None,
    });
    let admin = [("authorization", "Bearer perimeter.root-key")];

    for i in 1..=5 {
        let (status, _) = call(
            &server.app,
            request(
                "POST",
                "/admin/api/keys",
                &admin,
                Some(json!({ "agent_pattern": "*", "description": format!("key {i}") })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "key {i} should be created");
    }

    let (status, body) = call(
        &server.app,
        request(
            "POST",
            "/admin/api/keys",
            &admin,
            Some(json!({ "agent_pattern": "*", "description": "sixth" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn authenticated_rest_registration_is_limited_per_agent_id() {
    let server = server_with_auth(AuthConfig {
        server_secret: Some("perimeter".to_string()),
        admin_key: Some("root-key".to_string()),
        proxy_token: None,
    });
    let (status, minted) = call(
        &server.app,
        request(
            "POST",
            "/admin/api/keys",
            &[("authorization", "Bearer perimeter.root-key")],
            Some(json!({ "agent_pattern": "lab/*" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let bearer = format!("Bearer {}", minted["api_key"].as_str().unwrap());

    // Five registrations exhaust lab/alpha's window.
    for i in 1..=5 {
        let mut headers = agent_headers("lab", "alpha", "s1");
        headers.push(("authorization", bearer.as_str()));
        let (status, body) = call(
            &server.app,
            request("POST", "/agent/api/register", &headers, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "register {i} should pass: {body}");
    }
    let mut headers = agent_headers("lab", "alpha", "s1");
    headers.push(("authorization", bearer.as_str()));
    let (status, body) = call(
        &server.app,
        request("POST", "/agent/api/register", &headers, None),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");

    // A different agent id behind the same source address still registers:
    // the window is keyed on the identity, not the caller's IP.
    let mut headers = agent_headers("lab", "beta", "s2");
    headers.push(("authorization", bearer.as_str()));
    let (status, body) = call(
        &server.app,
        request("POST", "/agent/api/register", &headers, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "other identity should pass: {body}");
}

#[tokio::test]
async fn authenticated_rest_unregister_records_against_the_agent_id() {
    let server = server_with_auth(AuthConfig {
        server_secret: Some("perimeter".to_string()),
        admin_key: Some("root-key".to_string()),
        proxy_token: None,
    });
    let (status, minted) = call(
        &server.app,
        request(
            "POST",
            "/admin/api/keys",
            &[("authorization", "Bearer perimeter.root-key")],
            Some(json!({ "agent_pattern": "lab/*" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let bearer = format!("Bearer {}", minted["api_key"].as_str().unwrap());

    let mut headers = agent_headers("lab", "alpha", "s1");
    headers.push(("authorization", bearer.as_str()));
    let (status, _) = call(
        &server.app,
        request("POST", "/agent/api/register", &headers, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        &server.app,
        request("POST", "/agent/api/unregister", &headers, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let conn = server.pool.get().unwrap();
    let identity: String = conn
        .query_row(
            "SELECT identity FROM rate_events WHERE operation = 'rest_unregister'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(identity, "lab/alpha");
}

#[tokio::test]
async fn rate_breaches_are_audited() {
    let server = dev_server();
    let a = agent_headers("lab", "alpha", "sa");
    let b = agent_headers("lab", "beta", "sb");
    call(&server.app, rpc("register_agent", json!({}), &a)).await;
    call(&server.app, rpc("register_agent", json!({}), &b)).await;

    for _ in 0..11 {
        call(
            &server.app,
            rpc(
                "send_message",
                json!({ "target": "lab/beta", "message": "spam" }),
                &a,
            ),
        )
        .await;
    }

    let (status, body) = call(
        &server.app,
        request("GET", "/admin/api/audit?action=rate_limit_exceeded", &[], None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["count"].as_i64().unwrap() >= 1);
    assert!(body["entries"][0]["resource"]
        .as_str()
        .unwrap()
        .starts_with("send_message:"));
}
