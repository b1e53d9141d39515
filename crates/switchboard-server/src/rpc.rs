//! The RPC tool surface, mounted at `/agent/mcp` and `/oauth/mcp`.
//!
//! Calls arrive as `{"tool": "...", "args": {...}}` and deserialize into a
//! typed enum; there is no dynamic dispatch by name. Handlers resolve the
//! calling agent identity (explicit `agent_id` argument first, then the
//! identity middleware's derivation), enforce the principal's scope and the
//! per-operation rate limit, and return structured JSON. Wait timeouts come
//! back as 200 responses with `status: "timeout"` so callers can tell
//! absence of work from infrastructure failure.

use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use switchboard_auth::Principal;
use switchboard_messaging::{
    send, wait_for_messages, Outgoing, SendInput, WaitOptions, Waited,
};
use switchboard_observe::{Actor, ActorKind, AuditAction, AuditOutcome};
use switchboard_registry::RegisterRequest;
use switchboard_types::{
    validate_agent_id, AgentStatus, CoordError, ErrorKind, DEFAULT_WAIT_SECS, MAX_WAIT_SECS,
    MIN_WAIT_SECS,
};

use crate::api::{with_conn, ApiError};
use crate::middleware::{audit, AuthContext, IdentityContext};
use crate::rate_limit::enforce;
use crate::AppState;

/// The tool vocabulary. Payloads are per-tool tagged variants.
#[derive(Debug, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolCall {
    Ping {},
    ListAgents {
        agent_id: Option<String>,
    },
    RegisterAgent {
        name: Option<String>,
        capabilities: Option<Vec<String>>,
        description: Option<String>,
        agent_id: Option<String>,
    },
    SetDescription {
        description: String,
        agent_id: Option<String>,
    },
    SendMessage {
        target: String,
        message: String,
        context: Option<String>,
        #[serde(default)]
        deliver_offline: bool,
        agent_id: Option<String>,
    },
    Reply {
        message_id: String,
        response: String,
        status: Option<String>,
        agent_id: Option<String>,
    },
    GetMessages {
        agent_id: Option<String>,
    },
    AckMessages {
        ids: Vec<String>,
        agent_id: Option<String>,
    },
    WaitForMessage {
        timeout: Option<u64>,
        reply_to: Option<String>,
        agent_id: Option<String>,
    },
}

fn parse_tool_call(mut body: Value) -> Result<ToolCall, CoordError> {
    // Tools without arguments may omit `args` entirely.
    if body.is_object() && body.get("args").is_none() {
        body["args"] = json!({});
    }
    serde_json::from_value(body)
        .map_err(|e| CoordError::invalid_request("tool", &format!("unrecognized call: {e}")))
}

/// Resolves the acting agent id for a tool call.
///
/// An explicit `agent_id` argument wins and is scope-checked; otherwise the
/// id derived by the identity middleware applies. Explicit resolution
/// touches the heartbeat, since the middleware only does so for
/// header-derived identities.
async fn resolve_agent_id(
    state: &Arc<AppState>,
    principal: &Principal,
    identity: &IdentityContext,
    explicit: Option<String>,
) -> Result<String, ApiError> {
    if let Some(explicit) = explicit.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        validate_agent_id(&explicit)?;
        if let Err(err) = principal.require_scope(&explicit) {
            let actor = rpc_actor(principal);
            audit(
                state,
                actor,
                AuditAction::ScopeDenied,
                explicit.clone(),
                AuditOutcome::Denied,
                json!({ "source": "rpc" }),
            )
            .await;
            return Err(ApiError(err));
        }
        let touch_id = explicit.clone();
        with_conn(&state.pool, move |conn| {
            switchboard_registry::touch_heartbeat(conn, &touch_id, Utc::now())
        })
        .await?;
        return Ok(explicit);
    }

    identity.agent_id.clone().ok_or_else(|| {
        ApiError(
            CoordError::invalid_request(
                "agent_id",
                "could not determine the calling agent id",
            )
            .with_suggestion(
                "Pass agent_id explicitly or supply X-Machine-Name and X-Project-Name headers.",
            ),
        )
    })
}

fn rpc_actor(principal: &Principal) -> Actor {
    match principal {
        Principal::Agent { key_id, .. } => Actor::new(ActorKind::Agent, key_id.clone()),
        Principal::Proxy => Actor::new(ActorKind::Proxy, "proxy"),
        Principal::Admin => Actor::new(ActorKind::Admin, "admin"),
        Principal::Anonymous => Actor::new(ActorKind::Anonymous, "anonymous"),
    }
}

fn validate_wait_timeout(timeout: Option<u64>) -> Result<u64, CoordError> {
    let timeout = timeout.unwrap_or(DEFAULT_WAIT_SECS);
    if !(MIN_WAIT_SECS..=MAX_WAIT_SECS).contains(&timeout) {
        return Err(CoordError::invalid_request(
            "timeout",
            &format!("must be between {MIN_WAIT_SECS} and {MAX_WAIT_SECS} seconds"),
        ));
    }
    Ok(timeout)
}

/// Handler for `POST /agent/mcp` and `POST /oauth/mcp`.
pub async fn rpc_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthContext(principal)): Extension<AuthContext>,
    Extension(identity): Extension<IdentityContext>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let call = parse_tool_call(body)?;
    let heartbeat_ttl = state.settings.heartbeat_ttl_secs;
    let message_ttl = state.settings.message_ttl_secs;

    match call {
        ToolCall::Ping {} => Ok(Json(json!({
            "ok": true,
            "timestamp": Utc::now().to_rfc3339(),
        }))),

        ToolCall::ListAgents { agent_id } => {
            let identity_key = match agent_id.as_deref().or(identity.agent_id.as_deref()) {
                Some(id) => id.to_string(),
                None => principal.kind().to_string(),
            };
            enforce(&state, "list_agents", &identity_key).await?;
            let views = with_conn(&state.pool, move |conn| {
                let now = Utc::now();
                Ok(switchboard_registry::list(conn)?
                    .iter()
                    .map(|a| a.view(heartbeat_ttl, now))
                    .collect::<Vec<_>>())
            })
            .await?;
            Ok(Json(serde_json::to_value(views).map_err(CoordError::from)?))
        }

        ToolCall::RegisterAgent {
            name,
            capabilities,
            description,
            agent_id,
        } => {
            let requested = resolve_agent_id(&state, &principal, &identity, agent_id).await?;
            let session_id = identity.session_id.clone();
            let registered = with_conn(&state.pool, move |conn| {
                let (record, outcome) = switchboard_registry::register(
                    conn,
                    &RegisterRequest {
                        requested_id: &requested,
                        session_id: session_id.as_deref(),
                        display_name: name.as_deref(),
                        capabilities: capabilities.as_deref(),
                    },
                    heartbeat_ttl,
                    Utc::now(),
                )?;
                let record = match description {
                    Some(ref description) => {
                        switchboard_registry::set_description(conn, &record.id, description)?
                    }
                    None => record,
                };
                Ok((record.view(heartbeat_ttl, Utc::now()), outcome))
            })
            .await?;

            let (view, outcome) = registered;
            audit(
                &state,
                rpc_actor(&principal),
                AuditAction::AgentRegistered,
                view.id.clone(),
                AuditOutcome::Success,
                json!({ "outcome": outcome, "source": "rpc" }),
            )
            .await;

            let mut value = serde_json::to_value(view).map_err(CoordError::from)?;
            value["outcome"] = serde_json::to_value(outcome).map_err(CoordError::from)?;
            Ok(Json(value))
        }

        ToolCall::SetDescription {
            description,
            agent_id,
        } => {
            let effective = resolve_agent_id(&state, &principal, &identity, agent_id).await?;
            with_conn(&state.pool, move |conn| {
                switchboard_registry::set_description(conn, &effective, &description)
            })
            .await?;
            Ok(Json(json!({ "ok": true })))
        }

        ToolCall::SendMessage {
            target,
            message,
            context,
            deliver_offline,
            agent_id,
        } => {
            let from = resolve_agent_id(&state, &principal, &identity, agent_id).await?;
            enforce(&state, "send_message", &from).await?;

            let hub = state.hub.clone();
            let from_for_send = from.clone();
            let receipt = with_conn(&state.pool, move |conn| {
                send(
                    conn,
                    &hub,
                    &SendInput {
                        from: &from_for_send,
                        body: &message,
                        context: context.as_deref(),
                        outgoing: Outgoing::Message { to: &target },
                        deliver_offline,
                    },
                    heartbeat_ttl,
                    Utc::now(),
                )
            })
            .await?;

            audit(
                &state,
                Actor::new(ActorKind::Agent, from),
                AuditAction::MessageSent,
                receipt.message.id.clone(),
                AuditOutcome::Success,
                json!({ "to": receipt.message.to_agent.clone() }),
            )
            .await;

            let mut value =
                serde_json::to_value(&receipt.message).map_err(CoordError::from)?;
            if receipt.recipient_status == AgentStatus::Offline {
                value["offline_delivery"] = json!(true);
                value["note"] = json!(format!(
                    "Agent '{}' is offline. Message queued for delivery when they reconnect.",
                    receipt.message.to_agent
                ));
            }
            Ok(Json(value))
        }

        ToolCall::Reply {
            message_id,
            response,
            status,
            agent_id,
        } => {
            let from = resolve_agent_id(&state, &principal, &identity, agent_id).await?;
            enforce(&state, "reply", &from).await?;

            let hub = state.hub.clone();
            let from_for_send = from.clone();
            let receipt = with_conn(&state.pool, move |conn| {
                send(
                    conn,
                    &hub,
                    &SendInput {
                        from: &from_for_send,
                        body: &response,
                        context: None,
                        outgoing: Outgoing::Reply {
                            reply_to: &message_id,
                            status: status.as_deref(),
                        },
                        deliver_offline: true,
                    },
                    heartbeat_ttl,
                    Utc::now(),
                )
            })
            .await?;

            audit(
                &state,
                Actor::new(ActorKind::Agent, from),
                AuditAction::MessageSent,
                receipt.message.id.clone(),
                AuditOutcome::Success,
                json!({ "to": receipt.message.to_agent.clone(), "reply": true }),
            )
            .await;

            Ok(Json(
                serde_json::to_value(&receipt.message).map_err(CoordError::from)?,
            ))
        }

        ToolCall::GetMessages { agent_id } => {
            let effective = resolve_agent_id(&state, &principal, &identity, agent_id).await?;
            enforce(&state, "get_messages", &effective).await?;
            let messages = with_conn(&state.pool, move |conn| {
                switchboard_messaging::inbox_snapshot(conn, &effective, message_ttl, Utc::now())
            })
            .await?;
            Ok(Json(
                serde_json::to_value(messages).map_err(CoordError::from)?,
            ))
        }

        ToolCall::AckMessages { ids, agent_id } => {
            let effective = resolve_agent_id(&state, &principal, &identity, agent_id).await?;
            enforce(&state, "ack_messages", &effective).await?;
            let recipient = effective.clone();
            let acked = with_conn(&state.pool, move |conn| {
                switchboard_messaging::ack(conn, &recipient, &ids)
            })
            .await?;
            audit(
                &state,
                Actor::new(ActorKind::Agent, effective),
                AuditAction::MessagesAcked,
                acked.to_string(),
                AuditOutcome::Success,
                json!({}),
            )
            .await;
            Ok(Json(json!({ "ok": true, "acked": acked })))
        }

        ToolCall::WaitForMessage {
            timeout,
            reply_to,
            agent_id,
        } => {
            let effective = resolve_agent_id(&state, &principal, &identity, agent_id).await?;
            enforce(&state, "wait_for_message", &effective).await?;
            let timeout = validate_wait_timeout(timeout)?;
            if let Some(ref reply_to) = reply_to {
                switchboard_types::parse_message_id(reply_to)?;
            }

            let started = Instant::now();
            let waited = wait_for_messages(
                &state.pool,
                &state.hub,
                &effective,
                timeout,
                message_ttl,
                WaitOptions {
                    heartbeat: true,
                    reply_to,
                },
            )
            .await?;
            let elapsed = started.elapsed().as_secs_f64();

            let body = match waited {
                Waited::Received(messages) => json!({
                    "status": "received",
                    "messages": messages,
                    "elapsed_seconds": (elapsed * 10.0).round() / 10.0,
                }),
                Waited::TimedOut => json!({
                    "status": "timeout",
                    "code": ErrorKind::Timeout.code(),
                    "message": format!("No messages received within {timeout} seconds"),
                    "suggestion": "No agents have sent messages. You can continue with other work.",
                    "elapsed_seconds": (elapsed * 10.0).round() / 10.0,
                }),
                Waited::Shutdown => json!({
                    "status": "retry",
                    "message": "Coordinator is restarting. Call wait_for_message again shortly.",
                    "retry_after": 15,
                }),
            };
            Ok(Json(body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_parsing_accepts_missing_args() {
        let call = parse_tool_call(json!({ "tool": "ping" })).unwrap();
        assert!(matches!(call, ToolCall::Ping {}));

        let call = parse_tool_call(json!({ "tool": "list_agents", "args": {} })).unwrap();
        assert!(matches!(call, ToolCall::ListAgents { agent_id: None }));
    }

    #[test]
    fn tool_parsing_rejects_unknown_tools() {
        let err = parse_tool_call(json!({ "tool": "fetch_everything" })).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn tool_parsing_reads_typed_payloads() {
        let call = parse_tool_call(json!({
            "tool": "send_message",
            "args": { "target": "lab/b", "message": "hi", "deliver_offline": true }
        }))
        .unwrap();
        match call {
            ToolCall::SendMessage {
                target,
                message,
                deliver_offline,
                ..
            } => {
                assert_eq!(target, "lab/b");
                assert_eq!(message, "hi");
                assert!(deliver_offline);
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[test]
    fn wait_timeout_bounds() {
        assert_eq!(validate_wait_timeout(None).unwrap(), 60);
        assert_eq!(validate_wait_timeout(Some(1)).unwrap(), 1);
        assert_eq!(validate_wait_timeout(Some(3600)).unwrap(), 3600);
        assert!(validate_wait_timeout(Some(0)).is_err());
        assert!(validate_wait_timeout(Some(3601)).is_err());
    }
}
