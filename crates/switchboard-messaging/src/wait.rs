//! Long-poll blocking waits.
//!
//! A waiter parks on the recipient's in-process notify channel and consumes
//! CPU only when handling a signal. The inbox is re-read on every wakeup;
//! an empty snapshot after a wakeup means the message was acked in flight,
//! and the waiter parks again rather than returning early. Each wait call
//! consumes at most one durable notify token.

use chrono::Utc;
use std::time::{Duration, Instant};
use switchboard_db::DbPool;
use switchboard_types::{CoordError, Message, MessageKind};

use crate::engine::{consume_token, inbox_snapshot};
use crate::notify::NotifyHub;

/// Waiters re-check the deadline (and optionally heartbeat) at least this
/// often while parked.
const PARK_SLICE: Duration = Duration::from_secs(30);

/// Knobs for a single wait call.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Touch the agent's heartbeat on every park slice. The RPC surface
    /// sets this; the REST watcher surface never does, because the watcher
    /// is not the agent.
    pub heartbeat: bool,
    /// Return only when a reply correlating to this message id is pending.
    pub reply_to: Option<String>,
}

/// The outcome of a wait.
#[derive(Debug)]
pub enum Waited {
    /// Messages are pending; nothing has been acknowledged.
    Received(Vec<Message>),
    /// The deadline passed with nothing to deliver.
    TimedOut,
    /// The coordinator is shutting down; the caller should retry shortly.
    Shutdown,
}

fn select_pending(
    snapshot: Vec<Message>,
    reply_to: Option<&str>,
) -> Vec<Message> {
    match reply_to {
        None => snapshot,
        Some(target) => snapshot
            .into_iter()
            .filter(|m| m.kind == MessageKind::Reply && m.reply_to.as_deref() == Some(target))
            .collect(),
    }
}

/// Blocks until the recipient has pending messages (or a matching reply),
/// the timeout elapses, or shutdown is requested.
///
/// The returned messages stay queued; callers acknowledge explicitly.
pub async fn wait_for_messages(
    pool: &DbPool,
    hub: &NotifyHub,
    agent_id: &str,
    timeout_secs: u64,
    message_ttl_secs: i64,
    opts: WaitOptions,
) -> Result<Waited, CoordError> {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let notify = hub.handle(agent_id);
    let mut token_spent = false;

    loop {
        if hub.is_shutdown() {
            return Ok(Waited::Shutdown);
        }

        let pending = {
            let pool = pool.clone();
            let agent_id = agent_id.to_string();
            let reply_to = opts.reply_to.clone();
            let spend_token = !token_spent;
            tokio::task::spawn_blocking(move || -> Result<Vec<Message>, CoordError> {
                let conn = pool.get()?;
                let snapshot = inbox_snapshot(&conn, &agent_id, message_ttl_secs, Utc::now())?;
                let pending = select_pending(snapshot, reply_to.as_deref());
                if !pending.is_empty() && spend_token {
                    consume_token(&conn, &agent_id)?;
                }
                Ok(pending)
            })
            .await
            .map_err(|e| CoordError::store_unavailable(format!("wait task failed: {e}")))??
        };

        if !pending.is_empty() {
            tracing::info!(agent_id = %agent_id, count = pending.len(), "wait satisfied");
            return Ok(Waited::Received(pending));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::info!(agent_id = %agent_id, timeout_secs, "wait timed out");
            return Ok(Waited::TimedOut);
        }

        let slice = remaining.min(PARK_SLICE);
        let woken = tokio::select! {
            _ = notify.notified() => true,
            _ = hub.shutdown_signal() => {
                return Ok(Waited::Shutdown);
            }
            _ = tokio::time::sleep(slice) => false,
        };

        // A wakeup whose snapshot turns out empty still consumed the event
        // that produced it; burn the matching token so the durable queue
        // does not accumulate ghosts.
        if woken && !token_spent {
            let pool = pool.clone();
            let agent_id_owned = agent_id.to_string();
            let consumed = tokio::task::spawn_blocking(move || {
                let conn = pool.get()?;
                consume_token(&conn, &agent_id_owned)
            })
            .await
            .map_err(|e| CoordError::store_unavailable(format!("wait task failed: {e}")))??;
            token_spent = consumed;
        }

        if opts.heartbeat {
            let pool = pool.clone();
            let agent_id_owned = agent_id.to_string();
            let result = tokio::task::spawn_blocking(move || {
                let conn = pool.get()?;
                switchboard_registry::touch_heartbeat(&conn, &agent_id_owned, Utc::now())
            })
            .await;
            // A failed heartbeat never breaks the wait.
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(agent_id = %agent_id, error = %err, "heartbeat during wait failed");
                }
                Err(err) => {
                    tracing::warn!(agent_id = %agent_id, error = %err, "heartbeat task failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ack, send, Outgoing, SendInput};
    use chrono::Utc;
    use switchboard_registry::RegisterRequest;
    use switchboard_types::DEFAULT_MESSAGE_TTL_SECS;

    const TTL: i64 = 900;

    fn setup() -> (DbPool, NotifyHub, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wait.db");
        let pool = switchboard_db::open_pool(path.to_str().unwrap()).unwrap();
        {
            let conn = pool.get().unwrap();
            switchboard_db::run_migrations(&conn).unwrap();
        }
        (pool, NotifyHub::new(), dir)
    }

    fn register(pool: &DbPool, id: &str) {
        let conn = pool.get().unwrap();
        switchboard_registry::register(
            &conn,
            &RegisterRequest {
                requested_id: id,
                session_id: Some("s"),
                ..Default::default()
            },
            TTL,
            Utc::now(),
        )
        .unwrap();
    }

    fn send_plain(pool: &DbPool, hub: &NotifyHub, from: &str, to: &str, body: &str) -> String {
        let conn = pool.get().unwrap();
        send(
            &conn,
            hub,
            &SendInput {
                from,
                body,
                context: None,
                outgoing: Outgoing::Message { to },
                deliver_offline: false,
            },
            TTL,
            Utc::now(),
        )
        .unwrap()
        .message
        .id
    }

    #[tokio::test]
    async fn pending_messages_return_immediately() {
        let (pool, hub, _dir) = setup();
        register(&pool, "lab/a");
        register(&pool, "lab/b");
        send_plain(&pool, &hub, "lab/a", "lab/b", "already here");

        let start = Instant::now();
        let waited = wait_for_messages(
            &pool,
            &hub,
            "lab/b",
            30,
            DEFAULT_MESSAGE_TTL_SECS,
            WaitOptions::default(),
        )
        .await
        .unwrap();

        match waited {
            Waited::Received(messages) => assert_eq!(messages.len(), 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(5));

        // The immediate return consumed the send's token.
        let conn = pool.get().unwrap();
        let tokens: i64 = conn
            .query_row("SELECT COUNT(*) FROM notify_tokens", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tokens, 0);
    }

    #[tokio::test]
    async fn empty_inbox_times_out_with_structured_result() {
        let (pool, hub, _dir) = setup();
        register(&pool, "lab/b");

        let start = Instant::now();
        let waited = wait_for_messages(
            &pool,
            &hub,
            "lab/b",
            1,
            DEFAULT_MESSAGE_TTL_SECS,
            WaitOptions::default(),
        )
        .await
        .unwrap();

        assert!(matches!(waited, Waited::TimedOut));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(4), "timeout + epsilon bound");
    }

    #[tokio::test]
    async fn concurrent_send_wakes_a_parked_waiter() {
        let (pool, hub, _dir) = setup();
        register(&pool, "lab/a");
        register(&pool, "lab/b");

        let waiter_pool = pool.clone();
        let waiter_hub = hub.clone();
        let waiter = tokio::spawn(async move {
            wait_for_messages(
                &waiter_pool,
                &waiter_hub,
                "lab/b",
                30,
                DEFAULT_MESSAGE_TTL_SECS,
                WaitOptions::default(),
            )
            .await
            .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        send_plain(&pool, &hub, "lab/a", "lab/b", "wake up");

        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
        match waited {
            Waited::Received(messages) => assert_eq!(messages[0].message, "wake up"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_correlation_ignores_unrelated_traffic() {
        let (pool, hub, _dir) = setup();
        register(&pool, "lab/a");
        register(&pool, "lab/b");
        let original = send_plain(&pool, &hub, "lab/a", "lab/b", "question");

        // Unrelated plain message for lab/a must not satisfy the wait.
        send_plain(&pool, &hub, "lab/b", "lab/a", "noise");

        let waiter_pool = pool.clone();
        let waiter_hub = hub.clone();
        let wanted = original.clone();
        let waiter = tokio::spawn(async move {
            wait_for_messages(
                &waiter_pool,
                &waiter_hub,
                "lab/a",
                30,
                DEFAULT_MESSAGE_TTL_SECS,
                WaitOptions {
                    heartbeat: false,
                    reply_to: Some(wanted),
                },
            )
            .await
            .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            let conn = pool.get().unwrap();
            send(
                &conn,
                &hub,
                &SendInput {
                    from: "lab/b",
                    body: "4",
                    context: None,
                    outgoing: Outgoing::Reply {
                        reply_to: &original,
                        status: None,
                    },
                    deliver_offline: false,
                },
                TTL,
                Utc::now(),
            )
            .unwrap();
        }

        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("reply should wake the correlated waiter")
            .unwrap();
        match waited {
            Waited::Received(messages) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message, "4");
                assert_eq!(messages[0].reply_to.as_deref(), Some(original.as_str()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_between_signal_and_read_is_a_spurious_wake() {
        let (pool, hub, _dir) = setup();
        register(&pool, "lab/a");
        register(&pool, "lab/b");

        // Queue and immediately ack, leaving a banked signal with an empty
        // inbox. The waiter must ride through it and time out.
        let id = send_plain(&pool, &hub, "lab/a", "lab/b", "gone");
        {
            let conn = pool.get().unwrap();
            ack(&conn, "lab/b", &[id]).unwrap();
        }

        let waited = wait_for_messages(
            &pool,
            &hub,
            "lab/b",
            1,
            DEFAULT_MESSAGE_TTL_SECS,
            WaitOptions::default(),
        )
        .await
        .unwrap();
        assert!(matches!(waited, Waited::TimedOut));
    }

    #[tokio::test]
    async fn shutdown_interrupts_parked_waiters() {
        let (pool, hub, _dir) = setup();
        register(&pool, "lab/b");

        let waiter_pool = pool.clone();
        let waiter_hub = hub.clone();
        let waiter = tokio::spawn(async move {
            wait_for_messages(
                &waiter_pool,
                &waiter_hub,
                "lab/b",
                30,
                DEFAULT_MESSAGE_TTL_SECS,
                WaitOptions::default(),
            )
            .await
            .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        hub.shutdown_all();

        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("shutdown should wake the waiter")
            .unwrap();
        assert!(matches!(waited, Waited::Shutdown));
    }
}
