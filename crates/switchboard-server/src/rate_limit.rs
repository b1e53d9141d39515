//! Store-backed sliding-window rate limiting keyed by (operation, identity).
//!
//! Each recorded request is one timestamped row; a check prunes rows older
//! than the operation's window, counts the remainder, and records the new
//! request only when it is allowed. Store failure fails open with an audit
//! warning: a brief over-limit burst costs less than refusing all traffic.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::Arc;
use switchboard_observe::{Actor, AuditAction, AuditOutcome};
use switchboard_types::CoordError;

use crate::api::{with_conn, ApiError};
use crate::middleware::audit;
use crate::AppState;

/// Per-operation limit: `limit` requests per `window_secs` seconds.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub limit: i64,
    pub window_secs: i64,
}

/// The policy table. Operations not listed here get the generous default.
pub fn policy_for(operation: &str) -> RatePolicy {
    let (limit, window_secs) = match operation {
        "send_message" => (10, 60),
        "list_agents" => (30, 60),
        "rest_register" => (5, 60),
        "register_key" => (5, 60),
        _ => (60, 60),
    };
    RatePolicy { limit, window_secs }
}

/// Sliding-window check-and-record over the `rate_events` table.
///
/// Returns whether the request is allowed; allowed requests are recorded.
pub fn check_and_record(
    conn: &Connection,
    operation: &str,
    identity: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoordError> {
    let policy = policy_for(operation);
    let now_ts = now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1_000.0;
    let window_start = now_ts - policy.window_secs as f64;

    conn.execute(
        "DELETE FROM rate_events WHERE operation = ?1 AND identity = ?2 AND ts < ?3",
        params![operation, identity, window_start],
    )?;
    let current: i64 = conn.query_row(
        "SELECT COUNT(*) FROM rate_events WHERE operation = ?1 AND identity = ?2",
        params![operation, identity],
        |row| row.get(0),
    )?;

    if current >= policy.limit {
        tracing::warn!(
            operation,
            identity,
            count = current,
            limit = policy.limit,
            "rate limited"
        );
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO rate_events (operation, identity, ts) VALUES (?1, ?2, ?3)",
        params![operation, identity, now_ts],
    )?;
    Ok(true)
}

/// Handler-side enforcement with the fail-open policy.
///
/// A denial returns the structured `RATE_LIMITED` error and audits the
/// breach; a store failure logs, audits, and lets the request proceed.
pub async fn enforce(
    state: &Arc<AppState>,
    operation: &'static str,
    identity: &str,
) -> Result<(), ApiError> {
    let identity_owned = identity.to_string();
    let allowed = with_conn(&state.pool, move |conn| {
        check_and_record(conn, operation, &identity_owned, Utc::now())
    })
    .await;

    match allowed {
        Ok(true) => Ok(()),
        Ok(false) => {
            let policy = policy_for(operation);
            audit(
                state,
                Actor::system(),
                AuditAction::RateLimitExceeded,
                format!("{operation}:{identity}"),
                AuditOutcome::Denied,
                serde_json::json!({ "limit": policy.limit, "window_secs": policy.window_secs }),
            )
            .await;
            Err(ApiError(CoordError::rate_limited(
                identity,
                policy.limit,
                policy.window_secs,
            )))
        }
        Err(err) => {
            tracing::warn!(
                operation,
                identity,
                error = %err,
                "rate-limit store failure, failing open"
            );
            audit(
                state,
                Actor::system(),
                AuditAction::StoreError,
                format!("{operation}:{identity}"),
                AuditOutcome::Failure,
                serde_json::json!({ "context": "rate_limit", "error": err.message }),
            )
            .await;
            Ok(())
        }
    }
}

/// Prunes rate rows older than the widest window. Called by the scavenger.
pub fn prune_all(conn: &Connection, now: DateTime<Utc>) -> Result<usize, CoordError> {
    let cutoff = now.timestamp() as f64 - 3_600.0;
    let deleted = conn.execute("DELETE FROM rate_events WHERE ts < ?1", params![cutoff])?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        switchboard_db::run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn policy_table_defaults() {
        assert_eq!(policy_for("send_message").limit, 10);
        assert_eq!(policy_for("list_agents").limit, 30);
        assert_eq!(policy_for("rest_register").limit, 5);
        assert_eq!(policy_for("register_key").limit, 5);
        assert_eq!(policy_for("something_else").limit, 60);
    }

    #[test]
    fn denies_at_threshold_and_recovers_after_window() {
        let conn = conn();
        let now = Utc::now();

        for _ in 0..10 {
            assert!(check_and_record(&conn, "send_message", "lab/x", now).unwrap());
        }
        assert!(!check_and_record(&conn, "send_message", "lab/x", now).unwrap());

        // Once the window has passed, the pruned counter admits traffic again.
        let later = now + chrono::Duration::seconds(61);
        assert!(check_and_record(&conn, "send_message", "lab/x", later).unwrap());
    }

    #[test]
    fn identities_are_independent() {
        let conn = conn();
        let now = Utc::now();
        for _ in 0..10 {
            assert!(check_and_record(&conn, "send_message", "lab/x", now).unwrap());
        }
        assert!(!check_and_record(&conn, "send_message", "lab/x", now).unwrap());
        assert!(check_and_record(&conn, "send_message", "lab/y", now).unwrap());
    }

    #[test]
    fn operations_are_independent() {
        let conn = conn();
        let now = Utc::now();
        for _ in 0..10 {
            assert!(check_and_record(&conn, "send_message", "lab/x", now).unwrap());
        }
        assert!(!check_and_record(&conn, "send_message", "lab/x", now).unwrap());
        assert!(check_and_record(&conn, "list_agents", "lab/x", now).unwrap());
    }

    #[test]
    fn prune_clears_aged_rows() {
        let conn = conn();
        let now = Utc::now();
        check_and_record(&conn, "send_message", "lab/x", now).unwrap();
        let later = now + chrono::Duration::seconds(7_200);
        assert_eq!(prune_all(&conn, later).unwrap(), 1);
    }
}
