//! Background scavenger for expired state.
//!
//! One periodic task sweeps everything with a TTL: expired inbox rows,
//! stranded notify tokens, aged rate-limit rows, and offline agent records
//! whose inboxes have drained. Registry races (a heartbeat in flight while
//! an unregister deletes the record) can leave zombies; this sweep is what
//! cleans them up.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::rate_limit;
use crate::AppState;

const EXPIRY_BATCH: usize = 5_000;

/// Starts the scavenger. Runs indefinitely.
pub async fn start_scavenger(state: Arc<AppState>, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::warn!("scavenger disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_secs);
    tracing::info!(interval_secs, "starting scavenger task");

    loop {
        sleep(interval).await;

        let pool = state.pool.clone();
        let message_ttl = state.settings.message_ttl_secs;
        let result = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let now = Utc::now();

            let mut expired_messages = 0usize;
            loop {
                let deleted =
                    switchboard_messaging::delete_expired(&conn, message_ttl, now, EXPIRY_BATCH)?;
                expired_messages += deleted;
                if deleted < EXPIRY_BATCH {
                    break;
                }
            }

            let stale_tokens = switchboard_messaging::delete_stale_tokens(&conn, message_ttl, now)?;
            let rate_rows = rate_limit::prune_all(&conn, now)?;
            let expired_agents = switchboard_registry::scavenge_expired(&conn, message_ttl, now)?;

            Ok::<_, switchboard_types::CoordError>((
                expired_messages,
                stale_tokens,
                rate_rows,
                expired_agents,
            ))
        })
        .await;

        match result {
            Ok(Ok((messages, tokens, rate_rows, agents))) => {
                if messages + tokens + rate_rows + agents > 0 {
                    tracing::info!(
                        expired_messages = messages,
                        stale_tokens = tokens,
                        rate_rows,
                        expired_agents = agents,
                        "scavenger sweep complete"
                    );
                } else {
                    tracing::debug!("scavenger sweep found nothing to do");
                }
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "scavenger sweep failed");
            }
            Err(e) => {
                tracing::error!(error = %e, "scavenger task panicked or was cancelled");
            }
        }
    }
}
