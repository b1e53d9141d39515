//! Synchronous store operations: send, snapshot, ack, expiry.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use switchboard_types::{
    compose_message_id, parse_message_id, validate_agent_id, AgentStatus, CoordError, Message,
    MessageKind, MessageStatus, MAX_PAYLOAD_BYTES,
};
use uuid::Uuid;

use crate::notify::NotifyHub;

/// Where an outgoing payload is headed.
#[derive(Debug, Clone, Copy)]
pub enum Outgoing<'a> {
    /// A fresh conversation, addressed explicitly.
    Message { to: &'a str },
    /// An answer to a prior message; the destination is the original
    /// sender, recovered from the id being replied to.
    Reply {
        reply_to: &'a str,
        status: Option<&'a str>,
    },
}

/// Inputs to a send call.
#[derive(Debug, Clone, Copy)]
pub struct SendInput<'a> {
    pub from: &'a str,
    pub body: &'a str,
    pub context: Option<&'a str>,
    pub outgoing: Outgoing<'a>,
    /// Queue for an unregistered recipient by creating an offline
    /// placeholder instead of failing with `AGENT_NOT_FOUND`.
    pub deliver_offline: bool,
}

/// A successful send: the stored message plus the recipient's liveness at
/// enqueue time, so the transport can annotate offline deliveries.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message: Message,
    pub recipient_status: AgentStatus,
}

fn validate_payload(field: &str, value: &str, required: bool) -> Result<(), CoordError> {
    if required && value.trim().is_empty() {
        return Err(CoordError::invalid_request(field, "cannot be empty"));
    }
    if value.len() > MAX_PAYLOAD_BYTES {
        return Err(CoordError::invalid_request(
            field,
            &format!("exceeds maximum length of {MAX_PAYLOAD_BYTES} bytes"),
        ));
    }
    Ok(())
}

/// Enqueues a message in the recipient's inbox and pushes one notify token.
///
/// For replies, only the original recipient of `reply_to` may answer, and
/// the reply lands in the original sender's inbox. The inbox row is written
/// before the token so a failed send never leaves a dangling wakeup.
pub fn send(
    conn: &Connection,
    hub: &NotifyHub,
    input: &SendInput<'_>,
    heartbeat_ttl_secs: i64,
    now: DateTime<Utc>,
) -> Result<SendReceipt, CoordError> {
    validate_payload("message", input.body, true)?;
    if let Some(context) = input.context {
        validate_payload("context", context, false)?;
    }

    let (to, kind, reply_to, reply_status) = match input.outgoing {
        Outgoing::Message { to } => {
            validate_agent_id(to)
                .map_err(|_| CoordError::invalid_request("target", "is not a valid agent id"))?;
            (to.to_string(), MessageKind::Message, None, None)
        }
        Outgoing::Reply { reply_to, status } => {
            let (original_sender, original_recipient, _) = parse_message_id(reply_to)?;
            if original_recipient != input.from {
                return Err(CoordError::invalid_request(
                    "message_id",
                    &format!(
                        "only the recipient '{original_recipient}' may reply to this message"
                    ),
                ));
            }
            (
                original_sender.to_string(),
                MessageKind::Reply,
                Some(reply_to.to_string()),
                Some(status.unwrap_or("success").to_string()),
            )
        }
    };

    let recipient = match switchboard_registry::get(conn, &to)? {
        Some(record) => record,
        None if input.deliver_offline => {
            let record = switchboard_registry::ensure_placeholder(conn, &to, now)?;
            tracing::info!(from = %input.from, to = %to, "offline placeholder created for delivery");
            record
        }
        None => {
            let available: Vec<String> = switchboard_registry::list(conn)?
                .into_iter()
                .map(|a| a.id)
                .collect();
            tracing::warn!(from = %input.from, to = %to, "send rejected, unknown recipient");
            return Err(CoordError::agent_not_found(&to, &available)
                .with_suggestion("List agents and retry, or pass deliver_offline to queue anyway."));
        }
    };

    let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();
    let message = Message {
        id: compose_message_id(input.from, &to, &suffix),
        from_agent: input.from.to_string(),
        to_agent: to.clone(),
        kind,
        message: input.body.to_string(),
        context: input.context.map(str::to_string),
        reply_to,
        reply_status,
        timestamp: now,
        status: MessageStatus::Pending,
    };

    conn.execute(
        "INSERT INTO inbox (id, from_agent, to_agent, kind, body, context, reply_to, reply_status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.id,
            message.from_agent,
            message.to_agent,
            message.kind.as_str(),
            message.message,
            message.context,
            message.reply_to,
            message.reply_status,
            now.to_rfc3339(),
        ],
    )?;
    conn.execute(
        "INSERT INTO notify_tokens (agent_id, created_at) VALUES (?1, ?2)",
        params![to, now.to_rfc3339()],
    )?;
    hub.signal(&to);

    tracing::info!(
        message_id = %message.id,
        from = %message.from_agent,
        to = %message.to_agent,
        kind = message.kind.as_str(),
        "message enqueued"
    );

    Ok(SendReceipt {
        recipient_status: recipient.status(heartbeat_ttl_secs, now),
        message,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(8)?;
    Ok(Message {
        id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        kind: if kind == "reply" {
            MessageKind::Reply
        } else {
            MessageKind::Message
        },
        message: row.get(4)?,
        context: row.get(5)?,
        reply_to: row.get(6)?,
        reply_status: row.get(7)?,
        timestamp: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        status: MessageStatus::Pending,
    })
}

/// Non-destructive snapshot of a recipient's inbox, oldest first.
///
/// Rows older than the message TTL are filtered out; the scavenger deletes
/// them for real.
pub fn inbox_snapshot(
    conn: &Connection,
    recipient: &str,
    message_ttl_secs: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Message>, CoordError> {
    let cutoff = (now - Duration::seconds(message_ttl_secs)).to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT id, from_agent, to_agent, kind, body, context, reply_to, reply_status, created_at
         FROM inbox
         WHERE to_agent = ?1 AND created_at > ?2
         ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![recipient, cutoff], row_to_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Whether any unacked messages are queued for the recipient.
pub fn has_pending(conn: &Connection, recipient: &str) -> Result<bool, CoordError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM inbox WHERE to_agent = ?1",
        params![recipient],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Acknowledges messages, removing them from the recipient's inbox.
///
/// All ids are format-validated before anything is deleted. Ids that are
/// valid but absent are silently tolerated, so retrying an ack is safe.
/// Returns how many rows were actually removed.
pub fn ack(conn: &Connection, recipient: &str, ids: &[String]) -> Result<usize, CoordError> {
    let invalid: Vec<&str> = ids
        .iter()
        .filter(|id| parse_message_id(id).is_err())
        .map(String::as_str)
        .collect();
    if !invalid.is_empty() {
        let shown: Vec<&str> = invalid.iter().take(5).copied().collect();
        return Err(CoordError::invalid_request(
            "message_ids",
            &format!(
                "contains {} invalid id(s): {}",
                invalid.len(),
                shown.join(", ")
            ),
        ));
    }

    let mut acked = 0;
    for id in ids {
        acked += conn.execute(
            "DELETE FROM inbox WHERE to_agent = ?1 AND id = ?2",
            params![recipient, id],
        )?;
    }
    tracing::info!(agent_id = %recipient, requested = ids.len(), acked, "messages acked");
    Ok(acked)
}

/// Consumes up to one notify token for the agent. Returns whether a token
/// existed.
pub(crate) fn consume_token(conn: &Connection, agent_id: &str) -> Result<bool, CoordError> {
    let changed = conn.execute(
        "DELETE FROM notify_tokens WHERE seq = (
            SELECT seq FROM notify_tokens WHERE agent_id = ?1 ORDER BY seq ASC LIMIT 1
         )",
        params![agent_id],
    )?;
    Ok(changed > 0)
}

/// Deletes a batch of expired inbox rows. Returns the number removed;
/// callers loop while a full batch keeps coming back.
pub fn delete_expired(
    conn: &Connection,
    message_ttl_secs: i64,
    now: DateTime<Utc>,
    batch: usize,
) -> Result<usize, CoordError> {
    let cutoff = (now - Duration::seconds(message_ttl_secs)).to_rfc3339();
    let deleted = conn.execute(
        "DELETE FROM inbox WHERE seq IN (
            SELECT seq FROM inbox WHERE created_at <= ?1 ORDER BY seq ASC LIMIT ?2
         )",
        params![cutoff, batch as i64],
    )?;
    Ok(deleted)
}

/// Deletes notify tokens older than the message TTL. Tokens normally die
/// with their waiter; this catches the ones stranded by acks and crashes.
pub fn delete_stale_tokens(
    conn: &Connection,
    message_ttl_secs: i64,
    now: DateTime<Utc>,
) -> Result<usize, CoordError> {
    let cutoff = (now - Duration::seconds(message_ttl_secs)).to_rfc3339();
    let deleted = conn.execute(
        "DELETE FROM notify_tokens WHERE created_at <= ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
