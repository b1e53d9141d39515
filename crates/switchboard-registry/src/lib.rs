//! Agent registry for the switchboard coordinator.
//!
//! Owns the set of known agents: identity allocation with collision
//! resolution, heartbeat-based liveness, and graceful or TTL-based
//! lifecycle. All operations are free functions over a
//! `rusqlite::Connection`; callers run them inside `spawn_blocking`.
//!
//! An agent record moves through `absent → live → offline → (live |
//! absent)`. The `live → offline` transition is derived from `last_seen`
//! aging past the heartbeat TTL, never written; the only stored offline
//! marker is the epoch rewind used by unregister-with-pending-messages.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use switchboard_types::{
    validate_agent_id, AgentRecord, AgentStatus, CoordError, RegisterOutcome, MAX_COLLISION_SUFFIX,
};

/// Inputs to a registration call.
#[derive(Debug, Clone, Default)]
pub struct RegisterRequest<'a> {
    pub requested_id: &'a str,
    /// Opaque client session marker; used only to arbitrate collisions.
    pub session_id: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub capabilities: Option<&'a [String]>,
}

/// How an unregister call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterDisposition {
    /// Record, inbox, and notify rows were all deleted.
    Removed,
    /// Record retained (pending messages or an explicit keep) and marked
    /// offline.
    Retained,
    /// No such agent.
    NotFound,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let capabilities_json: String = row.get(3)?;
    let registered_at: String = row.get(5)?;
    let last_seen: String = row.get(6)?;
    Ok(AgentRecord {
        id: row.get(0)?,
        display_name: row.get(1)?,
        description: row.get(2)?,
        capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
        session_id: row.get(4)?,
        registered_at: parse_instant(&registered_at),
        last_seen: parse_instant(&last_seen),
    })
}

fn parse_instant(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

const SELECT_COLUMNS: &str =
    "id, display_name, description, capabilities_json, session_id, registered_at, last_seen";

/// Fetches a single agent record without status derivation.
pub fn get(conn: &Connection, agent_id: &str) -> Result<Option<AgentRecord>, CoordError> {
    let record = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM agents WHERE id = ?1"),
            params![agent_id],
            |row| row_to_record(row),
        )
        .optional()?;
    Ok(record)
}

fn insert_record(conn: &Connection, record: &AgentRecord) -> Result<(), CoordError> {
    conn.execute(
        "INSERT OR REPLACE INTO agents
            (id, display_name, description, capabilities_json, session_id, registered_at, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id,
            record.display_name,
            record.description,
            serde_json::to_string(&record.capabilities)?,
            record.session_id,
            record.registered_at.to_rfc3339(),
            record.last_seen.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Registers an agent or refreshes an existing registration.
///
/// Resolution order for an existing record:
/// 1. matching session: reconnect, heartbeat only;
/// 2. no session supplied while the record is live: treated as the
///    existing session calling through a static client config;
/// 3. record offline: the caller takes the id over;
/// 4. live collision: probe `-2`, `-3`, and so on up to suffix 99; an
///    offline holder of a probed slot is also taken over.
///
/// The returned record's `id` is canonical and may differ from the
/// requested one.
pub fn register(
    conn: &Connection,
    req: &RegisterRequest<'_>,
    heartbeat_ttl_secs: i64,
    now: DateTime<Utc>,
) -> Result<(AgentRecord, RegisterOutcome), CoordError> {
    validate_agent_id(req.requested_id)?;

    if let Some(mut existing) = get(conn, req.requested_id)? {
        let online = existing.status(heartbeat_ttl_secs, now) == AgentStatus::Online;
        let same_session = match (req.session_id, existing.session_id.as_deref()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };

        if same_session || (req.session_id.is_none() && online) {
            existing.last_seen = now;
            if let Some(capabilities) = req.capabilities {
                existing.capabilities = capabilities.to_vec();
            }
            if let Some(name) = req.display_name {
                existing.display_name = Some(name.to_string());
            }
            insert_record(conn, &existing)?;
            tracing::debug!(agent_id = %existing.id, "agent heartbeat via re-register");
            return Ok((existing, RegisterOutcome::Reconnected));
        }

        if online {
            let canonical = resolve_collision(conn, req.requested_id, heartbeat_ttl_secs, now)?;
            tracing::warn!(
                requested = %req.requested_id,
                resolved = %canonical,
                "agent id collision, suffix assigned"
            );
            let record = new_record(req, &canonical, now);
            insert_record(conn, &record)?;
            return Ok((record, RegisterOutcome::Suffixed));
        }

        // Offline holder: the new session takes the id over wholesale.
        let record = new_record(req, req.requested_id, now);
        insert_record(conn, &record)?;
        tracing::info!(agent_id = %record.id, "offline agent id taken over");
        return Ok((record, RegisterOutcome::TookOver));
    }

    let record = new_record(req, req.requested_id, now);
    insert_record(conn, &record)?;
    tracing::info!(agent_id = %record.id, session = ?req.session_id, "agent registered");
    Ok((record, RegisterOutcome::Created))
}

fn new_record(req: &RegisterRequest<'_>, canonical_id: &str, now: DateTime<Utc>) -> AgentRecord {
    AgentRecord {
        id: canonical_id.to_string(),
        display_name: req.display_name.map(str::to_string),
        description: String::new(),
        capabilities: req.capabilities.map(<[String]>::to_vec).unwrap_or_default(),
        session_id: req.session_id.map(str::to_string),
        registered_at: now,
        last_seen: now,
    }
}

/// Finds the first free `-N` slot for a contended id.
///
/// A slot is free when no record holds it or the holder is offline. Probing
/// stops at suffix 99; full contention fails with `REGISTRATION_EXHAUSTED`.
fn resolve_collision(
    conn: &Connection,
    base_id: &str,
    heartbeat_ttl_secs: i64,
    now: DateTime<Utc>,
) -> Result<String, CoordError> {
    for counter in 2..=MAX_COLLISION_SUFFIX {
        let candidate = format!("{base_id}-{counter}");
        match get(conn, &candidate)? {
            None => return Ok(candidate),
            Some(existing) if existing.status(heartbeat_ttl_secs, now) == AgentStatus::Offline => {
                return Ok(candidate)
            }
            Some(_) => continue,
        }
    }
    Err(CoordError::registration_exhausted(base_id))
}

/// Updates `last_seen` if the record exists. Idempotent; no-op for unknown
/// agents.
pub fn touch_heartbeat(
    conn: &Connection,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoordError> {
    let changed = conn.execute(
        "UPDATE agents SET last_seen = ?1 WHERE id = ?2",
        params![now.to_rfc3339(), agent_id],
    )?;
    Ok(changed > 0)
}

/// Lists every record, unordered by liveness; callers derive status via
/// [`AgentRecord::view`].
pub fn list(conn: &Connection) -> Result<Vec<AgentRecord>, CoordError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM agents ORDER BY id ASC"))?;
    let rows = stmt.query_map([], |row| row_to_record(row))?;
    let mut agents = Vec::new();
    for row in rows {
        agents.push(row?);
    }
    Ok(agents)
}

/// Counts agents whose heartbeat is within the TTL.
pub fn count_online(
    conn: &Connection,
    heartbeat_ttl_secs: i64,
    now: DateTime<Utc>,
) -> Result<usize, CoordError> {
    let agents = list(conn)?;
    Ok(agents
        .iter()
        .filter(|a| a.status(heartbeat_ttl_secs, now) == AgentStatus::Online)
        .count())
}

/// Sets the free-form description shown in listings.
pub fn set_description(
    conn: &Connection,
    agent_id: &str,
    description: &str,
) -> Result<AgentRecord, CoordError> {
    let changed = conn.execute(
        "UPDATE agents SET description = ?1 WHERE id = ?2",
        params![description, agent_id],
    )?;
    if changed == 0 {
        let available: Vec<String> = list(conn)?.into_iter().map(|a| a.id).collect();
        return Err(CoordError::agent_not_found(agent_id, &available));
    }
    tracing::info!(agent_id = %agent_id, "agent description updated");
    get(conn, agent_id)?
        .ok_or_else(|| CoordError::store_unavailable("agent vanished during description update"))
}

/// Creates an offline placeholder so messages can queue for an agent that
/// has never connected. The epoch `last_seen` keeps it offline until the
/// real agent registers and takes the record over.
pub fn ensure_placeholder(
    conn: &Connection,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<AgentRecord, CoordError> {
    validate_agent_id(agent_id)?;
    if let Some(existing) = get(conn, agent_id)? {
        return Ok(existing);
    }
    let record = AgentRecord {
        id: agent_id.to_string(),
        display_name: None,
        description: String::new(),
        capabilities: Vec::new(),
        session_id: None,
        registered_at: now,
        last_seen: DateTime::<Utc>::UNIX_EPOCH,
    };
    insert_record(conn, &record)?;
    tracing::info!(agent_id = %agent_id, "offline placeholder created");
    Ok(record)
}

/// Marks an agent offline immediately by rewinding `last_seen` to the epoch.
pub fn mark_offline(conn: &Connection, agent_id: &str) -> Result<bool, CoordError> {
    let changed = conn.execute(
        "UPDATE agents SET last_seen = ?1 WHERE id = ?2",
        params![DateTime::<Utc>::UNIX_EPOCH.to_rfc3339(), agent_id],
    )?;
    Ok(changed > 0)
}

fn pending_count(conn: &Connection, agent_id: &str) -> Result<i64, CoordError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM inbox WHERE to_agent = ?1",
        params![agent_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Deletes an agent record together with its inbox and notify rows.
pub fn remove(conn: &Connection, agent_id: &str) -> Result<bool, CoordError> {
    conn.execute("DELETE FROM inbox WHERE to_agent = ?1", params![agent_id])?;
    conn.execute(
        "DELETE FROM notify_tokens WHERE agent_id = ?1",
        params![agent_id],
    )?;
    let changed = conn.execute("DELETE FROM agents WHERE id = ?1", params![agent_id])?;
    if changed > 0 {
        tracing::info!(agent_id = %agent_id, "agent removed");
    }
    Ok(changed > 0)
}

/// Graceful unregistration.
///
/// - empty inbox, no keep request → the record and all per-agent rows go;
/// - pending messages → the record stays, marked offline, so a future
///   registration inherits the queue;
/// - `keep_if_pending` → always retained and marked offline (the external
///   watcher pattern).
pub fn unregister(
    conn: &Connection,
    agent_id: &str,
    keep_if_pending: bool,
) -> Result<UnregisterDisposition, CoordError> {
    if get(conn, agent_id)?.is_none() {
        return Ok(UnregisterDisposition::NotFound);
    }

    let pending = pending_count(conn, agent_id)?;
    if keep_if_pending || pending > 0 {
        mark_offline(conn, agent_id)?;
        tracing::info!(
            agent_id = %agent_id,
            pending,
            keep = keep_if_pending,
            "agent retained offline on unregister"
        );
        return Ok(UnregisterDisposition::Retained);
    }

    remove(conn, agent_id)?;
    Ok(UnregisterDisposition::Removed)
}

/// Bulk-removes agents matching a glob pattern, optionally restricted to a
/// derived status. Returns the removed ids.
pub fn remove_matching(
    conn: &Connection,
    pattern: &str,
    status_filter: Option<AgentStatus>,
    heartbeat_ttl_secs: i64,
    now: DateTime<Utc>,
) -> Result<Vec<String>, CoordError> {
    let mut removed = Vec::new();
    for agent in list(conn)? {
        if !switchboard_auth::pattern_allows(pattern, &agent.id) {
            continue;
        }
        if let Some(wanted) = status_filter {
            if agent.status(heartbeat_ttl_secs, now) != wanted {
                continue;
            }
        }
        remove(conn, &agent.id)?;
        removed.push(agent.id);
    }
    if !removed.is_empty() {
        tracing::info!(pattern, count = removed.len(), "agents bulk-removed");
    }
    Ok(removed)
}

/// Scavenges expired offline records: agents whose heartbeat is older than
/// `retention_secs` and whose inbox is empty. Returns how many were removed.
pub fn scavenge_expired(
    conn: &Connection,
    retention_secs: i64,
    now: DateTime<Utc>,
) -> Result<usize, CoordError> {
    let cutoff = (now - chrono::Duration::seconds(retention_secs)).to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT id FROM agents
         WHERE last_seen < ?1
           AND id NOT IN (SELECT DISTINCT to_agent FROM inbox)",
    )?;
    let expired: Vec<String> = stmt
        .query_map(params![cutoff], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    for agent_id in &expired {
        remove(conn, agent_id)?;
    }
    Ok(expired.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use switchboard_types::ErrorKind;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        switchboard_db::run_migrations(&conn).unwrap();
        conn
    }

    fn req<'a>(id: &'a str, session: &'a str) -> RegisterRequest<'a> {
        RegisterRequest {
            requested_id: id,
            session_id: Some(session),
            ..Default::default()
        }
    }

    const TTL: i64 = 900;

    #[test]
    fn fresh_registration_creates() {
        let conn = conn();
        let now = Utc::now();
        let (record, outcome) = register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();
        assert_eq!(record.id, "host/proj");
        assert_eq!(outcome, RegisterOutcome::Created);
    }

    #[test]
    fn bare_id_rejected() {
        let conn = conn();
        let err = register(&conn, &req("host", "s1"), TTL, Utc::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn same_session_reconnects_with_same_id() {
        let conn = conn();
        let now = Utc::now();
        let (first, _) = register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();
        let later = now + Duration::seconds(10);
        let (second, outcome) = register(&conn, &req("host/proj", "s1"), TTL, later).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(outcome, RegisterOutcome::Reconnected);
        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.last_seen, later);
    }

    #[test]
    fn live_collision_gets_suffix() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();
        let (second, outcome) = register(&conn, &req("host/proj", "s2"), TTL, now).unwrap();
        assert_eq!(second.id, "host/proj-2");
        assert_eq!(outcome, RegisterOutcome::Suffixed);

        let (third, _) = register(&conn, &req("host/proj", "s3"), TTL, now).unwrap();
        assert_eq!(third.id, "host/proj-3");
    }

    #[test]
    fn offline_record_is_taken_over() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();

        let later = now + Duration::seconds(TTL + 60);
        let (record, outcome) = register(&conn, &req("host/proj", "s2"), TTL, later).unwrap();
        assert_eq!(record.id, "host/proj");
        assert_eq!(outcome, RegisterOutcome::TookOver);
        assert_eq!(record.session_id.as_deref(), Some("s2"));
    }

    #[test]
    fn missing_session_on_live_record_is_a_heartbeat() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();

        let anon = RegisterRequest {
            requested_id: "host/proj",
            ..Default::default()
        };
        let (record, outcome) = register(&conn, &anon, TTL, now + Duration::seconds(5)).unwrap();
        assert_eq!(record.id, "host/proj");
        assert_eq!(outcome, RegisterOutcome::Reconnected);
        assert_eq!(record.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn collision_probing_exhausts_at_suffix_cap() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s0"), TTL, now).unwrap();
        for i in 2..=MAX_COLLISION_SUFFIX {
            let id = format!("host/proj-{i}");
            register(&conn, &req(&id, &format!("s{i}")), TTL, now).unwrap();
        }

        let err = register(&conn, &req("host/proj", "s-new"), TTL, now).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RegistrationExhausted);
    }

    #[test]
    fn suffix_slot_held_by_offline_agent_is_reused() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();
        register(&conn, &req("host/proj-2", "s2"), TTL, now).unwrap();
        mark_offline(&conn, "host/proj-2").unwrap();

        let (record, outcome) = register(&conn, &req("host/proj", "s3"), TTL, now).unwrap();
        assert_eq!(record.id, "host/proj-2");
        assert_eq!(outcome, RegisterOutcome::Suffixed);
    }

    #[test]
    fn heartbeat_touches_only_existing() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();
        assert!(touch_heartbeat(&conn, "host/proj", now + Duration::seconds(1)).unwrap());
        assert!(!touch_heartbeat(&conn, "host/ghost", now).unwrap());
    }

    #[test]
    fn unregister_with_empty_inbox_removes_everything() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();
        conn.execute(
            "INSERT INTO notify_tokens (agent_id, created_at) VALUES ('host/proj', ?1)",
            params![now.to_rfc3339()],
        )
        .unwrap();

        let disposition = unregister(&conn, "host/proj", false).unwrap();
        assert_eq!(disposition, UnregisterDisposition::Removed);
        assert!(get(&conn, "host/proj").unwrap().is_none());
        let tokens: i64 = conn
            .query_row("SELECT COUNT(*) FROM notify_tokens", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tokens, 0);
    }

    #[test]
    fn unregister_with_pending_messages_retains_offline() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();
        conn.execute(
            "INSERT INTO inbox (id, from_agent, to_agent, kind, body, created_at)
             VALUES ('a/b::host/proj::00000000', 'a/b', 'host/proj', 'message', 'hi', ?1)",
            params![now.to_rfc3339()],
        )
        .unwrap();

        let disposition = unregister(&conn, "host/proj", false).unwrap();
        assert_eq!(disposition, UnregisterDisposition::Retained);
        let record = get(&conn, "host/proj").unwrap().unwrap();
        assert_eq!(record.status(TTL, now), AgentStatus::Offline);
    }

    #[test]
    fn unregister_keep_flag_always_retains() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/proj", "s1"), TTL, now).unwrap();
        let disposition = unregister(&conn, "host/proj", true).unwrap();
        assert_eq!(disposition, UnregisterDisposition::Retained);
        assert!(get(&conn, "host/proj").unwrap().is_some());
    }

    #[test]
    fn unregister_unknown_agent() {
        let conn = conn();
        assert_eq!(
            unregister(&conn, "host/ghost", false).unwrap(),
            UnregisterDisposition::NotFound
        );
    }

    #[test]
    fn remove_matching_honors_pattern_and_status() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("stress/a", "s1"), TTL, now).unwrap();
        register(&conn, &req("stress/b", "s2"), TTL, now).unwrap();
        register(&conn, &req("prod/a", "s3"), TTL, now).unwrap();
        mark_offline(&conn, "stress/b").unwrap();

        let removed = remove_matching(
            &conn,
            "stress/*",
            Some(AgentStatus::Offline),
            TTL,
            now,
        )
        .unwrap();
        assert_eq!(removed, vec!["stress/b".to_string()]);
        assert!(get(&conn, "stress/a").unwrap().is_some());
        assert!(get(&conn, "prod/a").unwrap().is_some());
    }

    #[test]
    fn scavenge_removes_aged_agents_without_mail() {
        let conn = conn();
        let now = Utc::now();
        ensure_placeholder(&conn, "host/ghost", now).unwrap();
        register(&conn, &req("host/live", "s1"), TTL, now).unwrap();

        // The placeholder with mail survives.
        ensure_placeholder(&conn, "host/loaded", now).unwrap();
        conn.execute(
            "INSERT INTO inbox (id, from_agent, to_agent, kind, body, created_at)
             VALUES ('a/b::host/loaded::00000000', 'a/b', 'host/loaded', 'message', 'hi', ?1)",
            params![now.to_rfc3339()],
        )
        .unwrap();

        let removed = scavenge_expired(&conn, 24 * 3600, now).unwrap();
        assert_eq!(removed, 1);
        assert!(get(&conn, "host/ghost").unwrap().is_none());
        assert!(get(&conn, "host/loaded").unwrap().is_some());
        assert!(get(&conn, "host/live").unwrap().is_some());
    }

    #[test]
    fn count_online_ignores_offline() {
        let conn = conn();
        let now = Utc::now();
        register(&conn, &req("host/a", "s1"), TTL, now).unwrap();
        register(&conn, &req("host/b", "s2"), TTL, now).unwrap();
        mark_offline(&conn, "host/b").unwrap();
        assert_eq!(count_online(&conn, TTL, now).unwrap(), 1);
    }
}
