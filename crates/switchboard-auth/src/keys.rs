//! API key lifecycle: creation, lookup, revocation, listing.
//!
//! The raw key material exists in exactly two places: the response to the
//! creation call, and the caller's keychain. At rest the store holds a
//! `sha256` of the raw key for O(1) lookup and a `bcrypt` hash for
//! verification, so a leaked database does not leak usable credentials.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use switchboard_types::CoordError;

const RAW_KEY_LEN: usize = 32;
const KEY_ID_LEN: usize = 12;

/// Key metadata as exposed to admin listings. Never contains secrets.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub agent_pattern: String,
    pub description: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
}

/// The result of key creation. `api_key` is the raw secret, surfaced once.
#[derive(Debug)]
pub struct CreatedKey {
    pub record: ApiKeyRecord,
    pub api_key: String,
}

fn sha256_hex(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generates and stores a new API key scoped to `agent_pattern`.
pub fn create_key(
    conn: &Connection,
    agent_pattern: &str,
    description: &str,
) -> Result<CreatedKey, CoordError> {
    if agent_pattern.is_empty() {
        return Err(CoordError::invalid_request(
            "agent_pattern",
            "cannot be empty",
        ));
    }

    let raw_key = random_token(RAW_KEY_LEN);
    let key_id = random_token(KEY_ID_LEN);
    let key_sha = sha256_hex(&raw_key);
    let bcrypt_hash = bcrypt::hash(&raw_key, bcrypt::DEFAULT_COST)
        .map_err(|e| CoordError::store_unavailable(format!("key hashing failed: {e}")))?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO api_keys (key_id, key_sha256, bcrypt_hash, agent_pattern, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![key_id, key_sha, bcrypt_hash, agent_pattern, description, now],
    )?;

    tracing::info!(key_id = %key_id, pattern = %agent_pattern, "api key created");

    Ok(CreatedKey {
        record: ApiKeyRecord {
            key_id,
            agent_pattern: agent_pattern.to_string(),
            description: description.to_string(),
            created_at: now,
            last_used: None,
            revoked_at: None,
        },
        api_key: raw_key,
    })
}

/// Looks up and verifies a raw API key.
///
/// Returns `None` for unknown or revoked keys. A hit updates `last_used`.
/// The sha256 index narrows to a single candidate row; the bcrypt hash is
/// then verified against the presented key.
pub fn lookup_key(conn: &Connection, raw_key: &str) -> Result<Option<ApiKeyRecord>, CoordError> {
    let key_sha = sha256_hex(raw_key);
    let row = conn
        .query_row(
            "SELECT key_id, bcrypt_hash, agent_pattern, description, created_at, last_used, revoked_at
             FROM api_keys WHERE key_sha256 = ?1",
            params![key_sha],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((key_id, bcrypt_hash, agent_pattern, description, created_at, _, revoked_at)) = row
    else {
        return Ok(None);
    };

    if revoked_at.is_some() {
        return Ok(None);
    }

    let verified = bcrypt::verify(raw_key, &bcrypt_hash)
        .map_err(|e| CoordError::store_unavailable(format!("key verification failed: {e}")))?;
    if !verified {
        return Ok(None);
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE api_keys SET last_used = ?1 WHERE key_id = ?2",
        params![now, key_id],
    )?;

    Ok(Some(ApiKeyRecord {
        key_id,
        agent_pattern,
        description,
        created_at,
        last_used: Some(now),
        revoked_at: None,
    }))
}

/// Revokes a key by its stable id. Returns whether a live key was revoked.
pub fn revoke_key(conn: &Connection, key_id: &str) -> Result<bool, CoordError> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE api_keys SET revoked_at = ?1 WHERE key_id = ?2 AND revoked_at IS NULL",
        params![now, key_id],
    )?;
    if changed > 0 {
        tracing::info!(key_id = %key_id, "api key revoked");
    }
    Ok(changed > 0)
}

/// Lists all keys, including revoked ones, without secret material.
pub fn list_keys(conn: &Connection) -> Result<Vec<ApiKeyRecord>, CoordError> {
    let mut stmt = conn.prepare(
        "SELECT key_id, agent_pattern, description, created_at, last_used, revoked_at
         FROM api_keys ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ApiKeyRecord {
            key_id: row.get(0)?,
            agent_pattern: row.get(1)?,
            description: row.get(2)?,
            created_at: row.get(3)?,
            last_used: row.get(4)?,
            revoked_at: row.get(5)?,
        })
    })?;

    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}
