//! Authentication and authorization for the switchboard coordinator.
//!
//! Implements a two-layer bearer token scheme split across three trust
//! domains, distinguished by URL path prefix at the transport:
//!
//! | Domain | Credential | Validation |
//! |--------|-----------|------------|
//! | agent  | `Bearer {server_secret}.{api_key}` | secret prefix, then key record lookup + bcrypt verify |
//! | oauth  | `Bearer {proxy_token}` | constant-time equality with the configured proxy token |
//! | admin  | `Bearer {server_secret}.{admin_key}` (legacy: bare admin key) | secret prefix, then constant-time admin compare |
//!
//! The server secret is shared with the fronting proxy and acts as a cheap
//! perimeter check before any store lookup happens. All secret comparisons
//! are constant-time (`subtle`).
//!
//! When no server secret, admin key, or proxy token is configured, the
//! coordinator runs in dev mode and every request passes as anonymous.

mod keys;
mod pattern;

pub use keys::{create_key, list_keys, lookup_key, revoke_key, ApiKeyRecord, CreatedKey};
pub use pattern::pattern_allows;

use rusqlite::Connection;
use subtle::ConstantTimeEq;
use switchboard_types::CoordError;

/// Secrets shared with the perimeter, read from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub server_secret: Option<String>,
    pub admin_key: Option<String>,
    pub proxy_token: Option<String>,
}

impl AuthConfig {
    /// Dev mode: no secrets configured at all, authentication disabled.
    pub fn dev_mode(&self) -> bool {
        self.server_secret.is_none() && self.admin_key.is_none() && self.proxy_token.is_none()
    }
}

/// The authenticated identity attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// An API-key holder, constrained to agent ids matching `pattern`.
    Agent { key_id: String, pattern: String },
    /// The OAuth reverse proxy (single-tenant, unscoped).
    Proxy,
    /// The administrator.
    Admin,
    /// No credential presented (public endpoints and dev mode).
    Anonymous,
}

impl Principal {
    /// Short label used for audit actor fields and rate-limit identities.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Agent { .. } => "agent",
            Self::Proxy => "proxy",
            Self::Admin => "admin",
            Self::Anonymous => "anonymous",
        }
    }

    /// Whether this principal may act as the given agent id.
    ///
    /// Agent principals are bound by their key's glob pattern; proxy and
    /// admin principals are unscoped; anonymous principals are unscoped
    /// because they only exist in dev mode or on public endpoints.
    pub fn may_act_as(&self, agent_id: &str) -> bool {
        match self {
            Self::Agent { pattern, .. } => pattern_allows(pattern, agent_id),
            Self::Proxy | Self::Admin | Self::Anonymous => true,
        }
    }

    /// Enforces scope, producing the structured denial on mismatch.
    pub fn require_scope(&self, agent_id: &str) -> Result<(), CoordError> {
        match self {
            Self::Agent { pattern, .. } if !pattern_allows(pattern, agent_id) => {
                Err(CoordError::forbidden_scope(agent_id, pattern))
            }
            _ => Ok(()),
        }
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
fn parse_bearer(authorization: &str) -> Result<&str, CoordError> {
    let mut parts = authorization.splitn(2, char::is_whitespace);
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(CoordError::unauthenticated(
            "Invalid Authorization format, expected: Bearer <token>",
        ));
    }
    Ok(token)
}

/// Splits a composite token at the first dot into (server_secret, key).
fn split_composite(token: &str) -> Result<(&str, &str), CoordError> {
    match token.split_once('.') {
        Some((secret, key)) if !secret.is_empty() && !key.is_empty() => Ok((secret, key)),
        _ => Err(CoordError::unauthenticated(
            "Invalid token format, expected: <server_secret>.<key>",
        )),
    }
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Checks the provided server secret against configuration.
///
/// An unconfigured secret skips this layer, matching the perimeter model
/// where the proxy is responsible for injecting it.
fn secret_matches(config: &AuthConfig, provided: &str) -> bool {
    match &config.server_secret {
        Some(expected) => ct_eq(provided, expected),
        None => true,
    }
}

/// Validates a `/agent/*` bearer credential and produces the principal.
///
/// The perimeter secret is checked before any store access, so a request
/// with the wrong prefix is rejected without touching the key table.
pub fn authenticate_agent(
    conn: &Connection,
    config: &AuthConfig,
    authorization: Option<&str>,
) -> Result<Principal, CoordError> {
    if config.dev_mode() {
        return Ok(Principal::Anonymous);
    }
    let header = authorization
        .ok_or_else(|| CoordError::unauthenticated("Missing Authorization header"))?;
    let token = parse_bearer(header)?;
    let (secret, api_key) = split_composite(token)?;

    if !secret_matches(config, secret) {
        tracing::warn!("agent auth failed: invalid server secret");
        return Err(CoordError::unauthenticated("Invalid server secret"));
    }

    // The admin key is accepted on the agent surface as well, unscoped.
    if let Some(admin_key) = &config.admin_key {
        if ct_eq(api_key, admin_key) {
            return Ok(Principal::Admin);
        }
    }

    match keys::lookup_key(conn, api_key)? {
        Some(record) => Ok(Principal::Agent {
            key_id: record.key_id,
            pattern: record.agent_pattern,
        }),
        None => {
            tracing::warn!("agent auth failed: unknown or revoked api key");
            Err(CoordError::unauthenticated("Invalid API key"))
        }
    }
}

/// Validates a `/oauth/*` bearer credential: the proxy's shared token.
pub fn authenticate_proxy(
    config: &AuthConfig,
    authorization: Option<&str>,
) -> Result<Principal, CoordError> {
    if config.dev_mode() {
        return Ok(Principal::Anonymous);
    }
    let expected = config.proxy_token.as_deref().ok_or_else(|| {
        CoordError::unauthenticated("OAuth surface is not configured on this coordinator")
    })?;
    let header = authorization
        .ok_or_else(|| CoordError::unauthenticated("Missing Authorization header"))?;
    let token = parse_bearer(header)?;
    if !ct_eq(token, expected) {
        tracing::warn!("proxy auth failed: token mismatch");
        return Err(CoordError::unauthenticated("Invalid proxy token"));
    }
    Ok(Principal::Proxy)
}

/// Validates a `/admin/*` bearer credential.
///
/// Accepts `{server_secret}.{admin_key}` and, for older deployments, the
/// bare admin key. The bare form logs a deprecation warning on every use.
pub fn authenticate_admin(
    config: &AuthConfig,
    authorization: Option<&str>,
) -> Result<Principal, CoordError> {
    if config.dev_mode() {
        return Ok(Principal::Anonymous);
    }
    let admin_key = config
        .admin_key
        .as_deref()
        .ok_or_else(|| CoordError::unauthenticated("Admin access is not configured"))?;
    let header = authorization
        .ok_or_else(|| CoordError::unauthenticated("Missing Authorization header"))?;
    let token = parse_bearer(header)?;

    if let Ok((secret, key)) = split_composite(token) {
        if secret_matches(config, secret) && ct_eq(key, admin_key) {
            return Ok(Principal::Admin);
        }
    }

    // Legacy format: bare admin key without the server-secret prefix.
    if ct_eq(token, admin_key) {
        tracing::warn!(
            "accepted legacy admin token without server-secret prefix; \
             migrate to the composite format"
        );
        return Ok(Principal::Admin);
    }

    tracing::warn!("admin auth failed");
    Err(CoordError::unauthenticated("Invalid admin credentials"))
}

/// Builds the composite bearer token handed out on key creation.
pub fn composite_token(config: &AuthConfig, raw_key: &str) -> String {
    match &config.server_secret {
        Some(secret) => format!("{secret}.{raw_key}"),
        None => raw_key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_types::ErrorKind;

    fn configured() -> AuthConfig {
        AuthConfig {
            server_secret: Some("perimeter".to_string()),
            admin_key: Some("root-key".to_string()),
            proxy_token: Some("proxy-token".to_string()),
        }
    }

    fn conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        switchboard_db::run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn bearer_parsing_accepts_case_insensitive_scheme() {
        assert_eq!(parse_bearer("Bearer abc").unwrap(), "abc");
        assert_eq!(parse_bearer("bearer abc").unwrap(), "abc");
        assert!(parse_bearer("Basic abc").is_err());
        assert!(parse_bearer("Bearer ").is_err());
    }

    #[test]
    fn composite_split_requires_both_halves() {
        assert_eq!(split_composite("a.b").unwrap(), ("a", "b"));
        assert_eq!(split_composite("a.b.c").unwrap(), ("a", "b.c"));
        assert!(split_composite("nodot").is_err());
        assert!(split_composite(".key").is_err());
        assert!(split_composite("secret.").is_err());
    }

    #[test]
    fn dev_mode_passes_everything_as_anonymous() {
        let config = AuthConfig::default();
        assert!(config.dev_mode());
        let conn = conn();
        assert_eq!(
            authenticate_agent(&conn, &config, None).unwrap(),
            Principal::Anonymous
        );
        assert_eq!(
            authenticate_admin(&config, Some("Bearer junk")).unwrap(),
            Principal::Anonymous
        );
    }

    #[test]
    fn wrong_server_secret_rejected_before_key_lookup() {
        let conn = conn();
        let config = configured();
        let err =
            authenticate_agent(&conn, &config, Some("Bearer wrong.any-key")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
    }

    #[test]
    fn agent_key_round_trip() {
        let conn = conn();
        let config = configured();
        let created = create_key(&conn, "lab/*", "test key").unwrap();

        let header = format!("Bearer {}", composite_token(&config, &created.api_key));
        let principal = authenticate_agent(&conn, &config, Some(&header)).unwrap();
        match principal {
            Principal::Agent { key_id, pattern } => {
                assert_eq!(key_id, created.record.key_id);
                assert_eq!(pattern, "lab/*");
            }
            other => panic!("unexpected principal: {other:?}"),
        }
    }

    #[test]
    fn revoked_key_is_rejected() {
        let conn = conn();
        let config = configured();
        let created = create_key(&conn, "*", "short-lived").unwrap();
        assert!(revoke_key(&conn, &created.record.key_id).unwrap());

        let header = format!("Bearer {}", composite_token(&config, &created.api_key));
        let err = authenticate_agent(&conn, &config, Some(&header)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
    }

    #[test]
    fn admin_accepts_composite_and_legacy_forms() {
        let config = configured();
        assert_eq!(
            authenticate_admin(&config, Some("Bearer perimeter.root-key")).unwrap(),
            Principal::Admin
        );
        assert_eq!(
            authenticate_admin(&config, Some("Bearer root-key")).unwrap(),
            Principal::Admin
        );
        assert!(authenticate_admin(&config, Some("Bearer perimeter.nope")).is_err());
        assert!(authenticate_admin(&config, None).is_err());
    }

    #[test]
    fn proxy_token_compares_exactly() {
        let config = configured();
        assert_eq!(
            authenticate_proxy(&config, Some("Bearer proxy-token")).unwrap(),
            Principal::Proxy
        );
        assert!(authenticate_proxy(&config, Some("Bearer other")).is_err());
    }

    #[test]
    fn scope_enforcement_on_principals() {
        let agent = Principal::Agent {
            key_id: "k1".to_string(),
            pattern: "lab/*".to_string(),
        };
        assert!(agent.may_act_as("lab/worker"));
        assert!(!agent.may_act_as("other/worker"));
        let err = agent.require_scope("other/worker").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenScope);
        assert!(Principal::Admin.may_act_as("anything/at-all"));
    }
}
