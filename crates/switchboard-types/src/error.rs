//! Wire-visible error taxonomy.
//!
//! Component operations return [`CoordError`]; only the transport layer turns
//! one into an HTTP response. Each error carries a stable `code`, a human
//! message, and usually an actionable `suggestion`.

use serde::Serialize;
use thiserror::Error;

/// The classified failure kinds the coordinator can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed identifier, oversized payload, bad target format.
    InvalidRequest,
    /// Missing, malformed, unknown, or revoked bearer credential.
    Unauthenticated,
    /// The credential is valid but its agent pattern does not cover the id.
    ForbiddenScope,
    /// Message target is not registered and offline delivery was not requested.
    AgentNotFound,
    /// Sliding-window threshold crossed for this operation and identity.
    RateLimited,
    /// Collision probing exhausted every suffix slot.
    RegistrationExhausted,
    /// The backing store failed; retry with backoff.
    StoreUnavailable,
    /// A long-poll wait expired. Reported inline, not as an HTTP error.
    Timeout,
}

impl ErrorKind {
    /// Stable wire code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::ForbiddenScope => "FORBIDDEN_SCOPE",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::RegistrationExhausted => "REGISTRATION_EXHAUSTED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// The HTTP status this kind maps to at the transport boundary.
    ///
    /// `Timeout` maps to 200: a wait that expires is an answer, not a failure.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unauthenticated => 401,
            Self::ForbiddenScope => 403,
            Self::AgentNotFound => 404,
            Self::RegistrationExhausted => 409,
            Self::RateLimited => 429,
            Self::StoreUnavailable => 503,
            Self::Timeout => 200,
        }
    }
}

/// A structured coordinator error.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CoordError {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestion: Option<String>,
}

impl CoordError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn invalid_request(field: &str, reason: &str) -> Self {
        Self::new(
            ErrorKind::InvalidRequest,
            format!("Invalid request: {field} - {reason}"),
        )
        .with_suggestion("Check the documentation for required parameters.")
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
            .with_suggestion("Provide a valid Authorization: Bearer <token> header.")
    }

    pub fn forbidden_scope(agent_id: &str, pattern: &str) -> Self {
        Self::new(
            ErrorKind::ForbiddenScope,
            format!("Agent id '{agent_id}' does not match key pattern '{pattern}'."),
        )
        .with_suggestion("Ask an administrator for a key scoped to this agent id.")
    }

    /// Unknown send target. The suggestion names a few live alternatives so
    /// callers can correct a typo without a separate list call.
    pub fn agent_not_found(target: &str, available: &[String]) -> Self {
        let suggestion = if available.is_empty() {
            "No agents are currently registered. Wait for agents to come online.".to_string()
        } else {
            let shown: Vec<&str> = available.iter().take(5).map(String::as_str).collect();
            let rest = available.len().saturating_sub(shown.len());
            let mut text = format!("Available agents: {}", shown.join(", "));
            if rest > 0 {
                text.push_str(&format!(" (and {rest} more)"));
            }
            text
        };
        Self::new(
            ErrorKind::AgentNotFound,
            format!("Agent '{target}' not found."),
        )
        .with_suggestion(suggestion)
    }

    pub fn rate_limited(identity: &str, limit: i64, window_secs: i64) -> Self {
        Self::new(
            ErrorKind::RateLimited,
            format!("Rate limit exceeded for '{identity}'."),
        )
        .with_suggestion(format!(
            "Maximum {limit} requests per {window_secs} seconds. Back off before retrying."
        ))
    }

    pub fn registration_exhausted(base_id: &str) -> Self {
        Self::new(
            ErrorKind::RegistrationExhausted,
            format!("No free collision suffix for agent id '{base_id}'."),
        )
        .with_suggestion("Rename the machine or project to a less contended identifier.")
    }

    pub fn store_unavailable(detail: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::StoreUnavailable,
            format!("Backing store operation failed: {detail}"),
        )
        .with_suggestion("Retry with backoff; check the coordinator's store configuration.")
    }
}

impl From<rusqlite::Error> for CoordError {
    fn from(err: rusqlite::Error) -> Self {
        Self::store_unavailable(err)
    }
}

impl From<r2d2::Error> for CoordError {
    fn from(err: r2d2::Error) -> Self {
        Self::store_unavailable(err)
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::store_unavailable(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(ErrorKind::InvalidRequest.http_status(), 400);
        assert_eq!(ErrorKind::Unauthenticated.http_status(), 401);
        assert_eq!(ErrorKind::ForbiddenScope.http_status(), 403);
        assert_eq!(ErrorKind::AgentNotFound.http_status(), 404);
        assert_eq!(ErrorKind::RegistrationExhausted.http_status(), 409);
        assert_eq!(ErrorKind::RateLimited.http_status(), 429);
        assert_eq!(ErrorKind::StoreUnavailable.http_status(), 503);
        assert_eq!(ErrorKind::Timeout.http_status(), 200);
    }

    #[test]
    fn agent_not_found_truncates_suggestions() {
        let available: Vec<String> = (0..8).map(|i| format!("lab/agent-{i}")).collect();
        let err = CoordError::agent_not_found("lab/missing", &available);
        let suggestion = err.suggestion.unwrap();
        assert!(suggestion.contains("lab/agent-0"));
        assert!(suggestion.contains("and 3 more"));
    }

    #[test]
    fn agent_not_found_with_empty_registry() {
        let err = CoordError::agent_not_found("lab/missing", &[]);
        assert!(err.suggestion.unwrap().contains("No agents"));
    }
}
