//! Message model and canonical message-id handling.
//!
//! Message ids have the shape `{from_agent}::{to_agent}::{8-hex-uuid}`. The
//! `::` delimiter cannot occur inside an agent id, so the three segments
//! parse unambiguously. The suffix is always generated server-side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::validate_agent_id;
use crate::error::CoordError;

/// Segment delimiter inside a message id.
pub const ID_DELIMITER: &str = "::";

/// Whether a message opens a conversation or answers a prior one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Reply,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Reply => "reply",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "reply" => Ok(Self::Reply),
            other => Err(CoordError::invalid_request(
                "type",
                &format!("unknown message type '{other}'"),
            )),
        }
    }
}

/// Queue status of a message. Acked rows are removed immediately, so
/// persisted messages are always `Pending`; the field exists so the wire
/// shape is explicit about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Acked,
}

/// A queued message as stored in a recipient's inbox and returned on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Set on replies: the id of the message being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Application-level outcome a replier reports ("success" by default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_status: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

/// Composes a canonical message id from its three segments.
pub fn compose_message_id(from_agent: &str, to_agent: &str, suffix: &str) -> String {
    format!("{from_agent}{ID_DELIMITER}{to_agent}{ID_DELIMITER}{suffix}")
}

/// Parses and validates a message id, returning `(from, to, suffix)`.
///
/// The sender and recipient segments must be well-formed agent ids and the
/// suffix must be exactly eight lowercase hex characters.
pub fn parse_message_id(message_id: &str) -> Result<(&str, &str, &str), CoordError> {
    if message_id.is_empty() {
        return Err(CoordError::invalid_request(
            "message_id",
            "must be a non-empty message id",
        ));
    }

    let parts: Vec<&str> = message_id.split(ID_DELIMITER).collect();
    if parts.len() != 3 {
        return Err(CoordError::invalid_request(
            "message_id",
            "must have the form from_agent::to_agent::uuid",
        ));
    }

    let (from_agent, to_agent, suffix) = (parts[0], parts[1], parts[2]);
    validate_agent_id(from_agent)
        .map_err(|_| CoordError::invalid_request("message_id", "sender segment is not valid"))?;
    validate_agent_id(to_agent)
        .map_err(|_| CoordError::invalid_request("message_id", "recipient segment is not valid"))?;

    if suffix.len() != 8 || !suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err(CoordError::invalid_request(
            "message_id",
            "suffix must be exactly 8 hex characters",
        ));
    }

    Ok((from_agent, to_agent, suffix))
}
