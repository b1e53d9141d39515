//! Shared domain types for the switchboard coordinator.
//!
//! Holds the agent and message models, the wire-visible error taxonomy, and
//! the size/timeout limits every other crate enforces. This crate is the
//! vocabulary of the system; behavior lives in the component crates.

mod agent;
mod error;
mod message;

pub use agent::{validate_agent_id, AgentRecord, AgentStatus, AgentView, RegisterOutcome};
pub use error::{CoordError, ErrorKind};
pub use message::{
    compose_message_id, parse_message_id, Message, MessageKind, MessageStatus, ID_DELIMITER,
};

/// Maximum size in bytes for a message body or context payload.
pub const MAX_PAYLOAD_BYTES: usize = 50_000;

/// Maximum length of an agent identifier.
pub const MAX_AGENT_ID_LEN: usize = 64;

/// Bounds for long-poll wait timeouts, in seconds.
pub const MIN_WAIT_SECS: u64 = 1;
pub const MAX_WAIT_SECS: u64 = 3_600;

/// Default long-poll wait timeout, in seconds.
pub const DEFAULT_WAIT_SECS: u64 = 60;

/// An agent is considered offline once `last_seen` is older than this.
pub const DEFAULT_HEARTBEAT_TTL_SECS: i64 = 900;

/// Queued messages expire after this many seconds.
pub const DEFAULT_MESSAGE_TTL_SECS: i64 = 24 * 60 * 60;

/// Highest collision suffix probed before registration gives up.
pub const MAX_COLLISION_SUFFIX: u32 = 99;
