//! Audit layer for the switchboard coordinator.
//!
//! Every security-relevant action (authentication outcomes, agent
//! lifecycle changes, message traffic, key administration, scope denials)
//! is recorded in an append-only, bounded ring that administrators can
//! query. Audit writes are best-effort: a failed audit insert is logged and
//! never fails the operation it describes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use switchboard_observe::{record_event, Actor, ActorKind, AuditAction, AuditOutcome};
//!
//! record_event(
//!     &conn,
//!     &Actor::new(ActorKind::Agent, "lab/worker"),
//!     AuditAction::MessageSent,
//!     &message_id,
//!     AuditOutcome::Success,
//!     &serde_json::json!({ "to": "lab/peer" }),
//! )?;
//! ```

mod error;
mod event;
mod store;

pub use error::AuditError;
pub use event::{Actor, ActorKind, AuditAction, AuditEntry, AuditOutcome};
pub use store::{query_recent, record_event, AuditFilter, AUDIT_RING_MAX};
