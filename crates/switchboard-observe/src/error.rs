//! Error type for audit log operations.

use thiserror::Error;

/// Errors that can occur while writing to or reading from the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The underlying SQLite operation failed.
    #[error("audit database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An audit detail payload could not be serialised.
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
