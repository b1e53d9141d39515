//! Store substrate for the switchboard coordinator.
//!
//! The coordinator keeps all shared state in one SQLite file: the agent
//! registry, per-agent inboxes and notify tokens, API keys, rate-limit
//! windows, and the audit ring. This crate owns opening that file (pooled,
//! WAL mode) and evolving its schema through embedded migrations; the
//! tables themselves are queried by the component crates.
//!
//! Request handlers check a connection out of the pool inside
//! `spawn_blocking`, do their reads and writes, and return it before any
//! await point. Long-poll waiters hold no connection while parked, so the
//! small fixed pool is never pinned by idle waits.

mod migrations;

pub use migrations::{run_migrations, MigrationError};

use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

/// Pooled handle to the coordinator's store. Cheap to clone; every clone
/// draws from the same set of connections.
pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Upper bound on simultaneously checked-out connections. Handlers hold a
/// connection only for the duration of one blocking closure, so a small
/// pool suffices well past the request concurrency it serves.
const POOL_SIZE: u32 = 8;

/// Errors from opening the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The pool could not be built over the given database path.
    #[error("could not open store at '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: r2d2::Error,
    },
}

/// Opens (creating if absent) the store at `db_path` and returns the pool.
///
/// Every connection is initialized with WAL journaling so inbox readers
/// are never blocked behind a writer, `synchronous = NORMAL` (the durable
/// pairing for WAL), foreign keys on, and a busy timeout wide enough to
/// ride out the scavenger's batched deletes.
///
/// In-memory databases don't work here: each pooled `:memory:` connection
/// would get its own private store. Tests that need a pool use a
/// throwaway file instead.
///
/// # Errors
///
/// Returns [`StoreError::Open`] if the pool cannot be built.
pub fn open_pool(db_path: &str) -> Result<DbPool, StoreError> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });

    r2d2::Pool::builder()
        .max_size(POOL_SIZE)
        .build(manager)
        .map_err(|source| StoreError::Open {
            path: db_path.to_string(),
            source,
        })
}
