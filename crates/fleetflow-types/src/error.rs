//! Storage errors shared by every repository implementation: SQLite, the
//! in-memory stores and the agent's remote checkpoint store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The backing store is gone (closed pool, dropped agent link).
    #[error("storage unavailable")]
    Unavailable,

    /// The store did not confirm a write in time.
    #[error("storage timed out: {0}")]
    Timeout(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// Unique key clash or a stale acknowledgement.
    #[error("conflict: {0}")]
    Conflict(String),
}
