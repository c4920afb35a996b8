//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// A compare-and-set update matched zero rows: another writer got
    /// there first. Callers treat this as "lost the race", not a fault.
    #[error("Conflict on '{id}': expected status '{expected}', found '{actual}'")]
    Conflict {
        id: String,
        expected: String,
        actual: String,
    },

    /// The referenced row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored value failed to parse (enum string, timestamp, JSON).
    #[error("Corrupt row data: {0}")]
    Corrupt(String),

    /// JSON (de)serialization of a stored column failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DatabaseError {
    /// Whether this error is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DatabaseError::Conflict { .. })
    }
}
