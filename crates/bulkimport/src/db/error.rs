//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating the database directory.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The connection mutex was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// The connection was released and there is no file to reopen.
    #[error("Database connection is closed")]
    Closed,

    /// A stored value could not be decoded.
    #[error("Invalid value in column '{column}': {reason}")]
    Decode { column: &'static str, reason: String },
}
