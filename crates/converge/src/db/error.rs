//! State store errors.

use std::path::PathBuf;
use thiserror::Error;

/// Failures reading or writing controller state.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("State store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Cannot create state directory '{path}': {source}")]
    StateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A schema version could not be applied; the store stays at the
    /// previous version.
    #[error("State store schema v{version} could not be applied: {reason}")]
    Schema { version: u32, reason: String },

    /// A stored value no longer matches the type it is read back into,
    /// e.g. a status name from a newer release.
    #[error("Stored {table}.{column} is unreadable: {reason}")]
    Decode {
        table: &'static str,
        column: &'static str,
        reason: String,
    },
}

impl DatabaseError {
    pub(crate) fn decode(table: &'static str, column: &'static str, reason: impl ToString) -> Self {
        DatabaseError::Decode {
            table,
            column,
            reason: reason.to_string(),
        }
    }
}
