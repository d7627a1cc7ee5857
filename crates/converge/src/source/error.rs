//! Manifest source error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::manifest::Revision;

/// Errors that can occur while reading desired state.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Git operation timed out after {0}s")]
    Timeout(u64),

    #[error("Revision {0} is not available from the source")]
    UnknownRevision(Revision),

    #[error("Invalid manifest '{path}' at revision {revision}: {message}")]
    ManifestInvalid {
        revision: Revision,
        path: PathBuf,
        message: String,
    },

    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch error: {0}")]
    WatchError(String),
}

impl SourceError {
    /// Returns true if the error is transient and the next cycle should retry.
    ///
    /// Only `ManifestInvalid` is terminal for a revision.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::ManifestInvalid { .. })
    }
}

/// Classifies git stderr into a source error.
///
/// Everything git reports is treated as unavailability of the source; the
/// message is kept for the status reason string.
pub fn classify_git_error(stderr: &str) -> SourceError {
    let lower = stderr.to_lowercase();

    if lower.contains("unknown revision")
        || lower.contains("bad revision")
        || lower.contains("not a valid object name")
        || lower.contains("invalid object name")
    {
        return SourceError::Unavailable(format!("revision not found: {}", stderr.trim()));
    }

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return SourceError::Unavailable(format!("network error: {}", stderr.trim()));
    }

    if lower.contains("authentication failed") || lower.contains("permission denied") {
        return SourceError::Unavailable(format!("authentication failed: {}", stderr.trim()));
    }

    SourceError::Unavailable(stderr.trim().to_string())
}

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;
