//! Error types for the coordination store, worker runtime, scheduler and merger.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the `coordination` crate.
pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coordination store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    #[error("file pattern '{pattern}' is already locked by worker {holder}")]
    LockConflict { pattern: String, holder: String },

    #[error("agent invocation timed out after {0:?}")]
    AgentTimeout(std::time::Duration),

    #[error("failed to spawn agent subprocess: {0}")]
    AgentSpawnFailed(String),

    #[error("invalid devplan: {0}")]
    InvalidDevplan(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("coordination store busy: lock-wait exhausted after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("database corrupted at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

impl CoordError {
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CoordError::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the operation that produced this error might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::Store(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}
