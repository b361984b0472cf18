use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for stash operations.
///
/// Sync failures carry a `retryable` flag on the error value itself so the
/// retry policy never has to inspect message text.
#[derive(Debug, Error)]
pub enum StashError {
    /// A stash, file, or remote that was expected to exist is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stash or file already exists where a new one was to be created.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invalid input: bad stash name, malformed remote coordinate,
    /// out-of-range patch indices, or an operation on the wrong doc variant.
    #[error("validation error: {0}")]
    Validation(String),

    /// A transport-level sync failure.
    ///
    /// `retryable` distinguishes transient failures (network, timeout, 5xx)
    /// from permanent ones (authentication, authorization).
    #[error("sync error: {message}")]
    Sync {
        /// Whether the operation may succeed if retried.
        retryable: bool,
        /// Human-readable description of the failure.
        message: String,
    },

    /// Persisted state references something that no longer exists on disk.
    ///
    /// Callers repair with a warning rather than failing; this variant exists
    /// for the cases where repair is impossible.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// General error for any kind of I/O issue not otherwise documented here.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure for one of the `.stash/` artifacts.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the underlying CRDT library.
    #[error("automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    /// A kind of error representing a failed file read.
    #[error("failed to read '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to be read
        path: PathBuf,
        /// std::io error that caused this error
        source: std::io::Error,
    },

    /// A kind of error representing a failed file write.
    #[error("failed to write '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to be written
        path: PathBuf,
        /// std::io error that caused this error
        source: std::io::Error,
    },
}

impl StashError {
    /// A retryable sync error (transient network failure, timeout, 5xx).
    pub fn sync_retryable(message: impl Into<String>) -> Self {
        StashError::Sync {
            retryable: true,
            message: message.into(),
        }
    }

    /// A non-retryable sync error (authentication, authorization, bad request).
    pub fn sync_fatal(message: impl Into<String>) -> Self {
        StashError::Sync {
            retryable: false,
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Only `Sync { retryable: true }` qualifies; every other kind is either
    /// permanent or must be surfaced to the caller unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StashError::Sync { retryable: true, .. })
    }
}

/// Result type alias for stash operations.
pub type Result<T> = std::result::Result<T, StashError>;
