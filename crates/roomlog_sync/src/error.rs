//! Error types for room orchestration.

use roomlog_core::CoreError;
use roomlog_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while driving a room.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Timeline write or ordering error.
    #[error("timeline error: {0}")]
    Core(#[from] CoreError),

    /// Store error outside a timeline write.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The paginated fetch failed.
    #[error("fetch error: {message}")]
    Fetch {
        /// Error message.
        message: String,
        /// Whether the fetch can be retried.
        retryable: bool,
    },

    /// Decryption of a whole batch failed.
    #[error("decryption error: {0}")]
    Decryption(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A spawned task failed to complete.
    #[error("task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Creates a retryable fetch error.
    pub fn fetch_retryable(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable fetch error.
    pub fn fetch_fatal(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Fetch { retryable: true, .. })
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
