//! Storage error types.

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backing store could not be opened.
    #[error("failed to open store: {0}")]
    Open(String),

    /// A read or write against the backing store failed.
    #[error("store operation failed: {0}")]
    Backend(String),

    /// Flushing pending writes to disk failed.
    #[error("flush failed: {0}")]
    Flush(String),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
