//! CMDB error types.

use sonar_storage::StorageError;

/// Errors from CMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum CmdbError {
    /// The durable store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A row could not be encoded or decoded.
    #[error("row serialization error for {key}: {message}")]
    Row {
        /// The affected CI key.
        key: String,
        /// What went wrong.
        message: String,
    },

    /// A glob pattern could not be compiled.
    #[error("invalid query pattern '{0}'")]
    BadPattern(String),

    /// A legacy import file could not be read or parsed.
    #[error("migration failed: {0}")]
    Migrate(String),
}

/// Result type for CMDB operations.
pub type CmdbResult<T> = Result<T, CmdbError>;
