//! Audit error types.

/// Errors from audit logging.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The audit sink could not be opened.
    #[error("failed to open audit log: {0}")]
    Open(String),

    /// Appending an entry failed.
    #[error("failed to append audit entry: {0}")]
    Append(String),

    /// Reading entries back failed.
    #[error("failed to read audit log: {0}")]
    Read(String),

    /// An entry could not be serialized or parsed.
    #[error("audit serialization error: {0}")]
    Serialization(String),
}

/// Result type for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;
