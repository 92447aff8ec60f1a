//! Configuration error types.

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// One or more variables failed validation; all problems are listed.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
