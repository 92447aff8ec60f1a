//! Transport error types.

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Standard-stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP listener could not be started.
    #[error("HTTP server error: {0}")]
    Http(String),

    /// AMQP connection or channel failure.
    #[error("AMQP error: {0}")]
    Amqp(String),

    /// Reconnect attempts exhausted.
    #[error("AMQP reconnect gave up after {0} attempts")]
    ReconnectExhausted(u32),

    /// The transport was closed.
    #[error("transport closed")]
    Closed,
}

impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        Self::Amqp(e.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
