//! Plugin error types.

use std::path::PathBuf;

use sonar_crypto::CryptoError;

/// Errors from plugin operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The requested plugin is not known to the manager.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// Failed to read or parse a manifest file.
    #[error("manifest parse error in {path}: {message}")]
    ManifestParse {
        /// Path to the manifest file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// Manifest validation failed; every problem is listed.
    #[error("invalid manifest for {id}: {}", problems.join("; "))]
    ManifestInvalid {
        /// Best-effort plugin identity (directory name when the manifest
        /// is too broken to name itself).
        id: String,
        /// The collected validation failures.
        problems: Vec<String>,
    },

    /// The dist tree does not match its manifest identity.
    #[error("integrity error for {id}: expected {expected}, got {actual}")]
    Integrity {
        /// The affected plugin.
        id: String,
        /// Hash declared in the manifest.
        expected: String,
        /// Hash computed from the tree on disk.
        actual: String,
    },

    /// The dist tree drifted from what the lock file recorded.
    #[error("lock drift for {id}: {details}")]
    Drift {
        /// The affected plugin.
        id: String,
        /// What changed (hash, file count, total bytes).
        details: String,
    },

    /// Signature required by policy but absent.
    #[error("plugin {0} is unsigned")]
    Unsigned(String),

    /// Signature present but failed verification.
    #[error("bad signature for {id}: {message}")]
    BadSignature {
        /// The affected plugin.
        id: String,
        /// Verification failure detail.
        message: String,
    },

    /// The requested transition is not legal from the current state.
    #[error("plugin {id} is {state}, cannot {operation}")]
    IllegalState {
        /// The affected plugin.
        id: String,
        /// Current state.
        state: String,
        /// The attempted operation.
        operation: String,
    },

    /// The plugin host failed to instantiate the plugin.
    #[error("plugin {id} failed to load: {message}")]
    LoadFailed {
        /// The affected plugin.
        id: String,
        /// Failure reason.
        message: String,
    },

    /// Lock file read/write error.
    #[error("lock file error at {path}: {message}")]
    Lockfile {
        /// Path to the lock file.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// Registry rejected the plugin's registrations.
    #[error("registry error: {0}")]
    Registry(#[from] sonar_registry::RegistryError),

    /// Cryptographic failure during hashing or verification.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Audit log failure.
    #[error(transparent)]
    Audit(#[from] sonar_audit::AuditError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
