//! Vault error types.

use sonar_audit::AuditError;
use sonar_crypto::CryptoError;

/// Errors from vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No credential with the given ID.
    #[error("credential not found: {0}")]
    NotFound(String),

    /// A credential with the given ID already exists.
    #[error("credential already exists: {0}")]
    Duplicate(String),

    /// A stored record references a key missing from the ring.
    #[error("credential {id} was written with unknown key {key_id}")]
    KeyMissing {
        /// The affected credential.
        id: String,
        /// The key the record references.
        key_id: String,
    },

    /// Cryptographic failure (bad key material, decrypt failure).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Audit log failure; vault operations do not proceed unaudited.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// The store file could not be read, parsed, or written.
    #[error("credential store error: {0}")]
    Store(String),

    /// Key rotation aborted; the store is unchanged.
    #[error("key rotation aborted: {0}")]
    RotationAborted(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;
