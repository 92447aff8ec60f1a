//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The key material has the wrong length or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A stored ciphertext is not in the `b64(iv):b64(ct)` form.
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// Decryption failed (wrong key or corrupted data).
    #[error("decryption failed")]
    DecryptFailed,

    /// A key ring has no key with the requested ID.
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// The signature's key ID is not in the trusted set.
    #[error("untrusted signing key: {0}")]
    UntrustedKey(String),

    /// Signature bytes failed verification.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The declared signature algorithm is not supported.
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// I/O while reading a tree or persisting keys.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key ring file could not be parsed or written.
    #[error("key ring error: {0}")]
    KeyRing(String),
}

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
