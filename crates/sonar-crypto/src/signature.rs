//! Ed25519 signature verification against a trusted-key set.
//!
//! Plugin manifests may carry a detached signature over their dist hash.
//! The process is configured with a set of trusted public keys, each
//! addressed by an operator-chosen ID; verification requires the
//! manifest's `public_key_id` to resolve to one of them.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::{CryptoError, CryptoResult};

/// The only signature algorithm accepted in manifests.
pub const ALGORITHM_ED25519: &str = "ed25519";

/// A registry of trusted Ed25519 public keys.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustedKeys {
    /// Create an empty trusted-key set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trusted key under the given ID, replacing any previous key
    /// with that ID.
    pub fn add(&mut self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Add a trusted key from its base64-encoded 32-byte public form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] on bad encoding or length.
    pub fn add_base64(&mut self, key_id: impl Into<String>, encoded: &str) -> CryptoResult<()> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("bad base64: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        self.add(key_id, key);
        Ok(())
    }

    /// Whether a key ID is trusted.
    #[must_use]
    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    /// Number of trusted keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify a base64-encoded signature over a message.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::UnsupportedAlgorithm`] for anything but `ed25519`
    /// - [`CryptoError::UntrustedKey`] when the key ID is unknown
    /// - [`CryptoError::SignatureInvalid`] when verification fails
    pub fn verify(
        &self,
        algorithm: &str,
        key_id: &str,
        message: &[u8],
        signature_b64: &str,
    ) -> CryptoResult<()> {
        if algorithm != ALGORITHM_ED25519 {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm.to_string()));
        }
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| CryptoError::UntrustedKey(key_id.to_string()))?;

        let raw = BASE64
            .decode(signature_b64.trim())
            .map_err(|_| CryptoError::SignatureInvalid)?;
        let signature =
            Signature::from_slice(&raw).map_err(|_| CryptoError::SignatureInvalid)?;

        key.verify(message, &signature)
            .map_err(|_| CryptoError::SignatureInvalid)
    }
}
