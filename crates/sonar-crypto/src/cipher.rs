//! AES-256-CBC field encryption.
//!
//! Each secret field is encrypted independently with a fresh random IV.
//! The stored form is `base64(iv) ":" base64(ciphertext)` — self-contained,
//! so a record can be re-encrypted field by field during key rotation.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::MasterKey;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size; CBC IVs are one block.
const IV_LEN: usize = 16;

/// Encrypt one secret field under the given key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] if the key material is unusable.
pub fn encrypt_field(key: &MasterKey, plaintext: &[u8]) -> CryptoResult<String> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key.material(), &iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok(format!("{}:{}", BASE64.encode(iv), BASE64.encode(ciphertext)))
}

/// Decrypt one stored field with the given key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidCiphertext`] when the stored form is
/// malformed and [`CryptoError::DecryptFailed`] when the key does not
/// match (bad padding).
pub fn decrypt_field(key: &MasterKey, stored: &str) -> CryptoResult<Vec<u8>> {
    let (iv_b64, ct_b64) = stored
        .split_once(':')
        .ok_or_else(|| CryptoError::InvalidCiphertext("missing ':' separator".into()))?;

    let iv = BASE64
        .decode(iv_b64)
        .map_err(|e| CryptoError::InvalidCiphertext(format!("bad IV base64: {e}")))?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidCiphertext(format!(
            "IV is {} bytes, expected {IV_LEN}",
            iv.len()
        )));
    }
    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|e| CryptoError::InvalidCiphertext(format!("bad ciphertext base64: {e}")))?;

    let cipher = Aes256CbcDec::new_from_slices(key.material(), &iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = MasterKey::generate();
        let stored = encrypt_field(&key, b"s3cret-api-key").unwrap();
        assert_eq!(decrypt_field(&key, &stored).unwrap(), b"s3cret-api-key");
    }

    #[test]
    fn ivs_are_unique_per_call() {
        let key = MasterKey::generate();
        let a = encrypt_field(&key, b"same").unwrap();
        let b = encrypt_field(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let key = MasterKey::generate();
        let other = MasterKey::generate();
        let stored = encrypt_field(&key, b"payload").unwrap();
        assert!(matches!(
            decrypt_field(&other, &stored),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn malformed_stored_form_rejected() {
        let key = MasterKey::generate();
        assert!(decrypt_field(&key, "no-separator").is_err());
        assert!(decrypt_field(&key, "!!!:AAAA").is_err());
        // 8-byte IV is too short for AES-CBC.
        let short_iv = format!("{}:{}", BASE64.encode([0u8; 8]), BASE64.encode([0u8; 16]));
        assert!(decrypt_field(&key, &short_iv).is_err());
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = MasterKey::generate();
        let stored = encrypt_field(&key, b"").unwrap();
        assert_eq!(decrypt_field(&key, &stored).unwrap(), Vec::<u8>::new());
    }
}
