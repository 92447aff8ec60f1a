//! Sonar crypto — the primitives behind the credential vault and the
//! plugin manager.
//!
//! Three concerns live here:
//!
//! - **Field encryption** ([`cipher`]): AES-256-CBC with a per-field
//!   random IV, stored as `base64(iv) ":" base64(ciphertext)`.
//! - **Key management** ([`keys`]): 32-byte master keys with a key-ring
//!   history; exactly one key is active at a time.
//! - **Content addressing** ([`dist`]): deterministic SHA-256 over a
//!   sorted file tree, the identity used for plugin integrity.
//! - **Signatures** ([`signature`]): Ed25519 verification against a
//!   configured trusted-key set.

pub mod cipher;
pub mod dist;
pub mod error;
pub mod keys;
pub mod signature;

pub use cipher::{decrypt_field, encrypt_field};
pub use dist::{DistInfo, hash_dist_tree};
pub use error::{CryptoError, CryptoResult};
pub use keys::{KeyRing, KeyStatus, MasterKey};
pub use signature::TrustedKeys;
