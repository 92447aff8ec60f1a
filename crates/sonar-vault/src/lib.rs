//! Sonar vault — encrypted credential storage.
//!
//! Credentials are keyed records whose secret fields are individually
//! encrypted (AES-256-CBC, per-field IV) under the active master key from
//! a [`sonar_crypto::KeyRing`]. The invariant the vault maintains: every
//! stored ciphertext decrypts with a key in the ring's history, and the
//! active key decrypts everything written after it became active.
//!
//! Key rotation is all-or-nothing: every record is re-encrypted into a
//! staging map, the staged store is persisted, and only then does the new
//! key become active. A failure anywhere leaves the store and ring
//! untouched. Every operation — including failures — appends to the
//! audit log.

pub mod error;
pub mod types;
pub mod vault;

pub use error::{VaultError, VaultResult};
pub use types::{Credential, CredentialMetadata, CredentialRecord, CredentialType};
pub use vault::CredentialVault;
