//! Master keys and the key ring.
//!
//! The vault encrypts with exactly one *active* key; previous keys are
//! retained as *retired* so that records written before a rotation stay
//! readable until they are re-encrypted. The ring persists as a JSON file
//! in the data directory with owner-only permissions.

use std::fmt;
use std::io::Write;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};

/// Lifecycle status of a master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// The key new records are encrypted with.
    Active,
    /// A historical key kept for decrypting old records.
    Retired,
}

/// 32 bytes of AES-256 key material, zeroed on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
struct KeyMaterial([u8; 32]);

/// A single master encryption key.
#[derive(Clone, Serialize, Deserialize)]
pub struct MasterKey {
    /// Stable identifier, referenced by audit entries and lock files.
    pub key_id: String,
    /// Raw key bytes, serialized as base64.
    #[serde(with = "material_base64")]
    material: KeyMaterial,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Active or retired.
    pub status: KeyStatus,
}

impl MasterKey {
    /// Generate a fresh random key, born active.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            key_id: uuid_like_id(),
            material: KeyMaterial(bytes),
            created_at: Utc::now(),
            status: KeyStatus::Active,
        }
    }

    /// Build a key from base64-encoded 32-byte material (the
    /// `MCP_CREDS_KEY` form).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the encoding is bad or the
    /// decoded material is not exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("bad base64: {e}")))?;
        let material: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("key must be exactly 32 bytes".into()))?;
        Ok(Self {
            key_id: uuid_like_id(),
            material: KeyMaterial(material),
            created_at: Utc::now(),
            status: KeyStatus::Active,
        })
    }

    /// The raw key bytes.
    #[must_use]
    pub fn material(&self) -> &[u8; 32] {
        &self.material.0
    }

    /// Whether this is the active key.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("key_id", &self.key_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// The full key history: every key ever active, exactly one still active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRing {
    keys: Vec<MasterKey>,
}

impl KeyRing {
    /// Start a ring with a single active key.
    #[must_use]
    pub fn new(initial: MasterKey) -> Self {
        let mut initial = initial;
        initial.status = KeyStatus::Active;
        Self {
            keys: vec![initial],
        }
    }

    /// The currently active key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyRing`] if the invariant of exactly one
    /// active key is broken (corrupted ring file).
    pub fn active(&self) -> CryptoResult<&MasterKey> {
        let mut active = self.keys.iter().filter(|k| k.is_active());
        match (active.next(), active.next()) {
            (Some(key), None) => Ok(key),
            (None, _) => Err(CryptoError::KeyRing("no active key".into())),
            (Some(_), Some(_)) => Err(CryptoError::KeyRing("multiple active keys".into())),
        }
    }

    /// Look up a key by ID, active or retired.
    #[must_use]
    pub fn get(&self, key_id: &str) -> Option<&MasterKey> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }

    /// All keys, newest last.
    #[must_use]
    pub fn keys(&self) -> &[MasterKey] {
        &self.keys
    }

    /// Retire the active key and install a new active one.
    pub fn rotate(&mut self, new_key: MasterKey) {
        for key in &mut self.keys {
            key.status = KeyStatus::Retired;
        }
        let mut new_key = new_key;
        new_key.status = KeyStatus::Active;
        self.keys.push(new_key);
    }

    /// Load a ring from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let ring: Self = serde_json::from_str(&content)
            .map_err(|e| CryptoError::KeyRing(format!("parse {}: {e}", path.display())))?;
        ring.active()?;
        Ok(ring)
    }

    /// Persist the ring atomically with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> CryptoResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let body = serde_json::to_string_pretty(self)
            .map_err(|e| CryptoError::KeyRing(format!("serialize: {e}")))?;

        let parent = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(path)
            .map_err(|e| CryptoError::KeyRing(format!("replace {}: {e}", path.display())))?;
        debug!(path = %path.display(), keys = self.keys.len(), "Saved key ring");
        Ok(())
    }
}

mod material_base64 {
    use super::{BASE64, KeyMaterial};
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        material: &KeyMaterial,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(material.0))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<KeyMaterial, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(&s).map_err(serde::de::Error::custom)?;
        let material: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("key must be exactly 32 bytes"))?;
        Ok(KeyMaterial(material))
    }
}

/// Random hex key ID (16 bytes), stable and filename-safe.
fn uuid_like_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_active_after_rotation() {
        let mut ring = KeyRing::new(MasterKey::generate());
        let first_id = ring.active().unwrap().key_id.clone();

        ring.rotate(MasterKey::generate());
        let active = ring.active().unwrap();
        assert_ne!(active.key_id, first_id);
        assert_eq!(ring.keys().len(), 2);
        assert_eq!(
            ring.keys().iter().filter(|k| k.is_active()).count(),
            1
        );
        // The retired key is still resolvable by ID.
        assert!(ring.get(&first_id).is_some());
    }

    #[test]
    fn from_base64_enforces_length() {
        let good = BASE64.encode([7u8; 32]);
        assert!(MasterKey::from_base64(&good).is_ok());
        let short = BASE64.encode([7u8; 16]);
        assert!(MasterKey::from_base64(&short).is_err());
        assert!(MasterKey::from_base64("not base64!!").is_err());
    }

    #[test]
    fn ring_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault-keys.json");

        let mut ring = KeyRing::new(MasterKey::generate());
        ring.rotate(MasterKey::generate());
        ring.save(&path).unwrap();

        let loaded = KeyRing::load(&path).unwrap();
        assert_eq!(loaded.keys().len(), 2);
        assert_eq!(
            loaded.active().unwrap().key_id,
            ring.active().unwrap().key_id
        );
        assert_eq!(
            loaded.active().unwrap().material(),
            ring.active().unwrap().material()
        );
    }

    #[cfg(unix)]
    #[test]
    fn ring_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault-keys.json");
        KeyRing::new(MasterKey::generate()).save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
