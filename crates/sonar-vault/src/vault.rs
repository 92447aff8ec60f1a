//! The credential vault.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use sonar_audit::{AuditAction, AuditLog, AuditSink};
use sonar_crypto::{KeyRing, MasterKey, decrypt_field, encrypt_field};

use crate::error::{VaultError, VaultResult};
use crate::types::{Credential, CredentialMetadata, CredentialRecord, CredentialType};

/// Credential store file name inside the data directory.
const STORE_FILE: &str = "credentials.json";
/// Key ring file name inside the data directory.
const KEYS_FILE: &str = "vault-keys.json";

struct VaultState {
    ring: KeyRing,
    records: BTreeMap<String, CredentialRecord>,
}

/// Encrypted credential store.
///
/// All operations take the single vault mutex; key rotation holds it for
/// its whole decrypt/re-encrypt/persist cycle, so lookups never observe a
/// half-rotated store.
pub struct CredentialVault {
    store_path: PathBuf,
    keys_path: PathBuf,
    state: Mutex<VaultState>,
    audit: AuditLog,
}

impl CredentialVault {
    /// Open (or initialize) the vault in a data directory.
    ///
    /// The master key comes from `creds_key` (base64, the `MCP_CREDS_KEY`
    /// value) when provided and no ring exists yet; otherwise a ring is
    /// loaded from disk or a fresh key is generated and persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory, key ring, store file, or
    /// audit log cannot be set up.
    pub fn open(
        data_dir: &Path,
        creds_key: Option<&str>,
        audit_sink: Box<dyn AuditSink>,
    ) -> VaultResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let store_path = data_dir.join(STORE_FILE);
        let keys_path = data_dir.join(KEYS_FILE);
        let audit = AuditLog::new(audit_sink)?;

        let ring = if keys_path.exists() {
            KeyRing::load(&keys_path)?
        } else {
            let initial = match creds_key {
                Some(encoded) => MasterKey::from_base64(encoded)?,
                None => MasterKey::generate(),
            };
            let ring = KeyRing::new(initial);
            ring.save(&keys_path)?;
            audit.record("system", AuditAction::Initialize, "vault")?;
            info!(path = %keys_path.display(), "Initialized vault key ring");
            ring
        };

        let records = load_store(&store_path)?;
        debug!(records = records.len(), "Opened credential vault");

        Ok(Self {
            store_path,
            keys_path,
            state: Mutex::new(VaultState { ring, records }),
            audit,
        })
    }

    /// Add a credential. Secret fields are encrypted with the active key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Duplicate`] if the ID is taken, or an error
    /// if encryption or persistence fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        actor: &str,
        id: &str,
        credential_type: CredentialType,
        secret_fields: BTreeMap<String, String>,
        username: Option<String>,
        url: Option<String>,
        notes: Option<String>,
    ) -> VaultResult<CredentialMetadata> {
        let mut state = self.state.lock().await;

        if state.records.contains_key(id) {
            self.audit
                .record_failure(actor, AuditAction::Add, id, "duplicate id")?;
            return Err(VaultError::Duplicate(id.to_string()));
        }

        let active = state.ring.active()?;
        let mut encrypted = BTreeMap::new();
        for (field, plaintext) in &secret_fields {
            encrypted.insert(field.clone(), encrypt_field(active, plaintext.as_bytes())?);
        }

        let record = CredentialRecord {
            id: id.to_string(),
            credential_type,
            username,
            url,
            secret_fields: encrypted,
            key_id: active.key_id.clone(),
            notes,
            created_at: Utc::now(),
        };
        let metadata = record.metadata();

        state.records.insert(id.to_string(), record);
        if let Err(e) = persist_store(&self.store_path, &state.records) {
            // Roll the in-memory insert back so memory matches disk.
            state.records.remove(id);
            self.audit
                .record_failure(actor, AuditAction::Add, id, e.to_string())?;
            return Err(e);
        }

        self.audit.record(actor, AuditAction::Add, id)?;
        Ok(metadata)
    }

    /// Get a credential with decrypted secret fields.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] for unknown IDs, or a decryption
    /// error scoped to this record.
    pub async fn get(&self, actor: &str, id: &str) -> VaultResult<Credential> {
        let state = self.state.lock().await;

        let Some(record) = state.records.get(id) else {
            self.audit
                .record_failure(actor, AuditAction::Get, id, "not found")?;
            return Err(VaultError::NotFound(id.to_string()));
        };

        let key = state
            .ring
            .get(&record.key_id)
            .ok_or_else(|| VaultError::KeyMissing {
                id: id.to_string(),
                key_id: record.key_id.clone(),
            })?;

        let mut plaintext_fields = BTreeMap::new();
        for (field, stored) in &record.secret_fields {
            match decrypt_field(key, stored) {
                Ok(bytes) => {
                    plaintext_fields
                        .insert(field.clone(), String::from_utf8_lossy(&bytes).into_owned());
                },
                Err(e) => {
                    self.audit.record_failure(
                        actor,
                        AuditAction::Get,
                        id,
                        format!("field '{field}': {e}"),
                    )?;
                    return Err(e.into());
                },
            }
        }

        let credential = Credential {
            metadata: record.metadata(),
            secret_fields: plaintext_fields,
            notes: record.notes.clone(),
        };
        self.audit.record(actor, AuditAction::Get, id)?;
        Ok(credential)
    }

    /// List non-sensitive metadata, optionally filtered by type.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit append fails.
    pub async fn list(
        &self,
        actor: &str,
        credential_type: Option<CredentialType>,
    ) -> VaultResult<Vec<CredentialMetadata>> {
        let state = self.state.lock().await;
        let listed: Vec<CredentialMetadata> = state
            .records
            .values()
            .filter(|r| credential_type.is_none_or(|t| r.credential_type == t))
            .map(CredentialRecord::metadata)
            .collect();
        self.audit.record(actor, AuditAction::List, "vault")?;
        Ok(listed)
    }

    /// Remove a credential.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] for unknown IDs, or an error if
    /// persistence fails (the record is restored in memory).
    pub async fn remove(&self, actor: &str, id: &str) -> VaultResult<()> {
        let mut state = self.state.lock().await;

        let Some(removed) = state.records.remove(id) else {
            self.audit
                .record_failure(actor, AuditAction::Remove, id, "not found")?;
            return Err(VaultError::NotFound(id.to_string()));
        };

        if let Err(e) = persist_store(&self.store_path, &state.records) {
            state.records.insert(id.to_string(), removed);
            self.audit
                .record_failure(actor, AuditAction::Remove, id, e.to_string())?;
            return Err(e);
        }

        self.audit.record(actor, AuditAction::Remove, id)?;
        Ok(())
    }

    /// Rotate the master key.
    ///
    /// Decrypts every secret field with its record's key, re-encrypts with
    /// the new key into a staging map, persists the staged store, and only
    /// then installs the new key (old key retired, kept in history). Any
    /// failure aborts with the store and ring unchanged on disk and in
    /// memory.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::RotationAborted`] wrapping the cause.
    pub async fn rotate_key(
        &self,
        actor: &str,
        new_key: Option<MasterKey>,
    ) -> VaultResult<()> {
        let mut state = self.state.lock().await;
        let new_key = new_key.unwrap_or_else(MasterKey::generate);

        let staged = match self.re_encrypt_all(&state, &new_key) {
            Ok(staged) => staged,
            Err(e) => {
                self.audit
                    .record_failure(actor, AuditAction::Rotate, "vault", e.to_string())?;
                return Err(VaultError::RotationAborted(e.to_string()));
            },
        };

        // Persist the staged store first: if this fails the old store file
        // and the old active key are both still in place.
        if let Err(e) = persist_store(&self.store_path, &staged) {
            self.audit
                .record_failure(actor, AuditAction::Rotate, "vault", e.to_string())?;
            return Err(VaultError::RotationAborted(e.to_string()));
        }

        let mut new_ring = state.ring.clone();
        new_ring.rotate(new_key);
        if let Err(e) = new_ring.save(&self.keys_path) {
            // The staged store is written but every ciphertext in it still
            // decrypts via the (unchanged) ring once the new key is lost;
            // restore the previous store contents to keep disk and ring
            // consistent.
            let _ = persist_store(&self.store_path, &state.records);
            self.audit
                .record_failure(actor, AuditAction::Rotate, "vault", e.to_string())?;
            return Err(VaultError::RotationAborted(e.to_string()));
        }

        state.ring = new_ring;
        state.records = staged;
        self.audit.record(actor, AuditAction::Rotate, "vault")?;
        info!("Vault key rotated");
        Ok(())
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    /// Whether the vault is empty.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.records.is_empty()
    }

    /// The audit log backing this vault.
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// The ID of the currently active key.
    ///
    /// # Errors
    ///
    /// Returns an error if the ring invariant is broken.
    pub async fn active_key_id(&self) -> VaultResult<String> {
        Ok(self.state.lock().await.ring.active()?.key_id.clone())
    }

    fn re_encrypt_all(
        &self,
        state: &VaultState,
        new_key: &MasterKey,
    ) -> VaultResult<BTreeMap<String, CredentialRecord>> {
        let mut staged = BTreeMap::new();
        for (id, record) in &state.records {
            let old_key =
                state
                    .ring
                    .get(&record.key_id)
                    .ok_or_else(|| VaultError::KeyMissing {
                        id: id.clone(),
                        key_id: record.key_id.clone(),
                    })?;

            let mut re_encrypted = BTreeMap::new();
            for (field, stored) in &record.secret_fields {
                let plaintext = decrypt_field(old_key, stored)?;
                re_encrypted.insert(field.clone(), encrypt_field(new_key, &plaintext)?);
            }

            let mut record = record.clone();
            record.secret_fields = re_encrypted;
            record.key_id = new_key.key_id.clone();
            staged.insert(id.clone(), record);
        }
        Ok(staged)
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("store_path", &self.store_path)
            .finish_non_exhaustive()
    }
}

fn load_store(path: &Path) -> VaultResult<BTreeMap<String, CredentialRecord>> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map_err(|e| VaultError::Store(format!("parse {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(VaultError::Store(format!("read {}: {e}", path.display()))),
    }
}

fn persist_store(path: &Path, records: &BTreeMap<String, CredentialRecord>) -> VaultResult<()> {
    let body = serde_json::to_string_pretty(records)
        .map_err(|e| VaultError::Store(format!("serialize: {e}")))?;

    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| VaultError::Store(format!("temp file: {e}")))?;
    tmp.write_all(body.as_bytes())
        .map_err(|e| VaultError::Store(format!("write: {e}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| VaultError::Store(format!("sync: {e}")))?;
    tmp.persist(path)
        .map_err(|e| VaultError::Store(format!("replace {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_audit::MemorySink;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn open_vault(dir: &Path) -> CredentialVault {
        CredentialVault::open(dir, None, Box::new(MemorySink::new())).unwrap()
    }

    #[tokio::test]
    async fn add_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());

        vault
            .add(
                "system",
                "snmp-lab",
                CredentialType::Password,
                fields(&[("community", "public"), ("password", "hunter2")]),
                Some("monitor".into()),
                None,
                None,
            )
            .await
            .unwrap();

        let credential = vault.get("system", "snmp-lab").await.unwrap();
        assert_eq!(
            credential.secret_fields.get("password").map(String::as_str),
            Some("hunter2")
        );
        assert_eq!(credential.metadata.username.as_deref(), Some("monitor"));
    }

    #[tokio::test]
    async fn duplicate_add_rejected_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault
            .add("system", "c1", CredentialType::ApiKey, fields(&[("key", "k")]), None, None, None)
            .await
            .unwrap();
        let err = vault
            .add("system", "c1", CredentialType::ApiKey, fields(&[("key", "k")]), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Duplicate(_)));

        let entries = vault.audit().entries().unwrap();
        assert!(entries.iter().any(|e| !e.success && e.target_id == "c1"));
    }

    #[tokio::test]
    async fn list_returns_metadata_only_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        vault
            .add("system", "a", CredentialType::ApiKey, fields(&[("key", "x")]), None, None, None)
            .await
            .unwrap();
        vault
            .add("system", "b", CredentialType::SshKey, fields(&[("private", "y")]), None, None, None)
            .await
            .unwrap();

        let all = vault.list("system", None).await.unwrap();
        assert_eq!(all.len(), 2);
        let ssh = vault.list("system", Some(CredentialType::SshKey)).await.unwrap();
        assert_eq!(ssh.len(), 1);
        assert_eq!(ssh[0].id, "b");
    }

    #[tokio::test]
    async fn add_remove_restores_prior_state_with_two_audit_entries() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        let before = vault.list("system", None).await.unwrap();
        let audit_before = vault.audit().entries().unwrap().len();

        vault
            .add("system", "tmp", CredentialType::Custom, fields(&[("f", "v")]), None, None, None)
            .await
            .unwrap();
        vault.remove("system", "tmp").await.unwrap();

        // The audit log grew by exactly the add and the remove.
        let added = vault.audit().entries().unwrap().len() - audit_before;
        assert_eq!(added, 2);
        assert_eq!(vault.list("system", None).await.unwrap().len(), before.len());
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vault = open_vault(dir.path());
            vault
                .add(
                    "system",
                    "prox",
                    CredentialType::ApiKey,
                    fields(&[("token", "secret-token")]),
                    None,
                    Some("https://pve:8006".into()),
                    None,
                )
                .await
                .unwrap();
        }
        let vault = open_vault(dir.path());
        let credential = vault.get("system", "prox").await.unwrap();
        assert_eq!(
            credential.secret_fields.get("token").map(String::as_str),
            Some("secret-token")
        );
    }

    #[tokio::test]
    async fn rotation_re_encrypts_everything_under_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        for i in 0..3 {
            vault
                .add(
                    "system",
                    &format!("c{i}"),
                    CredentialType::Password,
                    fields(&[("password", &format!("pw-{i}"))]),
                    None,
                    None,
                    None,
                )
                .await
                .unwrap();
        }
        let old_key = vault.active_key_id().await.unwrap();

        vault.rotate_key("system", None).await.unwrap();

        let new_key = vault.active_key_id().await.unwrap();
        assert_ne!(old_key, new_key);
        for i in 0..3 {
            let credential = vault.get("system", &format!("c{i}")).await.unwrap();
            assert_eq!(
                credential.secret_fields.get("password").map(String::as_str),
                Some(format!("pw-{i}").as_str())
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_rotation_leaves_old_key_active_and_store_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(dir.path());
        for i in 0..3 {
            vault
                .add(
                    "system",
                    &format!("c{i}"),
                    CredentialType::Password,
                    fields(&[("password", &format!("pw-{i}"))]),
                    None,
                    None,
                    None,
                )
                .await
                .unwrap();
        }
        let old_key = vault.active_key_id().await.unwrap();

        // Make the data directory read-only so the staged store write fails.
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o500)).unwrap();
        let err = vault.rotate_key("system", None).await.unwrap_err();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700)).unwrap();
        assert!(matches!(err, VaultError::RotationAborted(_)));

        // Old key still active, every credential still decrypts.
        assert_eq!(vault.active_key_id().await.unwrap(), old_key);
        for i in 0..3 {
            assert!(vault.get("system", &format!("c{i}")).await.is_ok());
        }
        // The aborted rotation is on the audit trail.
        let entries = vault.audit().entries().unwrap();
        assert!(
            entries
                .iter()
                .any(|e| e.action == sonar_audit::AuditAction::Rotate && !e.success)
        );
    }
}
