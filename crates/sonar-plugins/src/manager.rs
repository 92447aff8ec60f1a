//! The plugin manager.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sonar_audit::{AuditAction, AuditLog};
use sonar_crypto::{TrustedKeys, hash_dist_tree};
use sonar_registry::Registry;

use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::lockfile::PluginLock;
use crate::manifest::PluginManifest;
use crate::state::PluginState;
use crate::{DIST_DIR, LOCK_FILE, MANIFEST_FILE};

/// Signature policy for plugin loading.
#[derive(Debug, Default)]
pub struct PluginPolicy {
    /// When true, `load` requires a present, verifiable signature.
    pub require_signature: bool,
    /// The configured trusted public keys.
    pub trusted_keys: TrustedKeys,
}

/// Public view of a plugin record, as returned by `plugin_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// `name@version`.
    pub id: String,
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Category directory the plugin was discovered under.
    pub category: String,
    /// Current lifecycle state.
    pub state: PluginState,
    /// Last failure, retained across retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct PluginRecord {
    manifest: PluginManifest,
    dir: PathBuf,
    category: String,
    state: PluginState,
    last_error: Option<String>,
    instance: Option<Box<dyn sonar_registry::ToolModule>>,
}

impl PluginRecord {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            category: self.category.clone(),
            state: self.state,
            last_error: self.last_error.clone(),
        }
    }

    fn module_name(&self) -> String {
        format!("plugin:{}", self.manifest.id())
    }
}

/// Discovers, validates, and runs plugins.
///
/// State is rebuilt across process restarts by re-running
/// [`discover`](Self::discover), which replays manifest validation,
/// integrity hashing, and lock-drift checks from the on-disk layout.
pub struct PluginManager {
    root: PathBuf,
    policy: PluginPolicy,
    registry: Arc<Registry>,
    host: Arc<dyn PluginHost>,
    audit: Arc<AuditLog>,
    plugins: RwLock<HashMap<String, PluginRecord>>,
}

impl PluginManager {
    /// Create a manager over a plugins root directory.
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        policy: PluginPolicy,
        registry: Arc<Registry>,
        host: Arc<dyn PluginHost>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            root: root.into(),
            policy,
            registry,
            host,
            audit,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Scan `<root>/<category>/<plugin-dir>/` for manifests.
    ///
    /// Each plugin is validated independently: a broken one is recorded
    /// as `Failed` with the full error list and the scan continues.
    /// Plugins currently `Loaded`/`Active`/`Inactive` are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error only if the root directory itself is unreadable.
    pub fn discover(&self) -> PluginResult<Vec<PluginInfo>> {
        let mut discovered = Vec::new();
        if !self.root.is_dir() {
            debug!(root = %self.root.display(), "Plugins root absent, nothing to discover");
            return Ok(discovered);
        }

        for category_entry in std::fs::read_dir(&self.root)? {
            let category_entry = category_entry?;
            if !category_entry.file_type()?.is_dir() {
                continue;
            }
            let category = category_entry.file_name().to_string_lossy().into_owned();

            for plugin_entry in std::fs::read_dir(category_entry.path())? {
                let plugin_entry = plugin_entry?;
                if !plugin_entry.file_type()?.is_dir() {
                    continue;
                }
                let dir = plugin_entry.path();
                if !dir.join(MANIFEST_FILE).is_file() {
                    continue;
                }
                match self.discover_one(&dir, &category) {
                    Ok(Some(info)) => discovered.push(info),
                    Ok(None) => {},
                    Err(e) => {
                        // Manifest too broken to even name the plugin.
                        warn!(dir = %dir.display(), error = %e, "Skipping plugin directory");
                    },
                }
            }
        }

        info!(count = discovered.len(), "Plugin discovery complete");
        Ok(discovered)
    }

    fn discover_one(&self, dir: &Path, category: &str) -> PluginResult<Option<PluginInfo>> {
        let manifest = PluginManifest::load(&dir.join(MANIFEST_FILE))?;
        let id = manifest.id();

        {
            let plugins = self.read();
            if plugins.get(&id).is_some_and(|record| {
                matches!(
                    record.state,
                    PluginState::Loaded | PluginState::Active | PluginState::Inactive
                )
            }) {
                debug!(plugin = %id, "Already running, leaving record untouched");
                return Ok(None);
            }
        }

        let mut record = PluginRecord {
            manifest,
            dir: dir.to_path_buf(),
            category: category.to_string(),
            state: PluginState::Discovered,
            last_error: None,
            instance: None,
        };

        match self.validate_record(&record) {
            Ok(()) => {
                record.state = PluginState::Validated;
            },
            Err(e) => {
                record.state = PluginState::Failed;
                record.last_error = Some(e.to_string());
                warn!(plugin = %id, error = %e, "Plugin failed validation");
            },
        }

        let info = record.info();
        self.write().insert(id, record);
        Ok(Some(info))
    }

    /// Manifest, integrity, and lock-drift validation for one plugin.
    fn validate_record(&self, record: &PluginRecord) -> PluginResult<()> {
        record.manifest.validate()?;

        let id = record.manifest.id();
        let observed = hash_dist_tree(&record.dir.join(DIST_DIR))?;
        if observed.hash != record.manifest.dist.hash {
            return Err(PluginError::Integrity {
                id,
                expected: record.manifest.dist.hash.clone(),
                actual: observed.hash,
            });
        }

        if let Some(lock) = PluginLock::load(&record.dir.join(LOCK_FILE))? {
            lock.check_drift(&id, &observed)?;
        }
        Ok(())
    }

    /// Load a plugin: signature policy, re-verified integrity, lock
    /// write, instantiation. `Validated → Loaded`.
    ///
    /// # Errors
    ///
    /// `Unsigned`/`BadSignature` under the signature policy,
    /// `Integrity`/`Drift` when the tree moved since validation,
    /// `IllegalState` from any state but `Validated`. Failures leave the
    /// plugin `Failed` with `last_error` set.
    pub fn load(&self, id: &str) -> PluginResult<PluginInfo> {
        self.transition(id, PluginState::Loaded, AuditAction::PluginLoad, |record| {
            check_signature(&self.policy, &record.manifest)?;

            // The tree may have moved between discovery and load.
            let observed = hash_dist_tree(&record.dir.join(DIST_DIR))?;
            if observed.hash != record.manifest.dist.hash {
                return Err(PluginError::Integrity {
                    id: record.manifest.id(),
                    expected: record.manifest.dist.hash.clone(),
                    actual: observed.hash,
                });
            }
            let lock_path = record.dir.join(LOCK_FILE);
            if let Some(lock) = PluginLock::load(&lock_path)? {
                lock.check_drift(&record.manifest.id(), &observed)?;
            }
            let fingerprint = record
                .manifest
                .signature
                .as_ref()
                .map(|s| s.public_key_id.clone());
            PluginLock::new(observed, fingerprint).save(&lock_path)?;

            let instance = self.host.instantiate(&record.manifest, &record.dir)?;
            record.instance = Some(instance);
            Ok(())
        })
    }

    /// Expose the plugin's tools to the dispatcher. `Loaded/Inactive → Active`.
    ///
    /// # Errors
    ///
    /// `IllegalState` from other states; registry failures mark the
    /// plugin `Failed` with its registrations rolled back.
    pub fn activate(&self, id: &str) -> PluginResult<PluginInfo> {
        self.transition(
            id,
            PluginState::Active,
            AuditAction::PluginActivate,
            |record| {
                let Some(instance) = record.instance.as_ref() else {
                    return Err(PluginError::LoadFailed {
                        id: record.manifest.id(),
                        message: "no instance to activate".into(),
                    });
                };
                let module = record.module_name();
                self.registry
                    .start_module(&module, &record.category, None)?;
                if let Err(e) = instance
                    .register(&self.registry)
                    .and_then(|()| self.registry.complete_module(&module))
                {
                    self.registry.fail_module(&module, e.to_string());
                    return Err(e.into());
                }
                Ok(())
            },
        )
    }

    /// Withdraw the plugin's tools. `Active → Inactive`.
    ///
    /// # Errors
    ///
    /// `IllegalState` from other states.
    pub fn deactivate(&self, id: &str) -> PluginResult<PluginInfo> {
        self.transition(
            id,
            PluginState::Inactive,
            AuditAction::PluginDeactivate,
            |record| {
                self.registry.unload_module(&record.module_name())?;
                Ok(())
            },
        )
    }

    /// Drop the plugin instance. `Loaded/Inactive → Unloaded`.
    ///
    /// # Errors
    ///
    /// `IllegalState` from other states (an `Active` plugin must be
    /// deactivated first).
    pub fn unload(&self, id: &str) -> PluginResult<PluginInfo> {
        self.transition(
            id,
            PluginState::Unloaded,
            AuditAction::PluginUnload,
            |record| {
                record.instance = None;
                Ok(())
            },
        )
    }

    /// Public snapshots of every plugin record, sorted by ID.
    #[must_use]
    pub fn list(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> =
            self.read().values().map(PluginRecord::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// One plugin's snapshot.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PluginInfo> {
        self.read().get(id).map(PluginRecord::info)
    }

    /// Run a state transition with audit and failure bookkeeping.
    fn transition<F>(
        &self,
        id: &str,
        target: PluginState,
        action: AuditAction,
        operation: F,
    ) -> PluginResult<PluginInfo>
    where
        F: FnOnce(&mut PluginRecord) -> PluginResult<()>,
    {
        let mut plugins = self.write();
        let record = plugins
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        if !record.state.can_transition(target) {
            let err = PluginError::IllegalState {
                id: id.to_string(),
                state: record.state.to_string(),
                operation: target.to_string(),
            };
            self.audit
                .record_failure("system", action, id, err.to_string())?;
            return Err(err);
        }

        match operation(record) {
            Ok(()) => {
                record.state = target;
                self.audit.record("system", action, id)?;
                info!(plugin = id, state = %target, "Plugin transition");
                Ok(record.info())
            },
            Err(e) => {
                record.state = PluginState::Failed;
                record.last_error = Some(short_error(&e));
                record.instance = None;
                self.audit
                    .record_failure("system", action, id, e.to_string())?;
                Err(e)
            },
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PluginRecord>> {
        self.plugins
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PluginRecord>> {
        self.plugins
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("root", &self.root)
            .field("plugins", &self.read().len())
            .finish_non_exhaustive()
    }
}

fn check_signature(policy: &PluginPolicy, manifest: &PluginManifest) -> PluginResult<()> {
    match &manifest.signature {
        None if policy.require_signature => Err(PluginError::Unsigned(manifest.id())),
        None => Ok(()),
        Some(signature) => policy
            .trusted_keys
            .verify(
                &signature.algorithm,
                &signature.public_key_id,
                manifest.dist.hash.as_bytes(),
                &signature.value,
            )
            .map_err(|e| PluginError::BadSignature {
                id: manifest.id(),
                message: e.to_string(),
            }),
    }
}

/// Compress an error to its stable prefix for `last_error` (the audit
/// log keeps the full text).
fn short_error(e: &PluginError) -> String {
    match e {
        PluginError::Unsigned(_) => "unsigned".to_string(),
        PluginError::BadSignature { .. } => "bad signature".to_string(),
        PluginError::Integrity { .. } => "integrity mismatch".to_string(),
        PluginError::Drift { details, .. } => format!("lock drift: {details}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;
    use sonar_audit::{AuditLog, MemorySink};
    use sonar_core::{ObjectShape, SchemaShape, ToolResult};
    use sonar_registry::{
        NotificationHub, RegistryResult, ToolContext, ToolHandler, ToolModule, ToolRegistration,
    };

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn call(
            &self,
            _ctx: &ToolContext,
            _params: serde_json::Value,
        ) -> Result<ToolResult, String> {
            Ok(ToolResult::text("ok"))
        }
    }

    struct TestPluginModule {
        module: String,
        tool: String,
    }

    impl ToolModule for TestPluginModule {
        fn name(&self) -> &str {
            &self.module
        }

        fn category(&self) -> &str {
            "discovery"
        }

        fn register(&self, registry: &Registry) -> RegistryResult<()> {
            registry.register_tool(ToolRegistration {
                name: self.tool.clone(),
                description: "plugin tool".into(),
                schema: SchemaShape::of(ObjectShape::new()),
                category: "discovery".into(),
                module_origin: self.module.clone(),
                handler: Arc::new(NoopHandler),
            })
        }
    }

    struct TestHost;

    impl PluginHost for TestHost {
        fn instantiate(
            &self,
            manifest: &PluginManifest,
            _plugin_dir: &Path,
        ) -> PluginResult<Box<dyn ToolModule>> {
            Ok(Box::new(TestPluginModule {
                module: format!("plugin:{}", manifest.id()),
                tool: format!("{}_probe", manifest.name.replace('-', "_")),
            }))
        }
    }

    /// Write a plugin directory with a manifest whose dist hash matches
    /// the files on disk. Returns the plugin ID.
    fn write_plugin(
        root: &Path,
        category: &str,
        name: &str,
        signature: Option<serde_json::Value>,
    ) -> String {
        let dir = root.join(category).join(name);
        std::fs::create_dir_all(dir.join("dist/sub")).unwrap();
        std::fs::write(dir.join("dist/a.txt"), b"hello").unwrap();
        std::fs::write(dir.join("dist/sub/b.bin"), [1u8, 2, 3, 4, 5]).unwrap();

        let dist = hash_dist_tree(&dir.join("dist")).unwrap();
        let mut manifest = json!({
            "manifestVersion": "2",
            "name": name,
            "version": "1.0.0",
            "entry": "dist/a.txt",
            "dependenciesPolicy": "bundled-only",
            "dist": {
                "hash": dist.hash,
                "fileCount": dist.file_count,
                "totalBytes": dist.total_bytes,
            },
        });
        if let Some(signature) = signature {
            manifest["signature"] = signature;
        }
        std::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
        format!("{name}@1.0.0")
    }

    fn manager(root: &Path, policy: PluginPolicy) -> (PluginManager, Arc<Registry>) {
        let registry = Arc::new(Registry::new(Arc::new(NotificationHub::new())));
        let audit = Arc::new(AuditLog::new(Box::new(MemorySink::new())).unwrap());
        (
            PluginManager::new(root, policy, Arc::clone(&registry), Arc::new(TestHost), audit),
            registry,
        )
    }

    #[test]
    fn discover_load_activate_exposes_tools() {
        let root = tempfile::tempdir().unwrap();
        let id = write_plugin(root.path(), "network", "port-sweep", None);
        let (manager, registry) = manager(root.path(), PluginPolicy::default());

        let discovered = manager.discover().unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].state, PluginState::Validated);

        manager.load(&id).unwrap();
        assert_eq!(manager.get(&id).unwrap().state, PluginState::Loaded);
        assert!(registry.lookup_tool("port_sweep_probe").is_none());

        manager.activate(&id).unwrap();
        assert!(registry.lookup_tool("port_sweep_probe").is_some());

        manager.deactivate(&id).unwrap();
        assert!(registry.lookup_tool("port_sweep_probe").is_none());

        manager.unload(&id).unwrap();
        assert_eq!(manager.get(&id).unwrap().state, PluginState::Unloaded);
    }

    #[test]
    fn integrity_drift_blocks_load_and_fails_plugin() {
        let root = tempfile::tempdir().unwrap();
        let id = write_plugin(root.path(), "network", "drifty", None);
        let (manager, _registry) = manager(root.path(), PluginPolicy::default());
        manager.discover().unwrap();
        manager.load(&id).unwrap();
        manager.unload(&id).unwrap();

        // Append a byte to a dist file after the lock was written.
        let file = root.path().join("network/drifty/dist/a.txt");
        let mut contents = std::fs::read(&file).unwrap();
        contents.push(b'!');
        std::fs::write(&file, contents).unwrap();

        // Re-discovery replays lock validation and records the drift.
        let discovered = manager.discover().unwrap();
        assert_eq!(discovered[0].state, PluginState::Failed);
        let error = discovered[0].last_error.as_deref().unwrap();
        assert!(error.contains("integrity") || error.contains("drift"), "{error}");
    }

    #[test]
    fn unsigned_plugin_blocked_when_policy_requires_signature() {
        let root = tempfile::tempdir().unwrap();
        let id = write_plugin(root.path(), "network", "bare", None);
        let (manager, registry) = manager(
            root.path(),
            PluginPolicy {
                require_signature: true,
                trusted_keys: TrustedKeys::new(),
            },
        );
        manager.discover().unwrap();

        let err = manager.load(&id).unwrap_err();
        assert!(matches!(err, PluginError::Unsigned(_)));

        let listed = manager.list();
        assert_eq!(listed[0].state, PluginState::Failed);
        assert_eq!(listed[0].last_error.as_deref(), Some("unsigned"));
        assert!(registry.list_tools().is_empty());
    }

    #[test]
    fn valid_signature_loads_under_strict_policy() {
        let root = tempfile::tempdir().unwrap();
        let signing = SigningKey::from_bytes(&[9u8; 32]);

        // Two passes: write once to learn the hash, then sign it.
        let id = write_plugin(root.path(), "network", "signed", None);
        let manifest_path = root.path().join("network/signed").join(MANIFEST_FILE);
        let manifest = PluginManifest::load(&manifest_path).unwrap();
        let sig = BASE64.encode(signing.sign(manifest.dist.hash.as_bytes()).to_bytes());
        write_plugin(
            root.path(),
            "network",
            "signed",
            Some(json!({
                "algorithm": "ed25519",
                "publicKeyId": "release",
                "value": sig,
            })),
        );

        let mut trusted = TrustedKeys::new();
        trusted.add("release", signing.verifying_key());
        let (manager, _registry) = manager(
            root.path(),
            PluginPolicy {
                require_signature: true,
                trusted_keys: trusted,
            },
        );
        manager.discover().unwrap();
        manager.load(&id).unwrap();
        assert_eq!(manager.get(&id).unwrap().state, PluginState::Loaded);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let signing = SigningKey::from_bytes(&[9u8; 32]);
        let other = SigningKey::from_bytes(&[7u8; 32]);

        let id = write_plugin(root.path(), "network", "forged", None);
        let manifest_path = root.path().join("network/forged").join(MANIFEST_FILE);
        let manifest = PluginManifest::load(&manifest_path).unwrap();
        // Signed by a key other than the trusted one.
        let sig = BASE64.encode(other.sign(manifest.dist.hash.as_bytes()).to_bytes());
        write_plugin(
            root.path(),
            "network",
            "forged",
            Some(json!({
                "algorithm": "ed25519",
                "publicKeyId": "release",
                "value": sig,
            })),
        );

        let mut trusted = TrustedKeys::new();
        trusted.add("release", signing.verifying_key());
        let (manager, _registry) = manager(
            root.path(),
            PluginPolicy {
                require_signature: true,
                trusted_keys: trusted,
            },
        );
        manager.discover().unwrap();
        assert!(matches!(
            manager.load(&id).unwrap_err(),
            PluginError::BadSignature { .. }
        ));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let id = write_plugin(root.path(), "network", "strict", None);
        let (manager, _registry) = manager(root.path(), PluginPolicy::default());
        manager.discover().unwrap();

        // Validated → Active skips Loaded.
        assert!(matches!(
            manager.activate(&id).unwrap_err(),
            PluginError::IllegalState { .. }
        ));
        manager.load(&id).unwrap();
        manager.activate(&id).unwrap();
        // Active → Unloaded must go through deactivate.
        assert!(matches!(
            manager.unload(&id).unwrap_err(),
            PluginError::IllegalState { .. }
        ));
    }

    #[test]
    fn one_broken_plugin_does_not_block_others() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(root.path(), "network", "good", None);

        let bad_dir = root.path().join("network/bad");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join(MANIFEST_FILE), "{broken json").unwrap();

        let (manager, _registry) = manager(root.path(), PluginPolicy::default());
        let discovered = manager.discover().unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, "good");
        assert_eq!(discovered[0].state, PluginState::Validated);
    }
}
