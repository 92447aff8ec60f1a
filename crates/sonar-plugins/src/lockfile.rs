//! The per-plugin lock file.
//!
//! Written next to the manifest when a plugin loads, recording the dist
//! metadata observed at that moment. On subsequent loads the tree is
//! rehashed and compared; any drift (byte change, missing file, extra
//! file) blocks the load until the operator re-installs or re-signs.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sonar_crypto::DistInfo;

use crate::error::{PluginError, PluginResult};

/// A plugin lock file (`mcp-plugin.lock.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginLock {
    /// The dist metadata observed at load time.
    pub observed_dist: DistInfo,
    /// When the lock was written.
    pub timestamp: DateTime<Utc>,
    /// Fingerprint of the signing key, when the plugin was signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,
}

impl PluginLock {
    /// Build a lock for the observed dist.
    #[must_use]
    pub fn new(observed_dist: DistInfo, key_fingerprint: Option<String>) -> Self {
        Self {
            observed_dist,
            timestamp: Utc::now(),
            key_fingerprint,
        }
    }

    /// Load a lock file. Returns `Ok(None)` when none exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] for unreadable or unparsable
    /// files.
    pub fn load(path: &Path) -> PluginResult<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PluginError::Lockfile {
                    path: path.to_path_buf(),
                    message: format!("read: {e}"),
                });
            },
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| PluginError::Lockfile {
                path: path.to_path_buf(),
                message: format!("parse: {e}"),
            })
    }

    /// Write the lock atomically (temp file + rename).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> PluginResult<()> {
        let body =
            serde_json::to_string_pretty(self).map_err(|e| PluginError::Lockfile {
                path: path.to_path_buf(),
                message: format!("serialize: {e}"),
            })?;

        let parent = path.parent().unwrap_or(Path::new("."));
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| PluginError::Lockfile {
                path: path.to_path_buf(),
                message: format!("temp file: {e}"),
            })?;
        tmp.write_all(body.as_bytes())
            .map_err(|e| PluginError::Lockfile {
                path: path.to_path_buf(),
                message: format!("write: {e}"),
            })?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| PluginError::Lockfile {
                path: path.to_path_buf(),
                message: format!("sync: {e}"),
            })?;
        tmp.persist(path).map_err(|e| PluginError::Lockfile {
            path: path.to_path_buf(),
            message: format!("replace: {e}"),
        })?;
        debug!(path = %path.display(), "Wrote plugin lock");
        Ok(())
    }

    /// Compare the locked dist against the currently observed one.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Drift`] describing exactly what moved.
    pub fn check_drift(&self, plugin_id: &str, current: &DistInfo) -> PluginResult<()> {
        if self.observed_dist == *current {
            return Ok(());
        }
        let mut details = Vec::new();
        if self.observed_dist.hash != current.hash {
            details.push(format!(
                "hash {} -> {}",
                self.observed_dist.hash, current.hash
            ));
        }
        if self.observed_dist.file_count != current.file_count {
            details.push(format!(
                "file count {} -> {}",
                self.observed_dist.file_count, current.file_count
            ));
        }
        if self.observed_dist.total_bytes != current.total_bytes {
            details.push(format!(
                "total bytes {} -> {}",
                self.observed_dist.total_bytes, current.total_bytes
            ));
        }
        Err(PluginError::Drift {
            id: plugin_id.to_string(),
            details: details.join(", "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(hash: &str, files: usize, bytes: u64) -> DistInfo {
        DistInfo {
            hash: format!("sha256:{hash}"),
            file_count: files,
            total_bytes: bytes,
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-plugin.lock.json");
        let lock = PluginLock::new(dist("aa", 2, 10), Some("release-key".into()));
        lock.save(&path).unwrap();

        let loaded = PluginLock::load(&path).unwrap().unwrap();
        assert_eq!(loaded, lock);
    }

    #[test]
    fn missing_lock_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            PluginLock::load(&dir.path().join("mcp-plugin.lock.json"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn drift_names_every_difference() {
        let lock = PluginLock::new(dist("aa", 2, 10), None);
        lock.check_drift("p@1.0.0", &dist("aa", 2, 10)).unwrap();

        let err = lock.check_drift("p@1.0.0", &dist("bb", 3, 12)).unwrap_err();
        match err {
            PluginError::Drift { details, .. } => {
                assert!(details.contains("hash"));
                assert!(details.contains("file count 2 -> 3"));
                assert!(details.contains("total bytes 10 -> 12"));
            },
            other => panic!("expected drift, got {other}"),
        }
    }

    #[test]
    fn corrupt_lock_is_an_error_not_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-plugin.lock.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            PluginLock::load(&path),
            Err(PluginError::Lockfile { .. })
        ));
    }
}
