//! Plugin manifest (v2) types and validation.
//!
//! A manifest (`mcp-plugin.json`) declares a plugin's identity, entry
//! point, dependency policy, content-addressed dist identity, and an
//! optional detached signature. Validation collects *all* problems
//! before failing so a broken plugin reports everything at once.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// The manifest schema version this manager understands.
pub const MANIFEST_VERSION: &str = "2";

/// How a plugin may resolve its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependenciesPolicy {
    /// Everything the plugin needs ships inside `dist/`.
    BundledOnly,
    /// The plugin has no dependencies.
    None,
}

/// The content-addressed identity of the dist tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistDeclaration {
    /// `sha256:<hex>` over the sorted tree.
    pub hash: String,
    /// Number of files in the tree.
    pub file_count: usize,
    /// Sum of file sizes in bytes.
    pub total_bytes: u64,
}

/// A detached signature over the dist-hash string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSignature {
    /// Signature algorithm; only `ed25519` is accepted.
    pub algorithm: String,
    /// Which configured trusted key signed it.
    pub public_key_id: String,
    /// Base64 signature bytes.
    pub value: String,
}

/// A plugin manifest, loaded from `mcp-plugin.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Manifest schema version; must be `"2"`.
    pub manifest_version: String,
    /// Plugin name (lowercase alphanumerics and hyphens).
    pub name: String,
    /// Semver version string.
    pub version: String,
    /// Entry file, relative to the plugin directory.
    pub entry: String,
    /// Dependency policy.
    pub dependencies_policy: DependenciesPolicy,
    /// Content-addressed dist identity.
    pub dist: DistDeclaration,
    /// Optional detached signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<ManifestSignature>,
}

impl PluginManifest {
    /// The plugin's identity: `name@version`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Load and parse a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParse`] for unreadable or
    /// syntactically invalid files. Semantic validation is separate —
    /// call [`validate`](Self::validate).
    pub fn load(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PluginError::ManifestParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| PluginError::ManifestParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate the manifest, collecting every problem.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestInvalid`] with the full list.
    pub fn validate(&self) -> PluginResult<()> {
        let mut problems = Vec::new();

        if self.manifest_version != MANIFEST_VERSION {
            problems.push(format!(
                "manifestVersion must be \"{MANIFEST_VERSION}\", got \"{}\"",
                self.manifest_version
            ));
        }

        if self.name.is_empty() {
            problems.push("name must not be empty".to_string());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.name.starts_with('-')
            || self.name.ends_with('-')
        {
            problems.push(format!(
                "name must be lowercase alphanumerics and interior hyphens, got \"{}\"",
                self.name
            ));
        }

        if semver::Version::parse(&self.version).is_err() {
            problems.push(format!("version \"{}\" is not valid semver", self.version));
        }

        if self.entry.is_empty() {
            problems.push("entry must not be empty".to_string());
        } else {
            let entry = Path::new(&self.entry);
            if entry.is_absolute()
                || entry
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                problems.push(format!(
                    "entry must be a relative path inside the plugin, got \"{}\"",
                    self.entry
                ));
            }
        }

        if !is_sha256_form(&self.dist.hash) {
            problems.push(format!(
                "dist.hash must be sha256:<64 hex chars>, got \"{}\"",
                self.dist.hash
            ));
        }

        if let Some(signature) = &self.signature {
            if signature.public_key_id.is_empty() {
                problems.push("signature.publicKeyId must not be empty".to_string());
            }
            if signature.value.is_empty() {
                problems.push("signature.value must not be empty".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PluginError::ManifestInvalid {
                id: self.id(),
                problems,
            })
        }
    }
}

fn is_sha256_form(hash: &str) -> bool {
    hash.strip_prefix("sha256:").is_some_and(|hex| {
        hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json(version: &str, dist_hash: &str) -> String {
        format!(
            r#"{{
                "manifestVersion": "2",
                "name": "snmp-extras",
                "version": "{version}",
                "entry": "dist/index.js",
                "dependenciesPolicy": "bundled-only",
                "dist": {{
                    "hash": "{dist_hash}",
                    "fileCount": 2,
                    "totalBytes": 10
                }}
            }}"#
        )
    }

    const GOOD_HASH: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn valid_manifest_parses_and_validates() {
        let manifest: PluginManifest =
            serde_json::from_str(&manifest_json("1.2.3", GOOD_HASH)).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.id(), "snmp-extras@1.2.3");
        assert_eq!(manifest.dependencies_policy, DependenciesPolicy::BundledOnly);
    }

    #[test]
    fn validation_collects_all_problems() {
        let raw = r#"{
            "manifestVersion": "1",
            "name": "Bad Name",
            "version": "not-semver",
            "entry": "../escape.js",
            "dependenciesPolicy": "none",
            "dist": {"hash": "md5:abc", "fileCount": 0, "totalBytes": 0}
        }"#;
        let manifest: PluginManifest = serde_json::from_str(raw).unwrap();
        let err = manifest.validate().unwrap_err();
        match err {
            PluginError::ManifestInvalid { problems, .. } => {
                assert_eq!(problems.len(), 5, "{problems:?}");
            },
            other => panic!("expected ManifestInvalid, got {other}"),
        }
    }

    #[test]
    fn dist_hash_form_is_strict() {
        for bad in [
            "sha256:short",
            "sha1:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855",
        ] {
            let manifest: PluginManifest =
                serde_json::from_str(&manifest_json("1.0.0", bad)).unwrap();
            assert!(manifest.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn signature_round_trips() {
        let raw = format!(
            r#"{{
                "manifestVersion": "2",
                "name": "signed",
                "version": "0.1.0",
                "entry": "dist/main.js",
                "dependenciesPolicy": "none",
                "dist": {{"hash": "{GOOD_HASH}", "fileCount": 0, "totalBytes": 0}},
                "signature": {{
                    "algorithm": "ed25519",
                    "publicKeyId": "release-key",
                    "value": "AAAA"
                }}
            }}"#
        );
        let manifest: PluginManifest = serde_json::from_str(&raw).unwrap();
        manifest.validate().unwrap();
        let back = serde_json::to_value(&manifest).unwrap();
        assert_eq!(back["signature"]["publicKeyId"], "release-key");
    }

    #[test]
    fn missing_required_field_is_a_parse_error() {
        let raw = r#"{"manifestVersion": "2", "name": "x"}"#;
        assert!(serde_json::from_str::<PluginManifest>(raw).is_err());
    }
}
