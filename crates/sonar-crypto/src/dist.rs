//! Content addressing for plugin dist trees.
//!
//! The identity of a plugin's deployable tree is a single SHA-256 digest:
//! walk `dist/`, collect relative POSIX paths, sort them lexicographically,
//! and for each path feed `path_bytes || NUL || file_contents` into the
//! hasher. Any byte change — content, rename, missing or extra file —
//! produces a different digest.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::CryptoResult;

/// Observed dist metadata: the digest plus the figures used for cheap
/// drift pre-checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistInfo {
    /// Lowercase hex SHA-256 in `sha256:<hex>` form.
    pub hash: String,
    /// Number of regular files hashed.
    pub file_count: usize,
    /// Sum of file sizes in bytes.
    pub total_bytes: u64,
}

/// Hash a dist tree.
///
/// Symlinks are not followed; only regular files contribute. An empty or
/// missing tree hashes to the empty-input digest with zero files.
///
/// # Errors
///
/// Returns an error if a directory entry or file cannot be read.
pub fn hash_dist_tree(root: &Path) -> CryptoResult<DistInfo> {
    let mut paths = Vec::new();
    if root.is_dir() {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                std::io::Error::other(format!("walk {}: {e}", root.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            paths.push((relative, entry.path().to_path_buf()));
        }
    }
    paths.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    let mut file_count = 0usize;
    let mut total_bytes = 0u64;
    for (relative, path) in paths {
        let contents = std::fs::read(&path)?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(&contents);
        file_count += 1;
        total_bytes += contents.len() as u64;
    }

    Ok(DistInfo {
        hash: format!("sha256:{}", hex::encode(hasher.finalize())),
        file_count,
        total_bytes,
    })
}
