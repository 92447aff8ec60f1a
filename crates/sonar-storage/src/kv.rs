//! Key-value store trait and implementations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Namespaced byte-level key-value storage.
///
/// Implementations must be thread-safe. Writes are durable once the call
/// returns for disk-backed implementations unless documented otherwise;
/// [`flush`](KvStore::flush) forces durability.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Set a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Delete a value. Returns `true` if the key was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// List all keys in a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>>;

    /// Remove every key in a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn clear(&self, namespace: &str) -> StorageResult<()>;

    /// Force pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to flush.
    async fn flush(&self) -> StorageResult<()>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryKvStore {
    maps: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> StorageError {
        StorageError::Backend("poisoned lock".to_string())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let maps = self.maps.read().map_err(|_| Self::lock_err())?;
        Ok(maps.get(namespace).and_then(|m| m.get(key)).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let mut maps = self.maps.write().map_err(|_| Self::lock_err())?;
        maps.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let mut maps = self.maps.write().map_err(|_| Self::lock_err())?;
        Ok(maps
            .get_mut(namespace)
            .is_some_and(|m| m.remove(key).is_some()))
    }

    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        let maps = self.maps.read().map_err(|_| Self::lock_err())?;
        Ok(maps
            .get(namespace)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, namespace: &str) -> StorageResult<()> {
        let mut maps = self.maps.write().map_err(|_| Self::lock_err())?;
        maps.remove(namespace);
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvStore").finish_non_exhaustive()
    }
}

/// Durable store backed by an embedded sled database.
///
/// Namespaces map to sled trees. sled batches writes internally; callers
/// that need a durability point use [`flush`](KvStore::flush).
pub struct SledKvStore {
    db: sled::Db,
}

impl SledKvStore {
    /// Open or create a store at the given directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the database cannot be opened
    /// (e.g. held by another process).
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| StorageError::Open(e.to_string()))?;
        debug!(path = %path.display(), "Opened sled store");
        Ok(Self { db })
    }

    fn tree(&self, namespace: &str) -> StorageResult<sled::Tree> {
        Ok(self.db.open_tree(namespace)?)
    }
}

#[async_trait]
impl KvStore for SledKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let tree = self.tree(namespace)?;
        Ok(tree.get(key)?.map(|v| v.to_vec()))
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let tree = self.tree(namespace)?;
        tree.insert(key, value)?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let tree = self.tree(namespace)?;
        Ok(tree.remove(key)?.is_some())
    }

    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        let tree = self.tree(namespace)?;
        let mut keys = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    async fn clear(&self, namespace: &str) -> StorageResult<()> {
        let tree = self.tree(namespace)?;
        tree.clear()?;
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| StorageError::Flush(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for SledKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledKvStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryKvStore::new();
        store.set("cmdb", "ci:host:h1", b"{}".to_vec()).await.unwrap();
        assert_eq!(
            store.get("cmdb", "ci:host:h1").await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert!(store.delete("cmdb", "ci:host:h1").await.unwrap());
        assert!(!store.delete("cmdb", "ci:host:h1").await.unwrap());
        assert_eq!(store.get("cmdb", "ci:host:h1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = MemoryKvStore::new();
        store.set("a", "k", b"1".to_vec()).await.unwrap();
        store.set("b", "k", b"2".to_vec()).await.unwrap();
        store.clear("a").await.unwrap();
        assert_eq!(store.get("a", "k").await.unwrap(), None);
        assert_eq!(store.get("b", "k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn sled_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledKvStore::open(dir.path()).unwrap();
            store.set("cmdb", "k", b"v".to_vec()).await.unwrap();
            store.flush().await.unwrap();
        }
        let store = SledKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get("cmdb", "k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.list_keys("cmdb").await.unwrap(), vec!["k".to_string()]);
    }
}
