//! The configuration-item store.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sonar_config::MemoryConfig;
use sonar_storage::KvStore;

use crate::error::{CmdbError, CmdbResult};
use crate::infer::infer_ci_type;

/// Store namespace holding CI rows.
const NAMESPACE: &str = "cmdb";

/// The durable row form: one independently encoded row per CI.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CiRow {
    ci_key: String,
    ci_data: Value,
    ci_type: String,
    updated_at: chrono::DateTime<Utc>,
}

/// Store statistics, as returned by `stats()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdbStats {
    /// Number of configuration items.
    pub items: usize,
    /// Item count per inferred type.
    pub by_type: BTreeMap<String, usize>,
    /// Keys waiting for a durable write.
    pub dirty: usize,
    /// Whether the auto-save task is configured on.
    pub auto_save: bool,
}

/// Result of a legacy-store migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateReport {
    /// Rows imported.
    pub imported: usize,
    /// Entries skipped (non-string keys, unreadable values).
    pub skipped: usize,
}

/// The CMDB: an in-memory map with scheduled durable writes.
///
/// The map is a [`DashMap`], so `merge` is atomic per key (the entry
/// holds the shard lock across read-modify-write) and concurrent writers
/// to different keys do not serialise against each other.
pub struct Cmdb {
    items: DashMap<String, Value>,
    dirty: Mutex<HashSet<String>>,
    pending_clear: AtomicBool,
    store: Arc<dyn KvStore>,
    config: MemoryConfig,
}

impl Cmdb {
    /// Open the CMDB, rehydrating the in-memory map from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read. Rows that fail to
    /// decode are skipped with a warning rather than poisoning startup.
    pub async fn open(store: Arc<dyn KvStore>, config: MemoryConfig) -> CmdbResult<Self> {
        let items = DashMap::new();
        for key in store.list_keys(NAMESPACE).await? {
            let Some(bytes) = store.get(NAMESPACE, &key).await? else {
                continue;
            };
            match serde_json::from_slice::<CiRow>(&bytes) {
                Ok(row) => {
                    items.insert(row.ci_key, row.ci_data);
                },
                Err(e) => {
                    warn!(key, error = %e, "Skipping undecodable CMDB row");
                },
            }
        }
        info!(items = items.len(), "CMDB rehydrated");
        Ok(Self {
            items,
            dirty: Mutex::new(HashSet::new()),
            pending_clear: AtomicBool::new(false),
            store,
            config,
        })
    }

    /// Get a CI by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    /// Set a CI, replacing any existing value (last write wins).
    pub fn set(&self, key: &str, value: Value) {
        self.items.insert(key.to_string(), value);
        self.mark_dirty(key);
    }

    /// Shallow-merge a partial blob into a CI.
    ///
    /// `result = existing ∪ partial`, with `partial` winning on key
    /// collisions; nested objects are replaced, not merged. When either
    /// side is not an object, `partial` simply replaces the value.
    /// Returns the merged result.
    pub fn merge(&self, key: &str, partial: Value) -> Value {
        let mut entry = self.items.entry(key.to_string()).or_insert(Value::Null);
        let merged = match (entry.value(), &partial) {
            (Value::Object(existing), Value::Object(update)) => {
                let mut merged = existing.clone();
                for (k, v) in update {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            },
            _ => partial,
        };
        *entry.value_mut() = merged.clone();
        drop(entry);
        self.mark_dirty(key);
        merged
    }

    /// Query keys by glob pattern.
    ///
    /// `*` matches any run of characters; there are no other
    /// metacharacters. `None` returns everything. Results are sorted by
    /// key for stable output.
    ///
    /// # Errors
    ///
    /// Returns [`CmdbError::BadPattern`] if the compiled pattern is
    /// rejected (practically unreachable since everything but `*` is
    /// escaped).
    pub fn query(&self, pattern: Option<&str>) -> CmdbResult<Vec<(String, Value)>> {
        let matcher = pattern.map(glob_regex).transpose()?;
        let mut results: Vec<(String, Value)> = self
            .items
            .iter()
            .filter(|entry| {
                matcher
                    .as_ref()
                    .is_none_or(|re| re.is_match(entry.key()))
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// Remove every CI. The durable store is emptied on the next flush.
    pub fn clear(&self) {
        self.items.clear();
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.clear();
        }
        self.pending_clear.store(true, Ordering::SeqCst);
    }

    /// Store statistics.
    #[must_use]
    pub fn stats(&self) -> CmdbStats {
        let mut by_type = BTreeMap::new();
        for entry in &self.items {
            *by_type
                .entry(infer_ci_type(entry.value()).to_string())
                .or_insert(0) += 1;
        }
        CmdbStats {
            items: self.items.len(),
            by_type,
            dirty: self.dirty.lock().map(|d| d.len()).unwrap_or(0),
            auto_save: self.config.auto_save,
        }
    }

    /// Flush pending changes to the durable store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; dirty keys that failed remain
    /// dirty and are retried on the next flush.
    pub async fn save(&self) -> CmdbResult<usize> {
        if self.pending_clear.swap(false, Ordering::SeqCst) {
            self.store.clear(NAMESPACE).await?;
        }

        let to_flush: Vec<String> = {
            let Ok(mut dirty) = self.dirty.lock() else {
                return Ok(0);
            };
            dirty.drain().collect()
        };

        let mut flushed = 0usize;
        for (index, key) in to_flush.iter().enumerate() {
            if let Err(e) = self.flush_one(key).await {
                // Whatever was not written stays dirty for the next pass.
                for unflushed in &to_flush[index..] {
                    self.mark_dirty(unflushed);
                }
                return Err(e);
            }
            flushed += 1;
        }
        if flushed > 0 {
            self.store.flush().await?;
            debug!(flushed, "CMDB flushed");
        }
        Ok(flushed)
    }

    /// Import a legacy JSON store (`{ "ci:...": {...}, ... }`), merging
    /// row by row with last-write-wins.
    ///
    /// # Errors
    ///
    /// Returns [`CmdbError::Migrate`] if the file cannot be read or is
    /// not a JSON object.
    pub fn migrate_from(&self, path: &Path) -> CmdbResult<MigrateReport> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CmdbError::Migrate(format!("read {}: {e}", path.display())))?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| CmdbError::Migrate(format!("parse {}: {e}", path.display())))?;
        let Value::Object(entries) = value else {
            return Err(CmdbError::Migrate(format!(
                "{} is not a JSON object",
                path.display()
            )));
        };

        let mut imported = 0usize;
        let mut skipped = 0usize;
        for (key, value) in entries {
            if key.is_empty() {
                skipped += 1;
                continue;
            }
            self.merge(&key, value);
            imported += 1;
        }
        info!(imported, skipped, path = %path.display(), "CMDB migration complete");
        Ok(MigrateReport { imported, skipped })
    }

    /// Spawn the auto-save task, if enabled.
    ///
    /// Returns `None` when `MEMORY_AUTO_SAVE=false`. The task runs until
    /// the handle is aborted; flush failures are logged and retried on
    /// the next tick.
    #[must_use]
    pub fn spawn_auto_save(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.auto_save {
            debug!("CMDB auto-save disabled");
            return None;
        }
        let cmdb = Arc::clone(self);
        let interval = self.config.auto_save_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = cmdb.save().await {
                    warn!(error = %e, "CMDB auto-save failed");
                }
            }
        }))
    }

    async fn flush_one(&self, key: &str) -> CmdbResult<()> {
        // The item may have been cleared between marking and flushing.
        let Some(value) = self.get(key) else {
            self.store.delete(NAMESPACE, key).await?;
            return Ok(());
        };
        let row = CiRow {
            ci_key: key.to_string(),
            ci_type: infer_ci_type(&value).to_string(),
            ci_data: value,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&row).map_err(|e| CmdbError::Row {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.store.set(NAMESPACE, key, bytes).await?;
        Ok(())
    }

    fn mark_dirty(&self, key: &str) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(key.to_string());
        }
    }
}

impl std::fmt::Debug for Cmdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cmdb")
            .field("items", &self.items.len())
            .finish_non_exhaustive()
    }
}

/// Compile a `*`-only glob into an anchored regex.
fn glob_regex(pattern: &str) -> CmdbResult<regex::Regex> {
    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    regex::Regex::new(&format!("^{escaped}$"))
        .map_err(|_| CmdbError::BadPattern(pattern.to_string()))
}
