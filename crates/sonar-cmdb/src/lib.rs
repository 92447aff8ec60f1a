//! Sonar CMDB — the configuration-item store.
//!
//! An in-memory key → JSON-blob map with last-write-wins `set`,
//! shallow-merge `merge`, `*`-glob `query`, and durable persistence
//! through [`sonar_storage::KvStore`]. Writes land in memory
//! synchronously and are flushed to the store by an auto-save task (or an
//! explicit `save()`); on startup the map is rehydrated before the first
//! request is accepted.
//!
//! Keys follow the `ci:type:id` convention but are treated as opaque.

pub mod cmdb;
pub mod error;
pub mod infer;

pub use cmdb::{Cmdb, CmdbStats, MigrateReport};
pub use error::{CmdbError, CmdbResult};
pub use infer::infer_ci_type;
