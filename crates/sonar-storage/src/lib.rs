//! Sonar storage — embedded key-value persistence.
//!
//! A single [`KvStore`] trait with two implementations:
//!
//! - [`MemoryKvStore`] — `HashMap`-backed, for tests and ephemeral runs.
//! - [`SledKvStore`] — durable, backed by an embedded sled database; each
//!   namespace maps to a sled tree.
//!
//! Keys are strings scoped by namespace; values are opaque bytes. The
//! CMDB stores one encoded row per configuration item; the vault and
//! plugin manager use their own file formats and do not go through this
//! crate.

pub mod error;
pub mod kv;

pub use error::{StorageError, StorageResult};
pub use kv::{KvStore, MemoryKvStore, SledKvStore};
