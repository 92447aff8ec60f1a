//! Sonar audit — append-only audit logging.
//!
//! Every sensitive operation (vault access, key rotation, plugin loads)
//! appends an [`AuditEntry`]. Entries carry a per-instance monotonic
//! sequence number; storage is JSON lines on disk (one entry per line,
//! never rewritten) or an in-memory buffer for tests.

pub mod entry;
pub mod error;
pub mod log;

pub use entry::{AuditAction, AuditEntry};
pub use error::{AuditError, AuditResult};
pub use log::{AuditLog, AuditSink, JsonlSink, MemorySink};
