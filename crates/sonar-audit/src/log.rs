//! Audit log and its sinks.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use fs2::FileExt;
use tracing::debug;

use crate::entry::{AuditAction, AuditEntry};
use crate::error::{AuditError, AuditResult};

/// Where audit entries go.
///
/// Sinks are append-only; nothing in this crate rewrites or truncates.
pub trait AuditSink: Send + Sync {
    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be persisted.
    fn append(&self, entry: &AuditEntry) -> AuditResult<()>;

    /// Read all entries back, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be read or parsed.
    fn read_all(&self) -> AuditResult<Vec<AuditEntry>>;
}

/// JSON-lines file sink: one entry per line, flushed per append.
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    /// Create a sink appending to the given file, creating parents as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> AuditResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AuditError::Open(e.to_string()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlSink {
    fn append(&self, entry: &AuditEntry) -> AuditResult<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AuditError::Append("poisoned lock".into()))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::Append(e.to_string()))?;

        // Advisory lock so concurrent processes sharing a data dir
        // interleave whole lines, not bytes.
        file.lock_exclusive()
            .map_err(|e| AuditError::Append(e.to_string()))?;
        let result = writeln!(file, "{line}").and_then(|()| file.flush());
        let _ = fs2::FileExt::unlock(&file);
        result.map_err(|e| AuditError::Append(e.to_string()))
    }

    fn read_all(&self) -> AuditResult<Vec<AuditEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuditError::Read(e.to_string())),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| AuditError::Serialization(e.to_string()))
            })
            .collect()
    }
}

impl std::fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlSink").field("path", &self.path).finish()
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    /// Create an empty in-memory sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditSink for MemorySink {
    fn append(&self, entry: &AuditEntry) -> AuditResult<()> {
        self.entries
            .lock()
            .map_err(|_| AuditError::Append("poisoned lock".into()))?
            .push(entry.clone());
        Ok(())
    }

    fn read_all(&self) -> AuditResult<Vec<AuditEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| AuditError::Read("poisoned lock".into()))?
            .clone())
    }
}

/// The audit log: assigns sequence numbers and writes to a sink.
///
/// Sequence numbers are strictly monotonic per instance; on open, the
/// counter resumes after the highest sequence already in the sink.
pub struct AuditLog {
    sink: Box<dyn AuditSink>,
    next_seq: Mutex<u64>,
}

impl AuditLog {
    /// Wrap a sink, resuming the sequence counter from its contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink's existing entries cannot be read.
    pub fn new(sink: Box<dyn AuditSink>) -> AuditResult<Self> {
        let next_seq = sink
            .read_all()?
            .iter()
            .map(|e| e.seq)
            .max()
            .map_or(0, |max| max.saturating_add(1));
        debug!(next_seq, "Opened audit log");
        Ok(Self {
            sink,
            next_seq: Mutex::new(next_seq),
        })
    }

    /// Append a successful operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be persisted.
    pub fn record(
        &self,
        actor: &str,
        action: AuditAction,
        target_id: &str,
    ) -> AuditResult<AuditEntry> {
        self.append(actor, action, target_id, true, None)
    }

    /// Append a failed operation with its reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be persisted.
    pub fn record_failure(
        &self,
        actor: &str,
        action: AuditAction,
        target_id: &str,
        reason: impl Into<String>,
    ) -> AuditResult<AuditEntry> {
        self.append(actor, action, target_id, false, Some(reason.into()))
    }

    fn append(
        &self,
        actor: &str,
        action: AuditAction,
        target_id: &str,
        success: bool,
        reason: Option<String>,
    ) -> AuditResult<AuditEntry> {
        let mut next = self
            .next_seq
            .lock()
            .map_err(|_| AuditError::Append("poisoned lock".into()))?;
        let entry = AuditEntry {
            seq: *next,
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action,
            target_id: target_id.to_string(),
            success,
            reason,
        };
        // Persist before bumping so a failed append never burns a number.
        self.sink.append(&entry)?;
        *next = next.saturating_add(1);
        Ok(entry)
    }

    /// All entries in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be read.
    pub fn entries(&self) -> AuditResult<Vec<AuditEntry>> {
        self.sink.read_all()
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_strictly_monotonic() {
        let log = AuditLog::new(Box::new(MemorySink::new())).unwrap();
        for _ in 0..5 {
            log.record("system", AuditAction::Get, "cred-1").unwrap();
        }
        let seqs: Vec<u64> = log.entries().unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn jsonl_sink_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault-audit.jsonl");
        let log = AuditLog::new(Box::new(JsonlSink::open(&path).unwrap())).unwrap();

        log.record("system", AuditAction::Add, "cred-1").unwrap();
        log.record_failure("system", AuditAction::Rotate, "vault", "disk full")
            .unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].success);
        assert!(!entries[1].success);
        assert_eq!(entries[1].reason.as_deref(), Some("disk full"));

        // Two lines on disk, one JSON object each.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::new(Box::new(JsonlSink::open(&path).unwrap())).unwrap();
            log.record("system", AuditAction::Add, "a").unwrap();
            log.record("system", AuditAction::Remove, "a").unwrap();
        }
        let log = AuditLog::new(Box::new(JsonlSink::open(&path).unwrap())).unwrap();
        let entry = log.record("system", AuditAction::Add, "b").unwrap();
        assert_eq!(entry.seq, 2);
    }
}
