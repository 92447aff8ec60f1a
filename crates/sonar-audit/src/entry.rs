//! Audit entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The operation an audit entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A record was added.
    Add,
    /// A record was read (secret fields decrypted).
    Get,
    /// Metadata was listed.
    List,
    /// A record was removed.
    Remove,
    /// A key rotation was performed or attempted.
    Rotate,
    /// A store was created or its key material initialized.
    Initialize,
    /// A plugin was loaded.
    PluginLoad,
    /// A plugin was activated.
    PluginActivate,
    /// A plugin was deactivated.
    PluginDeactivate,
    /// A plugin was unloaded.
    PluginUnload,
}

impl AuditAction {
    /// Stable lowercase name, as written to the log.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Get => "get",
            Self::List => "list",
            Self::Remove => "remove",
            Self::Rotate => "rotate",
            Self::Initialize => "initialize",
            Self::PluginLoad => "plugin_load",
            Self::PluginActivate => "plugin_activate",
            Self::PluginDeactivate => "plugin_deactivate",
            Self::PluginUnload => "plugin_unload",
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic sequence number within this log instance.
    pub seq: u64,
    /// When the operation happened.
    pub timestamp: DateTime<Utc>,
    /// Who performed it (session ID, `"system"`, ...).
    pub actor: String,
    /// What was done.
    pub action: AuditAction,
    /// The record or plugin the action targeted.
    pub target_id: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Failure reason, when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serializes_one_line() {
        let entry = AuditEntry {
            seq: 3,
            timestamp: Utc::now(),
            actor: "system".into(),
            action: AuditAction::Rotate,
            target_id: "vault".into(),
            success: false,
            reason: Some("store write failed".into()),
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains('\n'));
        let back: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn success_omits_reason() {
        let entry = AuditEntry {
            seq: 1,
            timestamp: Utc::now(),
            actor: "system".into(),
            action: AuditAction::Add,
            target_id: "cred-1".into(),
            success: true,
            reason: None,
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains("reason"));
        assert!(line.contains("\"add\""));
    }
}
