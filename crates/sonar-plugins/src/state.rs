//! The plugin lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a plugin.
///
/// Legal transitions:
///
/// ```text
/// Discovered → Validated → Loaded → Active ⇄ Inactive
///                             │
///                             └→ Unloaded
/// ```
///
/// Any failure lands in `Failed`; a retry is allowed once the underlying
/// cause is fixed (validation runs again from `Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Manifest found and parsed.
    Discovered,
    /// Manifest and integrity checks passed.
    Validated,
    /// Instantiated; tools not yet exposed.
    Loaded,
    /// Tools exposed to the dispatcher.
    Active,
    /// Tools withdrawn, instance retained.
    Inactive,
    /// Instance dropped; terminal until re-discovered.
    Unloaded,
    /// Validation, load, or activation failed.
    Failed,
}

impl PluginState {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Validated => "validated",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unloaded => "unloaded",
            Self::Failed => "failed",
        }
    }

    /// Whether `self → target` is a legal transition.
    #[must_use]
    pub fn can_transition(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Discovered, Self::Validated)
                | (Self::Validated, Self::Loaded)
                | (Self::Loaded, Self::Active | Self::Unloaded)
                | (Self::Active, Self::Inactive)
                | (Self::Inactive, Self::Active | Self::Unloaded)
                // Failures can happen anywhere, and validation retries
                // from Failed once the cause is fixed.
                | (_, Self::Failed)
                | (Self::Failed, Self::Discovered | Self::Validated)
        )
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        let path = [
            PluginState::Discovered,
            PluginState::Validated,
            PluginState::Loaded,
            PluginState::Active,
            PluginState::Inactive,
            PluginState::Active,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(PluginState::Inactive.can_transition(PluginState::Unloaded));
        assert!(PluginState::Loaded.can_transition(PluginState::Unloaded));
    }

    #[test]
    fn shortcuts_are_illegal() {
        assert!(!PluginState::Discovered.can_transition(PluginState::Loaded));
        assert!(!PluginState::Validated.can_transition(PluginState::Active));
        assert!(!PluginState::Active.can_transition(PluginState::Unloaded));
        assert!(!PluginState::Unloaded.can_transition(PluginState::Active));
    }

    #[test]
    fn failure_is_reachable_from_anywhere_and_retryable() {
        for state in [
            PluginState::Discovered,
            PluginState::Validated,
            PluginState::Loaded,
            PluginState::Active,
        ] {
            assert!(state.can_transition(PluginState::Failed));
        }
        assert!(PluginState::Failed.can_transition(PluginState::Validated));
    }
}
