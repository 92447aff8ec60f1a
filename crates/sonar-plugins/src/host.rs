//! The plugin host seam.
//!
//! The manager's contract is manifests, integrity, and the state
//! machine; *how* a validated plugin becomes running code is behind
//! [`PluginHost`]. A host turns a plugin directory into a
//! [`ToolModule`](sonar_registry::ToolModule) whose `register` entry
//! point exposes the plugin's tools through the core registry.

use std::path::Path;

use sonar_registry::ToolModule;

use crate::error::PluginResult;
use crate::manifest::PluginManifest;

/// Instantiates validated plugins.
pub trait PluginHost: Send + Sync {
    /// Build the plugin's registration unit from its verified directory.
    ///
    /// Called during `load`, after manifest validation, integrity and
    /// lock checks, and signature policy have all passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry point cannot be instantiated; the
    /// manager records it and marks the plugin `Failed`.
    fn instantiate(
        &self,
        manifest: &PluginManifest,
        plugin_dir: &Path,
    ) -> PluginResult<Box<dyn ToolModule>>;
}
