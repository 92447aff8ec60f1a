//! Sonar plugins — signed, content-addressed plugin loading.
//!
//! Plugins live under `<plugins_root>/<category>/<plugin-id>/` with a
//! `mcp-plugin.json` manifest (v2), a content-addressed `dist/` tree, and
//! a manager-written `mcp-plugin.lock.json`. The manager:
//!
//! - discovers and validates manifests (errors collected, one broken
//!   plugin never blocks the others),
//! - verifies the dist tree against its SHA-256 identity and the lock
//!   file against the observed tree (drift is load-blocking),
//! - enforces the signature policy (Ed25519 over the dist-hash string),
//! - drives the `Discovered → Validated → Loaded → Active ⇄ Inactive →
//!   Unloaded` state machine, exposing tools through the core registry.

pub mod error;
pub mod host;
pub mod lockfile;
pub mod manager;
pub mod manifest;
pub mod state;

pub use error::{PluginError, PluginResult};
pub use host::PluginHost;
pub use lockfile::PluginLock;
pub use manager::{PluginInfo, PluginManager, PluginPolicy};
pub use manifest::{DependenciesPolicy, DistDeclaration, ManifestSignature, PluginManifest};
pub use state::PluginState;

/// Manifest file name inside a plugin directory.
pub const MANIFEST_FILE: &str = "mcp-plugin.json";
/// Lock file name, written next to the manifest on load.
pub const LOCK_FILE: &str = "mcp-plugin.lock.json";
/// The deployable subtree holding the plugin's content-addressed files.
pub const DIST_DIR: &str = "dist";
