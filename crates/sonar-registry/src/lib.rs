//! Sonar registry — the authoritative tool/resource/prompt inventory.
//!
//! Four pieces:
//!
//! - [`registry`] — the core registry: uniqueness guarantees, module
//!   ownership with atomic rollback, bootstrap dedup guards, and
//!   insertion-ordered snapshots.
//! - [`notify`] — the notifications hub broadcasting
//!   `notifications/<kind>/list_changed` to subscribed sessions after
//!   every successful mutation.
//! - [`discovery`] — dependency-ordered module registration at startup
//!   with per-module failure isolation.
//! - [`reload`] — the hot-reload watcher: on-disk module changes trigger
//!   unregister → reload → re-register → `list_changed`.

pub mod discovery;
pub mod error;
pub mod notify;
pub mod registry;
pub mod reload;
pub mod types;

pub use discovery::{DiscoveryEngine, LoadReport, ToolModule};
pub use error::{RegistryError, RegistryResult};
pub use notify::{ListChangedKind, NotificationHub};
pub use registry::Registry;
pub use reload::{HotReloadWatcher, ModuleLoader, WatcherConfig};
pub use types::{
    ModuleRecord, ModuleState, PromptArgument, PromptMessage, PromptRegistration,
    PromptRenderer, ResourceProvider, ResourceRegistration, ToolContext, ToolHandler,
    ToolRegistration,
};
