//! Sonar server — the dispatcher and the built-in tool modules.
//!
//! The [`Server`] owns the registries, CMDB, vault, and plugin manager,
//! and implements the transport-facing
//! [`MessageSink`](sonar_transport::MessageSink): method lookup,
//! parameter validation against each tool's recorded schema, error-code
//! mapping, and cancellation (`notifications/cancelled` → `-32800`).
//!
//! Built-in modules ([`modules`]) expose the CMDB (`memory_*`) and the
//! credential vault (`credentials_*`) as tools through the discovery
//! engine; registry and plugin management are dispatcher methods
//! (`registry_*`, `plugin_*`).

pub mod modules;
pub mod server;

pub use modules::{CredentialsModule, MemoryModule};
pub use server::Server;
