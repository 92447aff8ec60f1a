//! Sonar config — typed server configuration.
//!
//! Configuration comes from a fixed set of environment variables
//! (`TRANSPORT_MODE`, `MCP_SERVER_URL`, `MCP_CREDS_KEY`,
//! `MEMORY_AUTO_SAVE*`, `OAUTH_*`), read once at startup into
//! [`ServerConfig`]. Validation errors are collected, not
//! first-error-wins, so a misconfigured deployment reports everything
//! wrong in one pass. Values the environment table does not cover (bind
//! address, AMQP connection, data directory) have defaults and are
//! overridable by the daemon's CLI flags.

pub mod error;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use types::{AmqpConfig, MemoryConfig, OAuthConfig, ServerConfig, TransportMode};
