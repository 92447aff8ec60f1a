//! Sonar transport — one server, three wire surfaces.
//!
//! Every transport normalises its wire format into the classified
//! [`RpcMessage`](sonar_core::RpcMessage) model and hands requests to a
//! [`MessageSink`] (the server dispatcher). The uniform contract:
//! `start()`, `send` (internally, toward the peer), `close()`, and a
//! `session_id` identifying the conversation.
//!
//! - [`stdio`] — newline-delimited JSON on standard streams, one
//!   process-unique session.
//! - [`http`] — axum: `POST /` answered over an SSE stream, a session
//!   notification stream, health and RFC 9728 metadata endpoints, and
//!   the [`oauth`] resource-server middleware.
//! - [`amqp`] — lapin: durable topic exchange, per-session routing keys,
//!   correlation-id/reply-to bookkeeping, backoff reconnect.

pub mod amqp;
pub mod error;
pub mod http;
pub mod oauth;
pub mod routing;
pub mod sink;
pub mod stdio;

pub use error::{TransportError, TransportResult};
pub use sink::MessageSink;
