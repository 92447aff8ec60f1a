//! Sonar core — shared protocol types.
//!
//! Everything the transports, dispatcher, and registries agree on lives
//! here: the JSON-RPC 2.0 message model with its strict three-way
//! classification, tool results and content items, the structured schema
//! description attached to every tool, and the session identifiers shared
//! by the HTTP and AMQP transports.
//!
//! This crate has no I/O and no async — it is pure data.

pub mod id;
pub mod rpc;
pub mod schema;
pub mod tool;

pub use id::{SessionId, StreamId};
pub use rpc::{
    MessageKind, RpcError, RpcId, RpcMessage, RpcNotification, RpcRequest, RpcResponse, codes,
};
pub use schema::{FieldSpec, ObjectShape, SchemaShape};
pub use tool::{Content, ToolResult};
