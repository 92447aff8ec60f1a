//! The dispatcher-facing side of every transport.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sonar_core::{RpcMessage, RpcResponse, SessionId};

/// Where transports deliver classified messages.
///
/// The server dispatcher implements this. Requests produce exactly one
/// response; notifications (and malformed messages degraded to
/// notifications) produce none. The cancellation token is derived from
/// the transport: it fires when the peer disconnects or sends a cancel
/// notification, and handlers propagate it into external calls.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Dispatch one message from a session.
    async fn dispatch(
        &self,
        session: &SessionId,
        message: RpcMessage,
        cancel: CancellationToken,
    ) -> Option<RpcResponse>;
}
