//! stdio transport: one JSON object per line, UTF-8, `\n`-terminated.
//!
//! A single process-unique session. Responses and server-initiated
//! notifications share standard output; writes are serialised through
//! one writer task. Back-pressure is the OS pipe buffer.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sonar_core::{RpcMessage, SessionId};
use sonar_registry::NotificationHub;

use crate::error::TransportResult;
use crate::sink::MessageSink;

/// The stdio transport.
pub struct StdioTransport {
    session: SessionId,
    sink: Arc<dyn MessageSink>,
    hub: Arc<NotificationHub>,
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Create a transport with a fresh process-unique session.
    #[must_use]
    pub fn new(sink: Arc<dyn MessageSink>, hub: Arc<NotificationHub>) -> Self {
        Self {
            session: SessionId::generate(),
            sink,
            hub,
            shutdown: CancellationToken::new(),
        }
    }

    /// This transport's session ID.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// Signal the transport to stop after the current line.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Run on the process's standard streams until EOF or close.
    ///
    /// # Errors
    ///
    /// Returns an error if reading stdin or writing stdout fails.
    pub async fn run(&self) -> TransportResult<()> {
        self.run_streams(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Run on arbitrary streams (the testable core of [`run`](Self::run)).
    ///
    /// # Errors
    ///
    /// Returns an error if the reader or writer fails.
    pub async fn run_streams<R, W>(&self, reader: R, writer: W) -> TransportResult<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // One writer task serialises responses and notifications.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = out_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
        });

        // Forward hub notifications for this session to stdout.
        let mut notifications = self.hub.subscribe(self.session.clone());
        let notification_out = out_tx.clone();
        let notification_task = tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let Ok(line) = serde_json::to_string(&notification) else {
                    continue;
                };
                if notification_out.send(line).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                () = self.shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("stdin closed");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let message = match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) => RpcMessage::from_value(value),
                Err(e) => {
                    warn!(error = %e, "Unparsable line on stdin");
                    continue;
                },
            };

            let cancel = self.shutdown.child_token();
            if let Some(response) = self.sink.dispatch(&self.session, message, cancel).await {
                let line = serde_json::to_string(&response)
                    .unwrap_or_else(|_| r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"serialization failure"}}"#.to_string());
                if out_tx.send(line).await.is_err() {
                    break;
                }
            }
        }

        self.hub.unsubscribe(&self.session);
        drop(out_tx);
        notification_task.abort();
        let _ = writer_task.await;
        Ok(())
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use sonar_core::{RpcError, RpcResponse};
    use tokio::io::AsyncReadExt;

    struct EchoSink;

    #[async_trait]
    impl MessageSink for EchoSink {
        async fn dispatch(
            &self,
            _session: &SessionId,
            message: RpcMessage,
            _cancel: CancellationToken,
        ) -> Option<RpcResponse> {
            match message {
                RpcMessage::Request(request) => Some(RpcResponse::success(
                    request.id,
                    json!({"echo": request.method}),
                )),
                _ => None,
            }
        }
    }

    struct RejectSink;

    #[async_trait]
    impl MessageSink for RejectSink {
        async fn dispatch(
            &self,
            _session: &SessionId,
            message: RpcMessage,
            _cancel: CancellationToken,
        ) -> Option<RpcResponse> {
            match message {
                RpcMessage::Request(request) => Some(RpcResponse::failure(
                    request.id,
                    RpcError::method_not_found(&request.method),
                )),
                _ => None,
            }
        }
    }

    async fn run_transport(
        sink: Arc<dyn MessageSink>,
        input: &str,
    ) -> Vec<serde_json::Value> {
        let hub = Arc::new(NotificationHub::new());
        let transport = StdioTransport::new(sink, hub);

        let (mut stdin_writer, stdin_reader) = tokio::io::duplex(4096);
        let (stdout_writer, mut stdout_reader) = tokio::io::duplex(4096);

        stdin_writer.write_all(input.as_bytes()).await.unwrap();
        drop(stdin_writer);

        transport
            .run_streams(stdin_reader, stdout_writer)
            .await
            .unwrap();

        let mut out = String::new();
        stdout_reader.read_to_string(&mut out).await.unwrap();
        out.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn request_line_gets_response_line() {
        let out = run_transport(
            Arc::new(EchoSink),
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n",
        )
        .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], json!(1));
        assert_eq!(out[0]["result"]["echo"], json!("tools/list"));
    }

    #[tokio::test]
    async fn notifications_and_blank_lines_produce_no_output() {
        let out = run_transport(
            Arc::new(EchoSink),
            "\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/cancelled\"}\n",
        )
        .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn unparsable_line_is_skipped_not_fatal() {
        let out = run_transport(
            Arc::new(EchoSink),
            "this is not json\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"x\"}\n",
        )
        .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], json!(2));
    }

    #[tokio::test]
    async fn error_responses_flow_through() {
        let out = run_transport(
            Arc::new(RejectSink),
            "{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"nope\"}\n",
        )
        .await;
        assert_eq!(out[0]["error"]["code"], json!(-32601));
    }
}
