//! AMQP transport: bidirectional routing over a durable topic exchange.
//!
//! One exchange carries all traffic. Each transport instance owns a
//! `session_id`/`stream_id` pair identifying the conversation; the
//! request queue is bound to the session-specific routing key *and* the
//! generic `mcp.*` patterns so load-balanced worker instances can share
//! work.
//!
//! Incoming requests carry `correlationId` and `replyTo` in their AMQP
//! properties. Those are stored on the internal message object while the
//! dispatcher runs; when the response is sent the transport takes them
//! back off, publishes to the `replyTo` queue with the matching
//! `correlationId`, and strips the routing metadata from the payload.
//! Requests are acknowledged after the dispatch hand-off — errors
//! produce an error response and an ack, never a re-queue.
//!
//! Connection or channel errors trigger exponential-backoff reconnects
//! up to a configured maximum; bindings and consumers are re-established
//! with the preserved session/stream identifiers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sonar_config::AmqpConfig;
use sonar_core::{RpcMessage, SessionId, StreamId};
use sonar_registry::NotificationHub;

use crate::error::{TransportError, TransportResult};
use crate::routing::routing_key_for;
use crate::sink::MessageSink;

/// Internal field carrying the correlation ID across dispatch.
const ROUTE_CORRELATION: &str = "_correlationId";
/// Internal field carrying the reply-to queue across dispatch.
const ROUTE_REPLY_TO: &str = "_replyTo";

/// Generic request patterns shared by all worker instances.
const GENERIC_PATTERNS: &[&str] = &[
    "mcp.request.#",
    "mcp.tools.#",
    "mcp.resources.#",
    "mcp.prompts.#",
];

/// Base delay for the reconnect backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Ceiling for the reconnect backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// The AMQP transport.
pub struct AmqpTransport {
    config: AmqpConfig,
    sink: Arc<dyn MessageSink>,
    hub: Arc<NotificationHub>,
    session: SessionId,
    stream: StreamId,
    shutdown: CancellationToken,
}

impl AmqpTransport {
    /// Create a transport with fresh session/stream identifiers.
    #[must_use]
    pub fn new(config: AmqpConfig, sink: Arc<dyn MessageSink>, hub: Arc<NotificationHub>) -> Self {
        Self {
            config,
            sink,
            hub,
            session: SessionId::generate(),
            stream: StreamId::generate(),
            shutdown: CancellationToken::new(),
        }
    }

    /// This transport's session ID.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// This transport's stream ID.
    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.stream
    }

    /// Signal the transport to stop.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Run until closed, reconnecting on failure.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReconnectExhausted`] once the attempt
    /// budget is spent.
    pub async fn run(&self) -> TransportResult<()> {
        let mut attempt = 0u32;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            match self.connect_and_serve(&mut attempt).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    if attempt > self.config.max_reconnect_attempts {
                        return Err(TransportError::ReconnectExhausted(
                            self.config.max_reconnect_attempts,
                        ));
                    }
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "AMQP connection lost, reconnecting"
                    );
                    tokio::select! {
                        () = self.shutdown.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }
    }

    async fn connect_and_serve(&self, attempt: &mut u32) -> TransportResult<()> {
        let connection =
            Connection::connect(&self.config.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue = request_queue_name(&self.config.queue_prefix, &self.session);
        channel
            .queue_declare(&queue, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        for pattern in binding_patterns(&self.session, &self.stream) {
            channel
                .queue_bind(
                    &queue,
                    &self.config.exchange,
                    &pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let mut consumer = channel
            .basic_consume(
                &queue,
                "sonar-discovery",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Bindings and consumer are live: the connection counts as
        // healthy again for backoff purposes.
        *attempt = 0;
        info!(
            queue,
            session = %self.session,
            stream = %self.stream,
            "AMQP transport consuming"
        );

        let mut notifications = self.hub.subscribe(self.session.clone());

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    self.hub.unsubscribe(&self.session);
                    return Ok(());
                },

                notification = notifications.recv() => {
                    let Some(notification) = notification else {
                        continue;
                    };
                    self.publish_notification(&channel, &notification).await;
                },

                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        return Err(TransportError::Amqp("consumer stream closed".into()));
                    };
                    let delivery = delivery?;
                    self.handle_delivery(&channel, delivery).await?;
                },
            }
        }
    }

    async fn handle_delivery(
        &self,
        channel: &Channel,
        delivery: lapin::message::Delivery,
    ) -> TransportResult<()> {
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string());
        let reply_to = delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|s| s.as_str().to_string());

        let payload = match serde_json::from_slice::<Value>(&delivery.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Unparsable AMQP payload, acking and dropping");
                delivery.ack(BasicAckOptions::default()).await?;
                return Ok(());
            },
        };

        let message = RpcMessage::from_value(payload);
        let cancel = self.shutdown.child_token();
        let response = self.sink.dispatch(&self.session, message, cancel).await;

        // Ack after the dispatch hand-off; dispatch errors were already
        // turned into error responses, so the request is never re-queued.
        delivery.ack(BasicAckOptions::default()).await?;

        if let Some(response) = response {
            let mut value = serde_json::to_value(&response)
                .map_err(|e| TransportError::Amqp(format!("serialize response: {e}")))?;
            attach_routing(&mut value, correlation_id, reply_to);
            self.publish_response(channel, value).await?;
        }
        Ok(())
    }

    async fn publish_response(&self, channel: &Channel, mut value: Value) -> TransportResult<()> {
        let Some((correlation_id, reply_to)) = take_routing(&mut value) else {
            warn!("Response without replyTo, dropping");
            return Ok(());
        };

        let payload = serde_json::to_vec(&value)
            .map_err(|e| TransportError::Amqp(format!("serialize response: {e}")))?;
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json".to_string()));
        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }

        // Reply queues are addressed directly through the default
        // exchange, keyed by queue name.
        let _confirm = channel
            .basic_publish(
                "",
                &reply_to,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?;
        debug!(reply_to, "Published response");
        Ok(())
    }

    async fn publish_notification(
        &self,
        channel: &Channel,
        notification: &sonar_core::RpcNotification,
    ) {
        let Ok(payload) = serde_json::to_vec(notification) else {
            return;
        };
        let routing_key = routing_key_for(&notification.method);
        if let Err(e) = channel
            .basic_publish(
                &self.config.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from("application/json".to_string())),
            )
            .await
        {
            warn!(error = %e, routing_key, "Failed to publish notification");
        }
    }
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("session", &self.session)
            .field("stream", &self.stream)
            .field("exchange", &self.config.exchange)
            .finish_non_exhaustive()
    }
}

/// The shared-work request queue for a session.
#[must_use]
pub fn request_queue_name(prefix: &str, session: &SessionId) -> String {
    format!("{prefix}.requests.{session}")
}

/// Every pattern a session's request queue binds to.
#[must_use]
pub fn binding_patterns(session: &SessionId, stream: &StreamId) -> Vec<String> {
    let mut patterns = vec![format!("{session}.{stream}.requests")];
    patterns.extend(GENERIC_PATTERNS.iter().map(ToString::to_string));
    patterns
}

/// The response routing key for a session/stream pair.
#[must_use]
pub fn response_routing_key(session: &SessionId, stream: &StreamId) -> String {
    format!("{session}.{stream}.responses")
}

/// Store routing metadata on the internal message object.
fn attach_routing(value: &mut Value, correlation_id: Option<String>, reply_to: Option<String>) {
    if let Value::Object(map) = value {
        if let Some(correlation_id) = correlation_id {
            map.insert(ROUTE_CORRELATION.to_string(), Value::String(correlation_id));
        }
        if let Some(reply_to) = reply_to {
            map.insert(ROUTE_REPLY_TO.to_string(), Value::String(reply_to));
        }
    }
}

/// Take routing metadata back off the message object, stripping it from
/// the payload that goes on the wire.
fn take_routing(value: &mut Value) -> Option<(Option<String>, String)> {
    let map = value.as_object_mut()?;
    let correlation_id = map
        .remove(ROUTE_CORRELATION)
        .and_then(|v| v.as_str().map(ToString::to_string));
    let reply_to = map
        .remove(ROUTE_REPLY_TO)
        .and_then(|v| v.as_str().map(ToString::to_string))?;
    Some((correlation_id, reply_to))
}

/// Exponential backoff: `500ms * 2^(attempt-1)`, capped at 30 s.
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    BACKOFF_CAP.min(BACKOFF_BASE.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn queue_and_binding_names_follow_the_contract() {
        let session = SessionId::from_string("sess-1");
        let stream = StreamId::from_string("stream-1");

        assert_eq!(
            request_queue_name("mcp.discovery", &session),
            "mcp.discovery.requests.sess-1"
        );
        assert_eq!(
            binding_patterns(&session, &stream),
            vec![
                "sess-1.stream-1.requests",
                "mcp.request.#",
                "mcp.tools.#",
                "mcp.resources.#",
                "mcp.prompts.#",
            ]
        );
        assert_eq!(
            response_routing_key(&session, &stream),
            "sess-1.stream-1.responses"
        );
    }

    #[test]
    fn routing_metadata_round_trips_and_is_stripped() {
        let mut response = json!({
            "jsonrpc": "2.0",
            "id": 42,
            "result": {"tools": []},
        });
        attach_routing(
            &mut response,
            Some("corr-X".to_string()),
            Some("reply.q.1".to_string()),
        );
        assert_eq!(response["_correlationId"], json!("corr-X"));

        let (correlation_id, reply_to) = take_routing(&mut response).unwrap();
        assert_eq!(correlation_id.as_deref(), Some("corr-X"));
        assert_eq!(reply_to, "reply.q.1");

        // The published payload carries no routing metadata.
        assert!(response.get("_correlationId").is_none());
        assert!(response.get("_replyTo").is_none());
        assert_eq!(response["id"], json!(42));
    }

    #[test]
    fn response_without_reply_to_is_undeliverable() {
        let mut response = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        attach_routing(&mut response, Some("corr".to_string()), None);
        assert!(take_routing(&mut response).is_none());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(2));
        assert_eq!(backoff_delay(7), Duration::from_secs(30));
        assert_eq!(backoff_delay(40), Duration::from_secs(30));
    }

}
