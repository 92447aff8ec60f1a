//! HTTP transport: `POST /` answered over SSE, per-session notification
//! streams, health, and the RFC 9728 metadata endpoint.
//!
//! A synthetic `mcp-session-id` header is issued on `initialize` and
//! required on every subsequent call. Sessions expire after an idle
//! window; a sweeper task reaps them and drops their notification
//! subscriptions. `/health` and the protected-resource-metadata endpoint
//! are exempt from both authentication and session requirements.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sonar_core::rpc::codes;
use sonar_core::{MessageKind, RpcMessage, SessionId};
use sonar_registry::NotificationHub;

use crate::error::{TransportError, TransportResult};
use crate::oauth::{AuthFailure, OAuthValidator, RPC_SCOPE};
use crate::sink::MessageSink;

/// The session header issued on `initialize`.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Default idle window before a session expires.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(600);

struct SessionEntry {
    #[allow(dead_code)]
    created_at: Instant,
    last_seen: Instant,
}

/// Live HTTP sessions.
#[derive(Default)]
pub struct SessionTable {
    entries: DashMap<String, SessionEntry>,
}

impl SessionTable {
    /// Register a fresh session.
    fn create(&self) -> SessionId {
        let session = SessionId::generate();
        let now = Instant::now();
        self.entries.insert(
            session.as_str().to_string(),
            SessionEntry {
                created_at: now,
                last_seen: now,
            },
        );
        session
    }

    /// Touch a session, refreshing its idle clock. Returns `false` for
    /// unknown (or already expired) sessions.
    fn touch(&self, session: &str) -> bool {
        match self.entries.get_mut(session) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                true
            },
            None => false,
        }
    }

    /// Remove sessions idle past the window; returns the reaped IDs.
    fn expire_idle(&self, window: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_seen) > window)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired.into_iter().map(SessionId::from_string).collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no live sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared state behind the HTTP routes.
pub struct HttpState {
    sink: Arc<dyn MessageSink>,
    hub: Arc<NotificationHub>,
    sessions: SessionTable,
    oauth: Option<Arc<OAuthValidator>>,
    server_url: String,
    shutdown: CancellationToken,
}

impl HttpState {
    /// Build the shared state.
    #[must_use]
    pub fn new(
        sink: Arc<dyn MessageSink>,
        hub: Arc<NotificationHub>,
        oauth: Option<Arc<OAuthValidator>>,
        server_url: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            hub,
            sessions: SessionTable::default(),
            oauth,
            server_url: server_url.into(),
            shutdown: CancellationToken::new(),
        })
    }

    /// The session table (exposed for health output and tests).
    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Signal the server and its sweeper to stop.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Spawn the idle-session sweeper.
    pub fn spawn_session_sweeper(self: &Arc<Self>, window: Duration) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window / 4);
            loop {
                tokio::select! {
                    () = state.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for session in state.sessions.expire_idle(window) {
                            debug!(session = %session, "Session expired");
                            state.hub.unsubscribe(&session);
                        }
                    },
                }
            }
        });
    }
}

impl std::fmt::Debug for HttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpState")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

/// Build the router with all routes and the OAuth middleware installed.
#[must_use]
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/", get(handle_stream).post(handle_post))
        .route("/health", get(handle_health))
        .route(
            "/.well-known/oauth-protected-resource",
            get(handle_metadata),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            oauth_middleware,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the state's shutdown token fires.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(state: Arc<HttpState>, addr: &str) -> TransportResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::Http(format!("bind {addr}: {e}")))?;
    info!(addr, "HTTP transport listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| TransportError::Http(e.to_string()))
}

async fn oauth_middleware(
    State(state): State<Arc<HttpState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(oauth) = state.oauth.as_ref().filter(|o| o.enabled()) else {
        return next.run(request).await;
    };
    if OAuthValidator::is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match oauth.authorize(authorization, RPC_SCOPE).await {
        Ok(_claims) => next.run(request).await,
        Err(failure) => auth_failure_response(&failure, oauth.realm()),
    }
}

fn auth_failure_response(failure: &AuthFailure, realm: &str) -> Response {
    let body = json!({
        "error": failure.error_code(),
        "error_description": failure.challenge(realm),
    });
    Response::builder()
        .status(failure.status())
        .header(header::WWW_AUTHENTICATE, failure.challenge(realm))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_post(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return rpc_error_response(StatusCode::BAD_REQUEST, codes::PARSE_ERROR, "Parse error");
    };

    let is_initialize = MessageKind::classify(&value) == MessageKind::Request
        && value.get("method").and_then(Value::as_str) == Some("initialize");

    let (session, issue_header) = if is_initialize {
        (state.sessions.create(), true)
    } else {
        let Some(session) = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
        else {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                codes::INVALID_REQUEST,
                "missing mcp-session-id header",
            );
        };
        if !state.sessions.touch(&session) {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                codes::INVALID_REQUEST,
                "unknown session",
            );
        }
        (SessionId::from_string(session), false)
    };

    let message = RpcMessage::from_value(value);
    let cancel = state.shutdown.child_token();
    let response = state.sink.dispatch(&session, message, cancel).await;

    match response {
        Some(response) => {
            let Ok(data) = serde_json::to_string(&response) else {
                return rpc_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::INTERNAL_ERROR,
                    "serialization failure",
                );
            };
            let stream = futures::stream::once(async move {
                Ok::<_, Infallible>(Event::default().event("message").data(data))
            });
            let mut sse = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
            if issue_header
                && let Ok(header_value) = session.as_str().parse()
            {
                sse.headers_mut().insert(SESSION_HEADER, header_value);
            }
            sse
        },
        // Notifications are accepted without a body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn handle_stream(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            codes::INVALID_REQUEST,
            "missing mcp-session-id header",
        );
    };
    if !state.sessions.touch(session) {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            codes::INVALID_REQUEST,
            "unknown session",
        );
    }

    // Re-subscribing replaces any previous channel for this session, so
    // a reconnecting client does not leak receivers.
    let rx = state.hub.subscribe(SessionId::from_string(session));
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let notification = rx.recv().await?;
        let data = match serde_json::to_string(&notification) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Undeliverable notification");
                return None;
            },
        };
        Some((
            Ok::<_, Infallible>(Event::default().event("message").data(data)),
            rx,
        ))
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_health(State(state): State<Arc<HttpState>>) -> Response {
    axum::Json(json!({
        "status": "ok",
        "transport": "http",
        "sessions": state.sessions.len(),
    }))
    .into_response()
}

async fn handle_metadata(State(state): State<Arc<HttpState>>) -> Response {
    let doc = match &state.oauth {
        Some(oauth) => oauth.protected_resource_metadata(&state.server_url),
        None => json!({
            "resource": state.server_url,
            "authorization_servers": [],
            "scopes_supported": [],
            "bearer_methods_supported": ["header"],
        }),
    };
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        axum::Json(doc),
    )
        .into_response()
}

fn rpc_error_response(status: StatusCode, code: i64, message: &str) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": code, "message": message},
    });
    (status, axum::Json(body)).into_response()
}
