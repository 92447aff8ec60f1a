//! OAuth 2.1 resource-server middleware.
//!
//! Every non-exempt HTTP request must carry `Authorization: Bearer
//! <token>`. Tokens are validated through an RFC 7662 introspection
//! endpoint with a concurrency-safe cache; cache lifetime is the lesser
//! of the token's remaining lifetime and the configured TTL. Without an
//! introspection endpoint — and only outside production — a fixed demo
//! token pattern unblocks development.
//!
//! Exempt paths: `/health`, `/`+`GET` root metadata is *not* exempt (the
//! notification stream carries data); the exemption list is exactly
//! `/health` and `/.well-known/oauth-protected-resource`.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use sonar_config::OAuthConfig;

/// Paths served without authentication or a session.
pub const EXEMPT_PATHS: &[&str] = &["/health", "/.well-known/oauth-protected-resource"];

/// Tokens matching this prefix are accepted in development mode.
pub const DEMO_TOKEN_PREFIX: &str = "mcp-demo-";

/// Scope required to invoke RPC methods over HTTP.
pub const RPC_SCOPE: &str = "mcp:tools";

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No usable `Authorization: Bearer` header.
    MissingToken,
    /// The token is expired, revoked, or unknown.
    InvalidToken(String),
    /// The token lacks the required scope.
    InsufficientScope {
        /// The scope the handler requires.
        required: String,
    },
}

impl AuthFailure {
    /// The HTTP status this failure maps to.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::MissingToken | Self::InvalidToken(_) => 401,
            Self::InsufficientScope { .. } => 403,
        }
    }

    /// The `WWW-Authenticate` challenge for this failure.
    #[must_use]
    pub fn challenge(&self, realm: &str) -> String {
        match self {
            Self::MissingToken => format!(r#"Bearer realm="{realm}""#),
            Self::InvalidToken(description) => format!(
                r#"Bearer realm="{realm}", error="invalid_token", error_description="{description}""#
            ),
            Self::InsufficientScope { required } => format!(
                r#"Bearer realm="{realm}", error="insufficient_scope", scope="{required}""#
            ),
        }
    }

    /// The OAuth error code for the JSON body.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingToken => "invalid_request",
            Self::InvalidToken(_) => "invalid_token",
            Self::InsufficientScope { .. } => "insufficient_scope",
        }
    }
}

/// A validated token's claims.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    /// Space-separated scopes granted to the token.
    pub scope: String,
}

impl TokenClaims {
    /// Whether the claims include a scope.
    #[must_use]
    pub fn has_scope(&self, required: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == required)
    }
}

struct CachedToken {
    claims: TokenClaims,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// The middleware's shared state.
pub struct OAuthValidator {
    config: OAuthConfig,
    production: bool,
    cache: DashMap<String, CachedToken>,
    client: reqwest::Client,
}

impl OAuthValidator {
    /// Build a validator from configuration.
    #[must_use]
    pub fn new(config: OAuthConfig, production: bool) -> Self {
        Self {
            config,
            production,
            cache: DashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Whether the middleware is enabled at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// The configured realm.
    #[must_use]
    pub fn realm(&self) -> &str {
        &self.config.realm
    }

    /// Whether a path is exempt from authentication and sessions.
    #[must_use]
    pub fn is_exempt(path: &str) -> bool {
        EXEMPT_PATHS.contains(&path)
    }

    /// Extract the bearer token from an `Authorization` header value.
    #[must_use]
    pub fn bearer_token(header: Option<&str>) -> Option<&str> {
        let header = header?;
        let token = header.strip_prefix("Bearer ").or_else(|| header.strip_prefix("bearer "))?;
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    }

    /// Validate a token and enforce the required scope.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthFailure`] to translate into 401/403.
    pub async fn authorize(
        &self,
        authorization_header: Option<&str>,
        required_scope: &str,
    ) -> Result<TokenClaims, AuthFailure> {
        let token = Self::bearer_token(authorization_header).ok_or(AuthFailure::MissingToken)?;
        let claims = self.validate_token(token).await?;
        if !claims.has_scope(required_scope) {
            return Err(AuthFailure::InsufficientScope {
                required: required_scope.to_string(),
            });
        }
        Ok(claims)
    }

    /// Validate a token via cache, introspection, or the demo pattern.
    ///
    /// # Errors
    ///
    /// Returns [`AuthFailure::InvalidToken`] when nothing vouches for it.
    pub async fn validate_token(&self, token: &str) -> Result<TokenClaims, AuthFailure> {
        if let Some(cached) = self.cache.get(token) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.claims.clone());
            }
            drop(cached);
            self.cache.remove(token);
        }

        let Some(endpoint) = self.config.introspection_endpoint.clone() else {
            return self.validate_demo_token(token);
        };

        let response = self.introspect(&endpoint, token).await?;
        if !response.active {
            return Err(AuthFailure::InvalidToken("token is not active".into()));
        }

        let claims = TokenClaims {
            scope: response.scope.unwrap_or_default(),
        };

        let remaining = response
            .exp
            .map(|exp| {
                let now = chrono::Utc::now().timestamp();
                Duration::from_secs(exp.saturating_sub(now).max(0).unsigned_abs())
            })
            .unwrap_or(self.config.token_cache_ttl);
        let ttl = remaining.min(self.config.token_cache_ttl);
        if !ttl.is_zero() {
            self.cache.insert(
                token.to_string(),
                CachedToken {
                    claims: claims.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        Ok(claims)
    }

    async fn introspect(
        &self,
        endpoint: &str,
        token: &str,
    ) -> Result<IntrospectionResponse, AuthFailure> {
        let mut request = self
            .client
            .post(endpoint)
            .form(&[("token", token), ("token_type_hint", "access_token")]);
        if let Some(client_id) = &self.config.client_id {
            request = request.basic_auth(client_id, self.config.client_secret.as_deref());
        }

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "Token introspection failed");
            AuthFailure::InvalidToken("introspection unavailable".into())
        })?;
        response
            .json::<IntrospectionResponse>()
            .await
            .map_err(|e| {
                warn!(error = %e, "Token introspection returned garbage");
                AuthFailure::InvalidToken("introspection unavailable".into())
            })
    }

    fn validate_demo_token(&self, token: &str) -> Result<TokenClaims, AuthFailure> {
        if self.production {
            return Err(AuthFailure::InvalidToken(
                "no introspection endpoint configured".into(),
            ));
        }
        if token.starts_with(DEMO_TOKEN_PREFIX) {
            debug!("Accepted demo token");
            let scope = if self.config.supported_scopes.is_empty() {
                RPC_SCOPE.to_string()
            } else {
                self.config.supported_scopes.join(" ")
            };
            return Ok(TokenClaims { scope });
        }
        Err(AuthFailure::InvalidToken("unknown token".into()))
    }

    /// The RFC 9728 Protected Resource Metadata document.
    #[must_use]
    pub fn protected_resource_metadata(&self, server_url: &str) -> serde_json::Value {
        serde_json::json!({
            "resource": self
                .config
                .resource_server_uri
                .clone()
                .unwrap_or_else(|| server_url.to_string()),
            "authorization_servers": self
                .config
                .authorization_server
                .as_ref()
                .map(|s| vec![s.clone()])
                .unwrap_or_default(),
            "scopes_supported": self.config.supported_scopes,
            "bearer_methods_supported": ["header"],
        })
    }
}

impl std::fmt::Debug for OAuthValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthValidator")
            .field("enabled", &self.config.enabled)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
