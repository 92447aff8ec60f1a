//! The server dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sonar_cmdb::Cmdb;
use sonar_core::rpc::codes;
use sonar_core::{
    RpcError, RpcMessage, RpcNotification, RpcRequest, RpcResponse, SchemaShape, SessionId,
    ToolResult,
};
use sonar_plugins::{PluginError, PluginManager};
use sonar_registry::{DiscoveryEngine, Registry, RegistryError, ToolContext};
use sonar_transport::MessageSink;
use sonar_vault::CredentialVault;

/// Protocol version advertised on `initialize`.
const PROTOCOL_VERSION: &str = "2025-06-18";

/// Default handler timeout for external calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Nmap scans get a much longer leash.
const NMAP_TIMEOUT: Duration = Duration::from_secs(600);

/// The server: registries, stores, and the dispatcher over them.
pub struct Server {
    registry: Arc<Registry>,
    engine: Arc<DiscoveryEngine>,
    cmdb: Arc<Cmdb>,
    vault: Arc<CredentialVault>,
    plugins: Option<Arc<PluginManager>>,
    in_flight: DashMap<String, CancellationToken>,
}

impl Server {
    /// Assemble a server from its components.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<DiscoveryEngine>,
        cmdb: Arc<Cmdb>,
        vault: Arc<CredentialVault>,
        plugins: Option<Arc<PluginManager>>,
    ) -> Self {
        Self {
            registry,
            engine,
            cmdb,
            vault,
            plugins,
            in_flight: DashMap::new(),
        }
    }

    /// The registry behind this server.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The CMDB behind this server.
    #[must_use]
    pub fn cmdb(&self) -> &Arc<Cmdb> {
        &self.cmdb
    }

    /// The credential vault behind this server.
    #[must_use]
    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    async fn handle_request(
        &self,
        session: &SessionId,
        request: RpcRequest,
        cancel: CancellationToken,
    ) -> RpcResponse {
        let id = request.id.clone();
        let params = request.params.unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "initialize" => Ok(self.initialize_result()),
            "tools/list" => Ok(self.tools_list()),
            "tools/call" => self.tools_call(session, &id, params, cancel).await,
            "resources/list" => Ok(self.resources_list()),
            "resources/read" => self.resources_read(params).await,
            "prompts/list" => Ok(self.prompts_list()),
            "prompts/get" => self.prompts_get(params).await,
            "registry_get_status" => Ok(self.registry_status()),
            "registry_reload_module" => self.registry_reload(&params),
            "plugin_list" => self.plugin_list(),
            "plugin_load" => self.plugin_op(&params, PluginManager::load),
            "plugin_activate" => self.plugin_op(&params, PluginManager::activate),
            "plugin_deactivate" => self.plugin_op(&params, PluginManager::deactivate),
            "plugin_unload" => self.plugin_op(&params, PluginManager::unload),
            other => Err(RpcError::method_not_found(other)),
        };

        match result {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "sonar-discovery",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": {"listChanged": true},
                "resources": {"listChanged": true},
                "prompts": {"listChanged": true},
            },
        })
    }

    fn tools_list(&self) -> Value {
        let tools: Vec<Value> = self
            .registry
            .list_tools()
            .into_iter()
            .map(|tool| {
                // Complex shapes go through the array-preserving path;
                // both render the declared fields faithfully.
                let input_schema = match &tool.schema {
                    SchemaShape::Complex(shape) | SchemaShape::Simple(shape) => {
                        shape.to_json_schema()
                    },
                };
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn tools_call(
        &self,
        session: &SessionId,
        id: &sonar_core::RpcId,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params(vec!["params.name: missing".into()]))?
            .to_string();
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let Some(tool) = self.registry.lookup_tool(&name) else {
            return Err(
                RpcError::new(codes::UNKNOWN_TOOL, format!("unknown tool: {name}"))
                    .with_data(json!({"subtype": "unknown_tool"})),
            );
        };

        let arguments = tool
            .schema
            .shape()
            .normalize(arguments)
            .map_err(RpcError::invalid_params)?;

        let key = in_flight_key(session, id);
        self.in_flight.insert(key.clone(), cancel.clone());

        let ctx = ToolContext {
            session: Some(session.as_str().to_string()),
            cancel: cancel.clone(),
            timeout: default_timeout(&name),
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(RpcError::cancelled()),
            result = tool.handler.call(&ctx, arguments) => match result {
                Ok(tool_result) => serde_json::to_value(&tool_result)
                    .map_err(|e| RpcError::internal("serialization", e.to_string())),
                Err(message) => {
                    // Handler-level failures stay in the tool-result error
                    // form so the client still sees the output text.
                    let result = ToolResult::error(message);
                    serde_json::to_value(&result)
                        .map_err(|e| RpcError::internal("serialization", e.to_string()))
                },
            },
        };

        self.in_flight.remove(&key);
        outcome
    }

    fn resources_list(&self) -> Value {
        let resources: Vec<Value> = self
            .registry
            .list_resources()
            .into_iter()
            .map(|resource| {
                json!({
                    "uri": resource.uri,
                    "name": resource.name,
                    "mimeType": resource.mime_type,
                })
            })
            .collect();
        json!({ "resources": resources })
    }

    async fn resources_read(&self, params: Value) -> Result<Value, RpcError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params(vec!["params.uri: missing".into()]))?;

        let Some(resource) = self.registry.lookup_resource(uri) else {
            return Err(RpcError::new(
                codes::UNKNOWN_TOOL,
                format!("unknown resource: {uri}"),
            ));
        };

        let bytes = resource
            .provider
            .read(uri, params.get("params"))
            .await
            .map_err(|e| RpcError::internal("resource", e))?;

        let content = match String::from_utf8(bytes) {
            Ok(text) => json!({
                "uri": uri,
                "mimeType": resource.mime_type,
                "text": text,
            }),
            Err(e) => json!({
                "uri": uri,
                "mimeType": resource.mime_type,
                "blob": BASE64.encode(e.into_bytes()),
            }),
        };
        Ok(json!({ "contents": [content] }))
    }

    fn prompts_list(&self) -> Value {
        let prompts: Vec<Value> = self
            .registry
            .list_prompts()
            .into_iter()
            .map(|prompt| {
                json!({
                    "name": prompt.name,
                    "title": prompt.title,
                    "description": prompt.description,
                    "arguments": prompt.arguments,
                })
            })
            .collect();
        json!({ "prompts": prompts })
    }

    async fn prompts_get(&self, params: Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params(vec!["params.name: missing".into()]))?;

        let Some(prompt) = self.registry.lookup_prompt(name) else {
            return Err(RpcError::new(
                codes::UNKNOWN_TOOL,
                format!("unknown prompt: {name}"),
            ));
        };

        for argument in &prompt.arguments {
            if argument.required
                && params
                    .get("arguments")
                    .and_then(|a| a.get(&argument.name))
                    .is_none()
            {
                return Err(RpcError::invalid_params(vec![format!(
                    "params.arguments.{}: missing required argument",
                    argument.name
                )]));
            }
        }

        let messages = prompt
            .renderer
            .render(params.get("arguments"))
            .await
            .map_err(|e| RpcError::internal("prompt", e))?;

        let messages: Vec<Value> = messages
            .into_iter()
            .map(|m| {
                json!({
                    "role": m.role,
                    "content": {"type": "text", "text": m.content},
                })
            })
            .collect();
        Ok(json!({
            "description": prompt.description,
            "messages": messages,
        }))
    }

    fn registry_status(&self) -> Value {
        let modules: Vec<Value> = self
            .registry
            .list_modules()
            .into_iter()
            .map(|module| {
                json!({
                    "name": module.name,
                    "category": module.category,
                    "state": module.state.as_str(),
                    "tools": module.tool_names.len(),
                    "loadedAt": module.loaded_at,
                    "lastError": module.last_error,
                })
            })
            .collect();
        json!({
            "modules": modules,
            "tools": self.registry.list_tools().len(),
            "resources": self.registry.list_resources().len(),
            "prompts": self.registry.list_prompts().len(),
            "registrationInProgress": self.registry.registration_in_progress(),
            "registrationComplete": self.registry.registration_complete(),
        })
    }

    fn registry_reload(&self, params: &Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params(vec!["params.name: missing".into()]))?;
        self.engine
            .load_one(name, &self.registry)
            .map_err(registry_error)?;
        Ok(json!({ "reloaded": name }))
    }

    fn plugin_list(&self) -> Result<Value, RpcError> {
        let manager = self.plugin_manager()?;
        Ok(json!({ "plugins": manager.list() }))
    }

    fn plugin_op(
        &self,
        params: &Value,
        op: fn(&PluginManager, &str) -> Result<sonar_plugins::PluginInfo, PluginError>,
    ) -> Result<Value, RpcError> {
        let manager = self.plugin_manager()?;
        let id = params
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params(vec!["params.id: missing".into()]))?;
        let info = op(manager, id).map_err(plugin_error)?;
        serde_json::to_value(info)
            .map_err(|e| RpcError::internal("serialization", e.to_string()))
    }

    fn plugin_manager(&self) -> Result<&PluginManager, RpcError> {
        self.plugins
            .as_deref()
            .ok_or_else(|| RpcError::new(codes::ILLEGAL_STATE, "plugin manager not configured"))
    }

    fn handle_notification(&self, session: &SessionId, notification: &RpcNotification) {
        match notification.method.as_str() {
            "notifications/cancelled" => {
                let request_id = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId").or_else(|| p.get("id")))
                    .map(Value::to_string);
                if let Some(request_id) = request_id {
                    let key = format!("{}:{}", session.as_str(), request_id.trim_matches('"'));
                    if let Some((_, token)) = self.in_flight.remove(&key) {
                        debug!(key, "Cancelling in-flight request");
                        token.cancel();
                    }
                }
            },
            "_malformed" => {
                warn!(session = %session, "Dropped malformed message");
            },
            other => {
                debug!(method = other, "Ignoring notification");
            },
        }
    }
}

#[async_trait]
impl MessageSink for Server {
    async fn dispatch(
        &self,
        session: &SessionId,
        message: RpcMessage,
        cancel: CancellationToken,
    ) -> Option<RpcResponse> {
        match message {
            RpcMessage::Request(request) => {
                Some(self.handle_request(session, request, cancel).await)
            },
            RpcMessage::Notification(notification) => {
                self.handle_notification(session, &notification);
                None
            },
            RpcMessage::Response(response) => {
                debug!(id = %response.id, "Ignoring unsolicited response");
                None
            },
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

fn in_flight_key(session: &SessionId, id: &sonar_core::RpcId) -> String {
    format!("{}:{}", session.as_str(), id)
}

/// Per-tool external-command timeout.
fn default_timeout(tool: &str) -> Duration {
    if tool.starts_with("nmap_") {
        NMAP_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    }
}

fn plugin_error(e: PluginError) -> RpcError {
    let code = match &e {
        PluginError::Unsigned(_) => codes::UNSIGNED,
        PluginError::BadSignature { .. } => codes::BAD_SIGNATURE,
        PluginError::Integrity { .. } | PluginError::Drift { .. } => codes::INTEGRITY_ERROR,
        PluginError::IllegalState { .. } => codes::ILLEGAL_STATE,
        PluginError::NotFound(_) => codes::INVALID_PARAMS,
        _ => codes::INTERNAL_ERROR,
    };
    RpcError::new(code, e.to_string())
}

fn registry_error(e: RegistryError) -> RpcError {
    let code = match &e {
        RegistryError::DuplicateTool(_)
        | RegistryError::DuplicateResource(_)
        | RegistryError::DuplicatePrompt(_) => codes::DUPLICATE_REGISTRATION,
        RegistryError::UnknownModule(_) => codes::INVALID_PARAMS,
        RegistryError::ModuleState { .. } => codes::ILLEGAL_STATE,
        _ => codes::INTERNAL_ERROR,
    };
    RpcError::new(code, e.to_string())
}
