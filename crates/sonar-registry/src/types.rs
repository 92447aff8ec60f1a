//! Registration records and handler traits.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use sonar_core::{SchemaShape, ToolResult};

/// Per-request context passed to every tool handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The session the request arrived on, if any.
    pub session: Option<String>,
    /// Cancelled when the client disconnects or sends a cancel
    /// notification; handlers propagate this to external calls.
    pub cancel: CancellationToken,
    /// Deadline for external-command invocations.
    pub timeout: Duration,
}

impl ToolContext {
    /// A context with no session and the default 30 s timeout.
    #[must_use]
    pub fn background() -> Self {
        Self {
            session: None,
            cancel: CancellationToken::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// An invocable tool implementation.
///
/// Handlers never panic outward: failures become a [`ToolResult`] with
/// `isError` or an `Err` that the dispatcher translates to a JSON-RPC
/// error. Handlers must tolerate concurrent invocation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Invoke the tool with validated parameters.
    ///
    /// # Errors
    ///
    /// Returns an error string for protocol-level failures; handler-level
    /// failures (a subprocess exiting non-zero) should be an error
    /// [`ToolResult`] instead so the client still sees the output text.
    async fn call(&self, ctx: &ToolContext, params: Value) -> Result<ToolResult, String>;
}

/// Produces the content of a resource on demand.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Read the resource.
    ///
    /// # Errors
    ///
    /// Returns an error string when the content cannot be produced.
    async fn read(&self, uri: &str, params: Option<&Value>) -> Result<Vec<u8>, String>;
}

/// Renders a prompt into messages.
#[async_trait]
pub trait PromptRenderer: Send + Sync {
    /// Render with the given arguments.
    ///
    /// # Errors
    ///
    /// Returns an error string when required arguments are missing.
    async fn render(&self, arguments: Option<&Value>) -> Result<Vec<PromptMessage>, String>;
}

/// A registered tool.
#[derive(Clone)]
pub struct ToolRegistration {
    /// Globally unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Structured input schema.
    pub schema: SchemaShape,
    /// Tool category (e.g. `network`, `memory`, `credentials`).
    pub category: String,
    /// The module that owns this tool.
    pub module_origin: String,
    /// The implementation.
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("module_origin", &self.module_origin)
            .field("complex", &self.schema.is_complex())
            .finish_non_exhaustive()
    }
}

/// A registered resource, keyed by URI.
#[derive(Clone)]
pub struct ResourceRegistration {
    /// Absolute URI, globally unique.
    pub uri: String,
    /// Human-readable name.
    pub name: String,
    /// MIME type of the produced content.
    pub mime_type: String,
    /// The module that owns this resource.
    pub module_origin: String,
    /// Lazy content provider.
    pub provider: Arc<dyn ResourceProvider>,
}

impl std::fmt::Debug for ResourceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistration")
            .field("uri", &self.uri)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// An argument a prompt accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default)]
    pub required: bool,
}

/// A message produced by rendering a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// A registered prompt.
#[derive(Clone)]
pub struct PromptRegistration {
    /// Globally unique prompt name.
    pub name: String,
    /// Short title.
    pub title: String,
    /// Description.
    pub description: String,
    /// Ordered argument list.
    pub arguments: Vec<PromptArgument>,
    /// The module that owns this prompt.
    pub module_origin: String,
    /// Renders the prompt into messages.
    pub renderer: Arc<dyn PromptRenderer>,
}

impl std::fmt::Debug for PromptRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRegistration")
            .field("name", &self.name)
            .field("arguments", &self.arguments.len())
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of a tool module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Registrations from this module are being accepted.
    Loading,
    /// Fully registered and serving.
    Active,
    /// Load or reload failed; its registrations have been removed.
    Failed,
    /// Explicitly unloaded.
    Unloaded,
}

impl ModuleState {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Unloaded => "unloaded",
        }
    }
}

/// In-memory record of a tool module.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// Module name, unique per registry.
    pub name: String,
    /// Category (mirrors its tools' categories).
    pub category: String,
    /// Source file backing this module, when hot-reloadable.
    pub file_path: Option<PathBuf>,
    /// Lifecycle state.
    pub state: ModuleState,
    /// Names of tools this module registered.
    pub tool_names: HashSet<String>,
    /// When the module finished loading.
    pub loaded_at: Option<DateTime<Utc>>,
    /// How long the load took.
    pub load_duration: Option<Duration>,
    /// Last failure, retained across state changes.
    pub last_error: Option<String>,
}
