//! Registry error types.

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A tool with this name is already registered.
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    /// A resource with this URI is already registered.
    #[error("duplicate resource: {0}")]
    DuplicateResource(String),

    /// A prompt with this name is already registered.
    #[error("duplicate prompt: {0}")]
    DuplicatePrompt(String),

    /// The named tool is not registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The named resource is not registered.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// The named prompt is not registered.
    #[error("unknown prompt: {0}")]
    UnknownPrompt(String),

    /// A tool declared an unusable input schema.
    #[error("invalid schema for tool {name}: {}", reasons.join("; "))]
    InvalidSchema {
        /// The offending tool.
        name: String,
        /// What is wrong with the declaration.
        reasons: Vec<String>,
    },

    /// The named module is not known to the registry.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// The operation is not legal in the module's current state.
    #[error("module {module} is {state}, cannot {operation}")]
    ModuleState {
        /// The module.
        module: String,
        /// Its current state.
        state: String,
        /// What was attempted.
        operation: String,
    },

    /// A module failed to load or register.
    #[error("module {module} failed: {message}")]
    ModuleFailed {
        /// The module.
        module: String,
        /// Failure reason.
        message: String,
    },

    /// Module dependencies form a cycle.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// A module depends on something no scan root provides.
    #[error("module {module} depends on unknown module {dependency}")]
    MissingDependency {
        /// The dependent module.
        module: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The filesystem watcher could not be set up.
    #[error("watcher error: {0}")]
    Watcher(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
