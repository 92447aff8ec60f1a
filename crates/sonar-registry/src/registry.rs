//! The core registry.
//!
//! Owns the authoritative tool, resource, and prompt inventories. Every
//! name/URI appears at most once; mutations happen under a single write
//! lock and broadcast `list_changed` *after* they are visible to list
//! calls. Modules own their registrations: unloading or failing a module
//! removes everything it registered in one atomic step.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::notify::{ListChangedKind, NotificationHub};
use crate::types::{
    ModuleRecord, ModuleState, PromptRegistration, ResourceRegistration, ToolRegistration,
};

#[derive(Default)]
struct Inner {
    tools: HashMap<String, ToolRegistration>,
    tool_order: Vec<String>,
    resources: HashMap<String, ResourceRegistration>,
    resource_order: Vec<String>,
    prompts: HashMap<String, PromptRegistration>,
    prompt_order: Vec<String>,
    modules: HashMap<String, ModuleRecord>,
    module_starts: HashMap<String, Instant>,
    registration_in_progress: bool,
    registration_complete: bool,
}

/// The tool/resource/prompt registry.
pub struct Registry {
    inner: RwLock<Inner>,
    hub: Arc<NotificationHub>,
    bootstrap_lock: tokio::sync::Mutex<()>,
}

impl Registry {
    /// Create an empty registry broadcasting through the given hub.
    #[must_use]
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            hub,
            bootstrap_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The notifications hub this registry broadcasts through.
    #[must_use]
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    // -----------------------------------------------------------------
    // Module lifecycle
    // -----------------------------------------------------------------

    /// Begin a module's registration batch.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ModuleState`] if the module is already
    /// loading or active. A `Failed`/`Unloaded` module may be restarted.
    pub fn start_module(
        &self,
        name: &str,
        category: &str,
        file_path: Option<PathBuf>,
    ) -> RegistryResult<()> {
        let mut inner = self.write();
        if let Some(existing) = inner.modules.get(name)
            && matches!(existing.state, ModuleState::Loading | ModuleState::Active)
        {
            return Err(RegistryError::ModuleState {
                module: name.to_string(),
                state: existing.state.as_str().to_string(),
                operation: "start".to_string(),
            });
        }

        inner.modules.insert(
            name.to_string(),
            ModuleRecord {
                name: name.to_string(),
                category: category.to_string(),
                file_path,
                state: ModuleState::Loading,
                tool_names: std::collections::HashSet::new(),
                loaded_at: None,
                load_duration: None,
                last_error: None,
            },
        );
        inner.module_starts.insert(name.to_string(), Instant::now());
        debug!(module = name, category, "Module loading");
        Ok(())
    }

    /// Commit a module's registration batch, marking it active.
    ///
    /// # Errors
    ///
    /// Returns an error if the module is unknown or not in `Loading`.
    pub fn complete_module(&self, name: &str) -> RegistryResult<()> {
        let mut inner = self.write();
        let started = inner.module_starts.remove(name);
        let module = inner
            .modules
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))?;
        if module.state != ModuleState::Loading {
            return Err(RegistryError::ModuleState {
                module: name.to_string(),
                state: module.state.as_str().to_string(),
                operation: "complete".to_string(),
            });
        }
        module.state = ModuleState::Active;
        module.loaded_at = Some(Utc::now());
        module.load_duration = started.map(|s| s.elapsed());
        info!(
            module = name,
            tools = module.tool_names.len(),
            "Module active"
        );
        Ok(())
    }

    /// Mark a module failed, rolling back everything it registered.
    ///
    /// Used both for batch rollback during startup and by the hot-reload
    /// watcher when a reload goes wrong.
    pub fn fail_module(&self, name: &str, error: impl Into<String>) {
        let error = error.into();
        let (removed_tools, removed_resources, removed_prompts) = {
            let mut inner = self.write();
            inner.module_starts.remove(name);
            let removed = remove_module_registrations(&mut inner, name);
            if let Some(module) = inner.modules.get_mut(name) {
                module.state = ModuleState::Failed;
                module.last_error = Some(error.clone());
                module.tool_names.clear();
            }
            removed
        };
        warn!(module = name, error = %error, "Module failed");
        self.broadcast_removals(removed_tools, removed_resources, removed_prompts);
    }

    /// Unload a module, removing all of its registrations atomically.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownModule`] if no such module exists.
    pub fn unload_module(&self, name: &str) -> RegistryResult<()> {
        let (removed_tools, removed_resources, removed_prompts) = {
            let mut inner = self.write();
            if !inner.modules.contains_key(name) {
                return Err(RegistryError::UnknownModule(name.to_string()));
            }
            inner.module_starts.remove(name);
            let removed = remove_module_registrations(&mut inner, name);
            if let Some(module) = inner.modules.get_mut(name) {
                module.state = ModuleState::Unloaded;
                module.tool_names.clear();
            }
            removed
        };
        info!(module = name, "Module unloaded");
        self.broadcast_removals(removed_tools, removed_resources, removed_prompts);
        Ok(())
    }

    /// A snapshot of one module record.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<ModuleRecord> {
        self.read().modules.get(name).cloned()
    }

    /// Snapshots of all module records.
    #[must_use]
    pub fn list_modules(&self) -> Vec<ModuleRecord> {
        let mut modules: Vec<ModuleRecord> = self.read().modules.values().cloned().collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    // -----------------------------------------------------------------
    // Tools
    // -----------------------------------------------------------------

    /// Register a tool.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidSchema`] for an unusable declaration
    /// - [`RegistryError::DuplicateTool`] if the name is taken
    /// - [`RegistryError::ModuleState`] if the owning module is not
    ///   `Loading` or `Active`
    pub fn register_tool(&self, tool: ToolRegistration) -> RegistryResult<()> {
        let mut reasons = Vec::new();
        if tool.name.is_empty() {
            reasons.push("name is empty".to_string());
        }
        if tool.name.contains(char::is_whitespace) {
            reasons.push("name contains whitespace".to_string());
        }
        if !reasons.is_empty() {
            return Err(RegistryError::InvalidSchema {
                name: tool.name,
                reasons,
            });
        }

        {
            let mut inner = self.write();
            if inner.tools.contains_key(&tool.name) {
                return Err(RegistryError::DuplicateTool(tool.name));
            }
            check_module_accepts(&inner, &tool.module_origin, "register tool")?;

            let name = tool.name.clone();
            let module = tool.module_origin.clone();
            inner.tools.insert(name.clone(), tool);
            inner.tool_order.push(name.clone());
            if let Some(record) = inner.modules.get_mut(&module) {
                record.tool_names.insert(name.clone());
            }
            debug!(tool = %name, module = %module, "Tool registered");
        }
        self.hub.list_changed(ListChangedKind::Tools);
        Ok(())
    }

    /// Unregister a tool by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTool`] if the name is not
    /// registered.
    pub fn unregister_tool(&self, name: &str) -> RegistryResult<()> {
        {
            let mut inner = self.write();
            let Some(tool) = inner.tools.remove(name) else {
                return Err(RegistryError::UnknownTool(name.to_string()));
            };
            inner.tool_order.retain(|n| n != name);
            if let Some(module) = inner.modules.get_mut(&tool.module_origin) {
                module.tool_names.remove(name);
            }
        }
        self.hub.list_changed(ListChangedKind::Tools);
        Ok(())
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn lookup_tool(&self, name: &str) -> Option<ToolRegistration> {
        self.read().tools.get(name).cloned()
    }

    /// Snapshot of all tools, in insertion order.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolRegistration> {
        let inner = self.read();
        inner
            .tool_order
            .iter()
            .filter_map(|name| inner.tools.get(name).cloned())
            .collect()
    }

    // -----------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------

    /// Register a resource.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateResource`] if the URI is taken
    /// or [`RegistryError::ModuleState`] if the owning module is not
    /// accepting registrations.
    pub fn register_resource(&self, resource: ResourceRegistration) -> RegistryResult<()> {
        {
            let mut inner = self.write();
            if inner.resources.contains_key(&resource.uri) {
                return Err(RegistryError::DuplicateResource(resource.uri));
            }
            check_module_accepts(&inner, &resource.module_origin, "register resource")?;
            let uri = resource.uri.clone();
            inner.resources.insert(uri.clone(), resource);
            inner.resource_order.push(uri);
        }
        self.hub.list_changed(ListChangedKind::Resources);
        Ok(())
    }

    /// Unregister a resource by URI.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownResource`] for unknown URIs.
    pub fn unregister_resource(&self, uri: &str) -> RegistryResult<()> {
        {
            let mut inner = self.write();
            if inner.resources.remove(uri).is_none() {
                return Err(RegistryError::UnknownResource(uri.to_string()));
            }
            inner.resource_order.retain(|u| u != uri);
        }
        self.hub.list_changed(ListChangedKind::Resources);
        Ok(())
    }

    /// Look up a resource by URI.
    #[must_use]
    pub fn lookup_resource(&self, uri: &str) -> Option<ResourceRegistration> {
        self.read().resources.get(uri).cloned()
    }

    /// Snapshot of all resources, in insertion order.
    #[must_use]
    pub fn list_resources(&self) -> Vec<ResourceRegistration> {
        let inner = self.read();
        inner
            .resource_order
            .iter()
            .filter_map(|uri| inner.resources.get(uri).cloned())
            .collect()
    }

    // -----------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------

    /// Register a prompt.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicatePrompt`] if the name is taken
    /// or [`RegistryError::ModuleState`] if the owning module is not
    /// accepting registrations.
    pub fn register_prompt(&self, prompt: PromptRegistration) -> RegistryResult<()> {
        {
            let mut inner = self.write();
            if inner.prompts.contains_key(&prompt.name) {
                return Err(RegistryError::DuplicatePrompt(prompt.name));
            }
            check_module_accepts(&inner, &prompt.module_origin, "register prompt")?;
            let name = prompt.name.clone();
            inner.prompts.insert(name.clone(), prompt);
            inner.prompt_order.push(name);
        }
        self.hub.list_changed(ListChangedKind::Prompts);
        Ok(())
    }

    /// Unregister a prompt by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownPrompt`] for unknown names.
    pub fn unregister_prompt(&self, name: &str) -> RegistryResult<()> {
        {
            let mut inner = self.write();
            if inner.prompts.remove(name).is_none() {
                return Err(RegistryError::UnknownPrompt(name.to_string()));
            }
            inner.prompt_order.retain(|n| n != name);
        }
        self.hub.list_changed(ListChangedKind::Prompts);
        Ok(())
    }

    /// Look up a prompt by name.
    #[must_use]
    pub fn lookup_prompt(&self, name: &str) -> Option<PromptRegistration> {
        self.read().prompts.get(name).cloned()
    }

    /// Snapshot of all prompts, in insertion order.
    #[must_use]
    pub fn list_prompts(&self) -> Vec<PromptRegistration> {
        let inner = self.read();
        inner
            .prompt_order
            .iter()
            .filter_map(|name| inner.prompts.get(name).cloned())
            .collect()
    }

    // -----------------------------------------------------------------
    // Bootstrap dedup guard
    // -----------------------------------------------------------------

    /// Run the bulk startup registration at most once.
    ///
    /// Concurrent callers wait for the in-flight bootstrap and return
    /// `Ok(false)` (the existing snapshot is already visible). A
    /// completed bootstrap is not re-run until [`cleanup`](Self::cleanup)
    /// resets the flags.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error; the in-progress flag is cleared
    /// so a corrected retry is possible.
    pub async fn bootstrap<F, Fut>(&self, f: F) -> RegistryResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RegistryResult<()>>,
    {
        let _guard = self.bootstrap_lock.lock().await;
        {
            let mut inner = self.write();
            if inner.registration_complete {
                debug!("Bootstrap already complete, returning existing snapshot");
                return Ok(false);
            }
            inner.registration_in_progress = true;
        }

        let result = f().await;

        let mut inner = self.write();
        inner.registration_in_progress = false;
        match result {
            Ok(()) => {
                inner.registration_complete = true;
                Ok(true)
            },
            Err(e) => Err(e),
        }
    }

    /// Whether the bulk startup registration has completed.
    #[must_use]
    pub fn registration_complete(&self) -> bool {
        self.read().registration_complete
    }

    /// Whether a bulk registration is currently running.
    #[must_use]
    pub fn registration_in_progress(&self) -> bool {
        self.read().registration_in_progress
    }

    /// Tear down all registrations and reset the bootstrap flags.
    pub fn cleanup(&self) {
        {
            let mut inner = self.write();
            *inner = Inner::default();
        }
        self.hub.list_changed(ListChangedKind::Tools);
        self.hub.list_changed(ListChangedKind::Resources);
        self.hub.list_changed(ListChangedKind::Prompts);
        info!("Registry cleaned up");
    }

    fn broadcast_removals(&self, tools: usize, resources: usize, prompts: usize) {
        if tools > 0 {
            self.hub.list_changed(ListChangedKind::Tools);
        }
        if resources > 0 {
            self.hub.list_changed(ListChangedKind::Resources);
        }
        if prompts > 0 {
            self.hub.list_changed(ListChangedKind::Prompts);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("Registry")
            .field("tools", &inner.tool_order.len())
            .field("resources", &inner.resource_order.len())
            .field("prompts", &inner.prompt_order.len())
            .field("modules", &inner.modules.len())
            .finish()
    }
}

/// Remove everything a module registered. Returns (tools, resources,
/// prompts) removal counts so the caller can broadcast once per kind.
fn remove_module_registrations(inner: &mut Inner, module: &str) -> (usize, usize, usize) {
    let tool_names: Vec<String> = inner
        .tools
        .values()
        .filter(|t| t.module_origin == module)
        .map(|t| t.name.clone())
        .collect();
    for name in &tool_names {
        inner.tools.remove(name);
    }
    inner.tool_order.retain(|n| !tool_names.contains(n));

    let resource_uris: Vec<String> = inner
        .resources
        .values()
        .filter(|r| r.module_origin == module)
        .map(|r| r.uri.clone())
        .collect();
    for uri in &resource_uris {
        inner.resources.remove(uri);
    }
    inner.resource_order.retain(|u| !resource_uris.contains(u));

    let prompt_names: Vec<String> = inner
        .prompts
        .values()
        .filter(|p| p.module_origin == module)
        .map(|p| p.name.clone())
        .collect();
    for name in &prompt_names {
        inner.prompts.remove(name);
    }
    inner.prompt_order.retain(|n| !prompt_names.contains(n));

    (tool_names.len(), resource_uris.len(), prompt_names.len())
}

fn check_module_accepts(inner: &Inner, module: &str, operation: &str) -> RegistryResult<()> {
    match inner.modules.get(module) {
        None => Err(RegistryError::UnknownModule(module.to_string())),
        Some(record) if matches!(record.state, ModuleState::Loading | ModuleState::Active) => {
            Ok(())
        },
        Some(record) => Err(RegistryError::ModuleState {
            module: module.to_string(),
            state: record.state.as_str().to_string(),
            operation: operation.to_string(),
        }),
    }
}
