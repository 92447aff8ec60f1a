//! Hot-reload watcher for tool modules.
//!
//! Watches the source files behind registered modules. On change the
//! module's registrations are removed, the module is reloaded through a
//! [`ModuleLoader`], re-registered, and `list_changed` goes out. If any
//! step fails the module is left unregistered and marked `Failed`; a
//! corrected file triggers another attempt.
//!
//! Rapid successive events are coalesced per module within a debounce
//! window. Deleting a watched file unwatches it and fails the module.
//! Symlinked event paths are ignored so the watcher never follows links
//! outside the configured roots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::ToolModule;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;

/// Default debounce window for coalescing change events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Events for the same module within this window are coalesced.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Produces a fresh module implementation from its source file.
///
/// The seam that keeps the watcher independent of how module
/// implementations come to be (built-in lookup table, plugin host, ...).
pub trait ModuleLoader: Send + Sync {
    /// Load the module from the current file contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or not a valid module.
    fn load(&self, module_name: &str, path: &Path) -> RegistryResult<Box<dyn ToolModule>>;
}

enum Command {
    Watch {
        module: String,
        path: PathBuf,
    },
    Unwatch {
        module: String,
    },
    Restart,
    Watched {
        reply: oneshot::Sender<Vec<(String, PathBuf)>>,
    },
    Shutdown,
}

/// Handle to the running watcher task.
#[derive(Clone)]
pub struct HotReloadWatcher {
    tx: mpsc::UnboundedSender<Command>,
}

impl HotReloadWatcher {
    /// Spawn the watcher task.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Watcher`] if the filesystem watcher
    /// cannot be initialized.
    pub fn spawn(
        registry: Arc<Registry>,
        loader: Arc<dyn ModuleLoader>,
        config: WatcherConfig,
    ) -> RegistryResult<(Self, JoinHandle<()>)> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| RegistryError::Watcher(e.to_string()))?;

        let task = WatcherTask {
            registry,
            loader,
            debounce: config.debounce,
            watcher,
            watched: HashMap::new(),
            watched_dirs: HashMap::new(),
            command_rx,
            raw_rx,
        };
        let handle = tokio::spawn(task.run());
        Ok((Self { tx: command_tx }, handle))
    }

    /// Watch a module's source file. Idempotent; a second call for the
    /// same module updates its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher task has stopped.
    pub fn watch(&self, module: impl Into<String>, path: impl Into<PathBuf>) -> RegistryResult<()> {
        self.send(Command::Watch {
            module: module.into(),
            path: path.into(),
        })
    }

    /// Stop watching a module. Future events are ignored; current
    /// registrations are untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher task has stopped.
    pub fn unwatch(&self, module: impl Into<String>) -> RegistryResult<()> {
        self.send(Command::Unwatch {
            module: module.into(),
        })
    }

    /// Disable and re-enable all watchers from the recorded path set.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher task has stopped.
    pub fn restart(&self) -> RegistryResult<()> {
        self.send(Command::Restart)
    }

    /// The currently watched (module, path) set, sorted by module.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher task has stopped.
    pub async fn watched(&self) -> RegistryResult<Vec<(String, PathBuf)>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Watched { reply })?;
        rx.await
            .map_err(|_| RegistryError::Watcher("watcher task stopped".into()))
    }

    /// Stop the watcher task.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> RegistryResult<()> {
        self.tx
            .send(command)
            .map_err(|_| RegistryError::Watcher("watcher task stopped".into()))
    }
}

impl std::fmt::Debug for HotReloadWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadWatcher").finish_non_exhaustive()
    }
}

struct WatcherTask {
    registry: Arc<Registry>,
    loader: Arc<dyn ModuleLoader>,
    debounce: Duration,
    watcher: RecommendedWatcher,
    /// module name → watched file path.
    watched: HashMap<String, PathBuf>,
    /// watched parent directory → reference count.
    watched_dirs: HashMap<PathBuf, usize>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl WatcherTask {
    async fn run(mut self) {
        let mut pending: HashMap<String, tokio::time::Instant> = HashMap::new();

        loop {
            let next_deadline = pending.values().copied().min();

            tokio::select! {
                biased;

                command = self.command_rx.recv() => {
                    match command {
                        Some(Command::Watch { module, path }) => self.handle_watch(module, path),
                        Some(Command::Unwatch { module }) => {
                            pending.remove(&module);
                            self.handle_unwatch(&module);
                        },
                        Some(Command::Restart) => self.handle_restart(),
                        Some(Command::Watched { reply }) => {
                            let mut entries: Vec<(String, PathBuf)> = self
                                .watched
                                .iter()
                                .map(|(m, p)| (m.clone(), p.clone()))
                                .collect();
                            entries.sort();
                            let _ = reply.send(entries);
                        },
                        Some(Command::Shutdown) | None => {
                            debug!("Hot-reload watcher stopping");
                            return;
                        },
                    }
                }

                event = self.raw_rx.recv() => {
                    match event {
                        Some(Ok(event)) => self.handle_raw_event(&event, &mut pending),
                        Some(Err(e)) => warn!(error = %e, "Filesystem watcher error"),
                        None => {
                            debug!("Watcher event channel closed");
                            return;
                        },
                    }
                }

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = tokio::time::Instant::now();
                    let ready: Vec<String> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(module, _)| module.clone())
                        .collect();
                    for module in ready {
                        pending.remove(&module);
                        self.process_change(&module);
                    }
                }
            }
        }
    }

    fn handle_watch(&mut self, module: String, path: PathBuf) {
        // Idempotent: re-watching updates the path.
        if let Some(previous) = self.watched.insert(module.clone(), path.clone()) {
            if previous == path {
                return;
            }
            self.release_dir(&previous);
        }
        self.acquire_dir(&path);
        debug!(module = %module, path = %path.display(), "Watching module file");
    }

    fn handle_unwatch(&mut self, module: &str) {
        if let Some(path) = self.watched.remove(module) {
            self.release_dir(&path);
            debug!(module, "Unwatched module");
        }
    }

    fn handle_restart(&mut self) {
        let dirs: Vec<PathBuf> = self.watched_dirs.keys().cloned().collect();
        for dir in &dirs {
            let _ = self.watcher.unwatch(dir);
        }
        for dir in &dirs {
            if let Err(e) = self.watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!(dir = %dir.display(), error = %e, "Failed to re-watch directory");
            }
        }
        info!(dirs = dirs.len(), "Watcher restarted");
    }

    fn handle_raw_event(
        &mut self,
        event: &Event,
        pending: &mut HashMap<String, tokio::time::Instant>,
    ) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {},
            _ => return,
        }

        for path in &event.paths {
            if std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink()) {
                continue;
            }

            let Some(module) = self.module_for_path(path) else {
                continue;
            };

            if matches!(event.kind, EventKind::Remove(_)) || !path.exists() {
                pending.remove(&module);
                self.handle_unwatch(&module);
                self.registry.fail_module(&module, "source file removed");
                continue;
            }

            let deadline = tokio::time::Instant::now() + self.debounce;
            pending.insert(module, deadline);
        }
    }

    fn process_change(&mut self, module: &str) {
        let Some(path) = self.watched.get(module).cloned() else {
            return;
        };
        info!(module, path = %path.display(), "Module changed, reloading");

        // Prior registrations go first so the rebuilt module starts clean.
        match self.registry.unload_module(module) {
            Ok(()) | Err(RegistryError::UnknownModule(_)) => {},
            Err(e) => {
                warn!(module, error = %e, "Unload before reload failed");
            },
        }

        let reloaded = self.loader.load(module, &path).and_then(|fresh| {
            self.registry
                .start_module(fresh.name(), fresh.category(), Some(path.clone()))?;
            fresh.register(&self.registry)?;
            self.registry.complete_module(fresh.name())
        });

        if let Err(e) = reloaded {
            self.registry.fail_module(module, e.to_string());
        }
    }

    fn module_for_path(&self, path: &Path) -> Option<String> {
        self.watched
            .iter()
            .find(|(_, watched)| watched.as_path() == path)
            .map(|(module, _)| module.clone())
    }

    fn acquire_dir(&mut self, file: &Path) {
        let dir = file.parent().unwrap_or(Path::new(".")).to_path_buf();
        let count = self.watched_dirs.entry(dir.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Err(e) = self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                warn!(dir = %dir.display(), error = %e, "Failed to watch directory");
            }
        }
    }

    fn release_dir(&mut self, file: &Path) {
        let dir = file.parent().unwrap_or(Path::new(".")).to_path_buf();
        if let Some(count) = self.watched_dirs.get_mut(&dir) {
            *count -= 1;
            if *count == 0 {
                self.watched_dirs.remove(&dir);
                let _ = self.watcher.unwatch(&dir);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationHub;
    use crate::types::{ToolContext, ToolHandler, ToolRegistration};
    use async_trait::async_trait;
    use serde_json::Value;
    use sonar_core::{ObjectShape, SchemaShape, ToolResult};

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn call(&self, _ctx: &ToolContext, _params: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::text("ok"))
        }
    }

    /// Loads a module whose single tool is named after the file's first
    /// line; a file starting with `fail` produces a load error.
    struct FileLoader;

    struct FileModule {
        name: String,
        tool: String,
    }

    impl ToolModule for FileModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn category(&self) -> &str {
            "test"
        }

        fn register(&self, registry: &Registry) -> RegistryResult<()> {
            registry.register_tool(ToolRegistration {
                name: self.tool.clone(),
                description: "reloadable".into(),
                schema: SchemaShape::of(ObjectShape::new()),
                category: "test".into(),
                module_origin: self.name.clone(),
                handler: Arc::new(NoopHandler),
            })
        }
    }

    impl ModuleLoader for FileLoader {
        fn load(&self, module_name: &str, path: &Path) -> RegistryResult<Box<dyn ToolModule>> {
            let content = std::fs::read_to_string(path).map_err(|e| {
                RegistryError::ModuleFailed {
                    module: module_name.to_string(),
                    message: e.to_string(),
                }
            })?;
            let first = content.lines().next().unwrap_or("").trim().to_string();
            if first.starts_with("fail") {
                return Err(RegistryError::ModuleFailed {
                    module: module_name.to_string(),
                    message: "module file says fail".into(),
                });
            }
            Ok(Box::new(FileModule {
                name: module_name.to_string(),
                tool: first,
            }))
        }
    }

    fn setup() -> (Arc<Registry>, HotReloadWatcher, JoinHandle<()>) {
        let registry = Arc::new(Registry::new(Arc::new(NotificationHub::new())));
        let (watcher, handle) = HotReloadWatcher::spawn(
            Arc::clone(&registry),
            Arc::new(FileLoader),
            WatcherConfig {
                debounce: Duration::from_millis(50),
            },
        )
        .unwrap();
        (registry, watcher, handle)
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) -> bool {
        for _ in 0..100 {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn watch_unwatch_watch_equals_single_watch() {
        let (_registry, watcher, handle) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.module");
        std::fs::write(&path, "ping\n").unwrap();

        watcher.watch("net", &path).unwrap();
        watcher.unwatch("net").unwrap();
        watcher.watch("net", &path).unwrap();

        let watched = watcher.watched().await.unwrap();
        assert_eq!(watched, vec![("net".to_string(), path)]);
        watcher.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn duplicate_watch_updates_path() {
        let (_registry, watcher, handle) = setup();
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.module");
        let b = dir.path().join("b.module");
        std::fs::write(&a, "ping\n").unwrap();
        std::fs::write(&b, "ping\n").unwrap();

        watcher.watch("net", &a).unwrap();
        watcher.watch("net", &b).unwrap();
        let watched = watcher.watched().await.unwrap();
        assert_eq!(watched, vec![("net".to_string(), b)]);
        watcher.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn change_reloads_module_and_replaces_tools() {
        let (registry, watcher, handle) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.module");
        std::fs::write(&path, "ping\n").unwrap();

        // Initial registration, as the discovery engine would do it.
        registry.start_module("net", "test", Some(path.clone())).unwrap();
        FileLoader
            .load("net", &path)
            .unwrap()
            .register(&registry)
            .unwrap();
        registry.complete_module("net").unwrap();
        watcher.watch("net", &path).unwrap();

        std::fs::write(&path, "ping_v2\n").unwrap();

        assert!(
            wait_for(|| registry.lookup_tool("ping_v2").is_some()).await,
            "reloaded tool never appeared"
        );
        assert!(registry.lookup_tool("ping").is_none());
        watcher.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn failed_reload_leaves_module_failed_and_unregistered() {
        let (registry, watcher, handle) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.module");
        std::fs::write(&path, "ping\n").unwrap();

        registry.start_module("net", "test", Some(path.clone())).unwrap();
        FileLoader
            .load("net", &path)
            .unwrap()
            .register(&registry)
            .unwrap();
        registry.complete_module("net").unwrap();
        watcher.watch("net", &path).unwrap();

        std::fs::write(&path, "fail\n").unwrap();

        assert!(
            wait_for(|| {
                registry
                    .module("net")
                    .is_some_and(|m| m.state == crate::types::ModuleState::Failed)
            })
            .await,
            "module never failed"
        );
        assert!(registry.lookup_tool("ping").is_none());
        watcher.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn delete_unwatches_and_fails_module() {
        let (registry, watcher, handle) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.module");
        std::fs::write(&path, "ping\n").unwrap();

        registry.start_module("net", "test", Some(path.clone())).unwrap();
        registry.complete_module("net").unwrap();
        watcher.watch("net", &path).unwrap();

        std::fs::remove_file(&path).unwrap();

        assert!(
            wait_for(|| {
                registry
                    .module("net")
                    .is_some_and(|m| m.state == crate::types::ModuleState::Failed)
            })
            .await,
            "module never failed after delete"
        );
        let watched = watcher.watched().await.unwrap();
        assert!(watched.is_empty());
        watcher.shutdown();
        let _ = handle.await;
    }
}
