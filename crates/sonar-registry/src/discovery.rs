//! Startup discovery: dependency-ordered module registration.
//!
//! Modules declare their name, category, and dependencies; the engine
//! topologically orders them (deterministic tie-break by name), then
//! walks the order registering each module as one batch. Failures are
//! isolated per module — one broken module never prevents the rest from
//! loading — but a dependency cycle is a hard error naming the cycle.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;

/// A registerable tool module.
///
/// The registration entry point pattern: modules expose `register`, the
/// engine (and the hot-reload watcher) call it inside a registry batch.
/// Re-registration after reload replaces the module's records atomically.
pub trait ToolModule: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Category its tools belong to.
    fn category(&self) -> &str;

    /// Names of modules that must be registered before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Register this module's tools, resources, and prompts.
    ///
    /// Called between `start_module` and `complete_module`; on error the
    /// whole batch is rolled back.
    ///
    /// # Errors
    ///
    /// Returns an error if any registration fails.
    fn register(&self, registry: &Registry) -> RegistryResult<()>;
}

/// Outcome of a discovery run.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Modules that loaded, in load order.
    pub loaded: Vec<String>,
    /// Modules that failed, with their errors.
    pub failed: Vec<(String, String)>,
    /// Modules skipped because an earlier scan root already provided a
    /// module with the same name.
    pub deduplicated: Vec<String>,
}

impl LoadReport {
    /// Whether every discovered module loaded.
    #[must_use]
    pub fn all_loaded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Discovers and loads tool modules in dependency order.
pub struct DiscoveryEngine {
    modules: Vec<Box<dyn ToolModule>>,
}

impl DiscoveryEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Add a module to the discovery set.
    ///
    /// A module whose name is already present is dropped (scan roots can
    /// overlap); the first sighting wins.
    pub fn add_module(&mut self, module: Box<dyn ToolModule>) -> bool {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return false;
        }
        self.modules.push(module);
        true
    }

    /// Module names currently in the discovery set.
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name().to_string()).collect()
    }

    /// Compute the dependency-ordered load sequence.
    ///
    /// Kahn's algorithm with a name-sorted ready set, so the order is
    /// deterministic run to run.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::MissingDependency`] when a declared dependency
    ///   is not in the discovery set
    /// - [`RegistryError::DependencyCycle`] naming the modules involved
    pub fn load_order(&self) -> RegistryResult<Vec<String>> {
        let names: BTreeSet<String> = self.modules.iter().map(|m| m.name().to_string()).collect();

        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();
        for module in &self.modules {
            in_degree.entry(module.name().to_string()).or_insert(0);
            for dependency in module.dependencies() {
                if !names.contains(&dependency) {
                    return Err(RegistryError::MissingDependency {
                        module: module.name().to_string(),
                        dependency,
                    });
                }
                dependents
                    .entry(dependency)
                    .or_default()
                    .push(module.name().to_string());
                *in_degree.entry(module.name().to_string()).or_insert(0) += 1;
            }
        }

        let mut ready: BTreeSet<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| name.clone())
            .collect();
        let mut order = Vec::with_capacity(self.modules.len());

        while let Some(name) = ready.iter().next().cloned() {
            ready.remove(&name);
            order.push(name.clone());
            for dependent in dependents.remove(&name).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < self.modules.len() {
            let mut cycle: Vec<String> = in_degree
                .into_iter()
                .filter(|(name, _)| !order.contains(name))
                .map(|(name, _)| name)
                .collect();
            cycle.sort();
            return Err(RegistryError::DependencyCycle(cycle));
        }
        Ok(order)
    }

    /// Re-register a single module by name (unloading it first if
    /// present), for `registry_reload_module`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownModule`] if the name is not in
    /// the discovery set, or the registration failure (in which case the
    /// module is left `Failed` with its partial registrations removed).
    pub fn load_one(&self, name: &str, registry: &Registry) -> RegistryResult<()> {
        let module = self
            .modules
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))?;

        match registry.unload_module(name) {
            Ok(()) | Err(RegistryError::UnknownModule(_)) => {},
            Err(e) => return Err(e),
        }

        registry.start_module(module.name(), module.category(), None)?;
        module
            .register(registry)
            .and_then(|()| registry.complete_module(module.name()))
            .inspect_err(|e| registry.fail_module(module.name(), e.to_string()))
    }

    /// Load every module into the registry, in dependency order.
    ///
    /// Per-module failures are recorded and the run continues; modules
    /// whose dependency failed are still attempted (their registrations
    /// do not require the dependency's tools to exist).
    ///
    /// # Errors
    ///
    /// Returns an error only for ordering problems (missing dependency,
    /// cycle) — never for individual module failures.
    pub fn run(&self, registry: &Registry) -> RegistryResult<LoadReport> {
        let order = self.load_order()?;
        let mut report = LoadReport::default();

        for name in order {
            let Some(module) = self.modules.iter().find(|m| m.name() == name) else {
                continue;
            };

            if let Err(e) = registry.start_module(module.name(), module.category(), None) {
                // Already loading/active from a previous run: dedup guard.
                warn!(module = %name, error = %e, "Skipping module");
                report.deduplicated.push(name);
                continue;
            }

            match module
                .register(registry)
                .and_then(|()| registry.complete_module(module.name()))
            {
                Ok(()) => report.loaded.push(name),
                Err(e) => {
                    registry.fail_module(module.name(), e.to_string());
                    report.failed.push((name, e.to_string()));
                },
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Discovery complete"
        );
        Ok(report)
    }
}

impl Default for DiscoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("modules", &self.module_names())
            .finish()
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
    use std::sync::Arc;

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn call(&self, _ctx: &ToolContext, _params: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::text("ok"))
        }
    }

    struct TestModule {
        name: String,
        deps: Vec<String>,
        tools: Vec<String>,
        fail: bool,
    }

    impl TestModule {
        fn new(name: &str, deps: &[&str], tools: &[&str]) -> Box<Self> {
            Box::new(Self {
                name: name.into(),
                deps: deps.iter().map(ToString::to_string).collect(),
                tools: tools.iter().map(ToString::to_string).collect(),
                fail: false,
            })
        }

        fn failing(name: &str) -> Box<Self> {
            Box::new(Self {
                name: name.into(),
                deps: vec![],
                tools: vec!["doomed".into()],
                fail: true,
            })
        }
    }

    impl ToolModule for TestModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn category(&self) -> &str {
            "test"
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn register(&self, registry: &Registry) -> RegistryResult<()> {
            for tool in &self.tools {
                registry.register_tool(ToolRegistration {
                    name: tool.clone(),
                    description: tool.clone(),
                    schema: SchemaShape::of(ObjectShape::new()),
                    category: "test".into(),
                    module_origin: self.name.clone(),
                    handler: Arc::new(NoopHandler),
                })?;
            }
            if self.fail {
                return Err(RegistryError::ModuleFailed {
                    module: self.name.clone(),
                    message: "synthetic failure".into(),
                });
            }
            Ok(())
        }
    }

    fn registry() -> Registry {
        Registry::new(Arc::new(NotificationHub::new()))
    }

    #[test]
    fn order_respects_dependencies_with_stable_ties() {
        let mut engine = DiscoveryEngine::new();
        engine.add_module(TestModule::new("zabbix", &["credentials"], &["zabbix_get"]));
        engine.add_module(TestModule::new("credentials", &[], &["creds_get"]));
        engine.add_module(TestModule::new("memory", &[], &["memory_get"]));
        engine.add_module(TestModule::new("nmap", &["memory"], &["nmap_scan"]));

        let order = engine.load_order().unwrap();
        assert_eq!(order, vec!["credentials", "memory", "nmap", "zabbix"]);
    }

    #[test]
    fn cycle_is_a_hard_error_naming_participants() {
        let mut engine = DiscoveryEngine::new();
        engine.add_module(TestModule::new("a", &["b"], &[]));
        engine.add_module(TestModule::new("b", &["a"], &[]));
        engine.add_module(TestModule::new("c", &[], &[]));

        let err = engine.load_order().unwrap_err();
        match err {
            RegistryError::DependencyCycle(names) => {
                assert_eq!(names, vec!["a", "b"]);
            },
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn missing_dependency_is_reported() {
        let mut engine = DiscoveryEngine::new();
        engine.add_module(TestModule::new("a", &["ghost"], &[]));
        assert!(matches!(
            engine.load_order(),
            Err(RegistryError::MissingDependency { .. })
        ));
    }

    #[test]
    fn duplicate_module_names_deduplicated_first_wins() {
        let mut engine = DiscoveryEngine::new();
        assert!(engine.add_module(TestModule::new("net", &[], &["ping"])));
        assert!(!engine.add_module(TestModule::new("net", &[], &["other"])));
        assert_eq!(engine.module_names(), vec!["net"]);
    }

    #[test]
    fn one_failing_module_does_not_stop_the_rest() {
        let registry = registry();
        let mut engine = DiscoveryEngine::new();
        engine.add_module(TestModule::failing("broken"));
        engine.add_module(TestModule::new("net", &[], &["ping"]));

        let report = engine.run(&registry).unwrap();
        assert_eq!(report.loaded, vec!["net"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");

        // The failed module's partial registrations were rolled back.
        assert!(registry.lookup_tool("doomed").is_none());
        assert!(registry.lookup_tool("ping").is_some());
    }

    #[test]
    fn second_run_skips_active_modules() {
        let registry = registry();
        let mut engine = DiscoveryEngine::new();
        engine.add_module(TestModule::new("net", &[], &["ping"]));

        let first = engine.run(&registry).unwrap();
        assert_eq!(first.loaded, vec!["net"]);
        let second = engine.run(&registry).unwrap();
        assert!(second.loaded.is_empty());
        assert_eq!(second.deduplicated, vec!["net"]);
        assert_eq!(registry.list_tools().len(), 1);
    }
}
