//! Plugin lifecycle end to end: discovery, integrity, signature policy,
//! and the dispatcher's `plugin_*` methods.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use sonar_audit::{AuditLog, MemorySink};
use sonar_cmdb::Cmdb;
use sonar_config::MemoryConfig;
use sonar_core::{ObjectShape, RpcMessage, RpcResponse, SchemaShape, SessionId, ToolResult};
use sonar_crypto::hash_dist_tree;
use sonar_plugins::{PluginHost, PluginManager, PluginManifest, PluginPolicy, PluginResult};
use sonar_registry::{
    DiscoveryEngine, NotificationHub, Registry, RegistryResult, ToolContext, ToolHandler,
    ToolModule, ToolRegistration,
};
use sonar_server::Server;
use sonar_storage::MemoryKvStore;
use sonar_transport::MessageSink;
use sonar_vault::CredentialVault;

struct ProbeHandler;

#[async_trait]
impl ToolHandler for ProbeHandler {
    async fn call(&self, _ctx: &ToolContext, _params: Value) -> Result<ToolResult, String> {
        Ok(ToolResult::text("probe complete"))
    }
}

struct ProbeModule {
    module: String,
    tool: String,
}

impl ToolModule for ProbeModule {
    fn name(&self) -> &str {
        &self.module
    }

    fn category(&self) -> &str {
        "discovery"
    }

    fn register(&self, registry: &Registry) -> RegistryResult<()> {
        registry.register_tool(ToolRegistration {
            name: self.tool.clone(),
            description: "plugin-provided probe".into(),
            schema: SchemaShape::of(ObjectShape::new()),
            category: "discovery".into(),
            module_origin: self.module.clone(),
            handler: Arc::new(ProbeHandler),
        })
    }
}

struct ProbeHost;

impl PluginHost for ProbeHost {
    fn instantiate(
        &self,
        manifest: &PluginManifest,
        _plugin_dir: &Path,
    ) -> PluginResult<Box<dyn ToolModule>> {
        Ok(Box::new(ProbeModule {
            module: format!("plugin:{}", manifest.id()),
            tool: format!("{}_probe", manifest.name.replace('-', "_")),
        }))
    }
}

fn write_plugin(root: &Path, name: &str) -> String {
    let dir = root.join("network").join(name);
    std::fs::create_dir_all(dir.join("dist/sub")).unwrap();
    std::fs::write(dir.join("dist/a.txt"), b"hello").unwrap();
    std::fs::write(dir.join("dist/sub/b.bin"), [1u8, 2, 3, 4, 5]).unwrap();
    let dist = hash_dist_tree(&dir.join("dist")).unwrap();
    std::fs::write(
        dir.join("mcp-plugin.json"),
        serde_json::to_string_pretty(&json!({
            "manifestVersion": "2",
            "name": name,
            "version": "1.0.0",
            "entry": "dist/a.txt",
            "dependenciesPolicy": "bundled-only",
            "dist": {
                "hash": dist.hash,
                "fileCount": dist.file_count,
                "totalBytes": dist.total_bytes,
            },
        }))
        .unwrap(),
    )
    .unwrap();
    format!("{name}@1.0.0")
}

async fn server_with_plugins(root: &Path) -> (Arc<Server>, Arc<Registry>) {
    let hub = Arc::new(NotificationHub::new());
    let registry = Arc::new(Registry::new(hub));
    let cmdb = Arc::new(
        Cmdb::open(Arc::new(MemoryKvStore::new()), MemoryConfig::default())
            .await
            .unwrap(),
    );
    let data_dir = tempfile::tempdir().unwrap().keep();
    let vault = Arc::new(
        CredentialVault::open(&data_dir, None, Box::new(MemorySink::new())).unwrap(),
    );
    let audit = Arc::new(AuditLog::new(Box::new(MemorySink::new())).unwrap());

    let manager = Arc::new(PluginManager::new(
        root,
        PluginPolicy::default(),
        Arc::clone(&registry),
        Arc::new(ProbeHost),
        audit,
    ));
    manager.discover().unwrap();

    let server = Arc::new(Server::new(
        Arc::clone(&registry),
        Arc::new(DiscoveryEngine::new()),
        cmdb,
        vault,
        Some(manager),
    ));
    (server, registry)
}

async fn call(server: &Server, method: &str, params: Value) -> RpcResponse {
    let message = RpcMessage::from_value(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    }));
    server
        .dispatch(
            &SessionId::from_string("plugin-e2e"),
            message,
            CancellationToken::new(),
        )
        .await
        .expect("request produces a response")
}

#[tokio::test]
async fn full_lifecycle_through_dispatcher_methods() {
    let root = tempfile::tempdir().unwrap();
    let id = write_plugin(root.path(), "port-sweep");
    let (server, registry) = server_with_plugins(root.path()).await;

    let response = call(&server, "plugin_list", json!({})).await;
    let plugins = response.result.unwrap()["plugins"].clone();
    assert_eq!(plugins[0]["id"], json!(id));
    assert_eq!(plugins[0]["state"], json!("validated"));

    let response = call(&server, "plugin_load", json!({"id": id})).await;
    assert_eq!(response.result.unwrap()["state"], json!("loaded"));

    let response = call(&server, "plugin_activate", json!({"id": id})).await;
    assert_eq!(response.result.unwrap()["state"], json!("active"));
    assert!(registry.lookup_tool("port_sweep_probe").is_some());

    let response = call(&server, "plugin_deactivate", json!({"id": id})).await;
    assert_eq!(response.result.unwrap()["state"], json!("inactive"));
    assert!(registry.lookup_tool("port_sweep_probe").is_none());

    let response = call(&server, "plugin_unload", json!({"id": id})).await;
    assert_eq!(response.result.unwrap()["state"], json!("unloaded"));
}

#[tokio::test]
async fn drifted_dist_surfaces_as_integrity_error() {
    let root = tempfile::tempdir().unwrap();
    let id = write_plugin(root.path(), "drifty");
    let (server, _registry) = server_with_plugins(root.path()).await;

    // Corrupt a dist file after validation.
    let file = root.path().join("network/drifty/dist/a.txt");
    let mut contents = std::fs::read(&file).unwrap();
    contents.push(b'!');
    std::fs::write(&file, contents).unwrap();

    let response = call(&server, "plugin_load", json!({"id": id})).await;
    let error = response.error.unwrap();
    assert_eq!(error.code, -32013);

    let response = call(&server, "plugin_list", json!({})).await;
    let plugins = response.result.unwrap()["plugins"].clone();
    assert_eq!(plugins[0]["state"], json!("failed"));
    assert_eq!(plugins[0]["last_error"], json!("integrity mismatch"));
}

#[tokio::test]
async fn illegal_transition_maps_to_illegal_state_code() {
    let root = tempfile::tempdir().unwrap();
    let id = write_plugin(root.path(), "eager");
    let (server, _registry) = server_with_plugins(root.path()).await;

    // Activate without loading first.
    let response = call(&server, "plugin_activate", json!({"id": id})).await;
    assert_eq!(response.error.unwrap().code, -32012);
}
