//! The daemon's plugin host.
//!
//! This deployment carries no embedded script runtime; a verified plugin
//! is exposed as a content-addressed artifact: its entry file becomes a
//! readable resource under `plugin://<id>/<entry>`, served from the
//! integrity-checked dist tree. Runtime-backed hosts implement the same
//! [`PluginHost`] seam.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use sonar_plugins::{PluginError, PluginHost, PluginManifest, PluginResult};
use sonar_registry::{
    Registry, RegistryResult, ResourceProvider, ResourceRegistration, ToolModule,
};

pub struct ArtifactHost;

impl PluginHost for ArtifactHost {
    fn instantiate(
        &self,
        manifest: &PluginManifest,
        plugin_dir: &Path,
    ) -> PluginResult<Box<dyn ToolModule>> {
        let entry = plugin_dir.join(&manifest.entry);
        if !entry.is_file() {
            return Err(PluginError::LoadFailed {
                id: manifest.id(),
                message: format!("entry {} does not exist", manifest.entry),
            });
        }
        Ok(Box::new(ArtifactModule {
            module: format!("plugin:{}", manifest.id()),
            uri: format!("plugin://{}/{}", manifest.id(), manifest.entry),
            entry,
        }))
    }
}

struct ArtifactModule {
    module: String,
    uri: String,
    entry: PathBuf,
}

impl ToolModule for ArtifactModule {
    fn name(&self) -> &str {
        &self.module
    }

    fn category(&self) -> &str {
        "plugin"
    }

    fn register(&self, registry: &Registry) -> RegistryResult<()> {
        registry.register_resource(ResourceRegistration {
            uri: self.uri.clone(),
            name: self.module.clone(),
            mime_type: "application/octet-stream".to_string(),
            module_origin: self.module.clone(),
            provider: Arc::new(FileProvider {
                path: self.entry.clone(),
            }),
        })
    }
}

struct FileProvider {
    path: PathBuf,
}

#[async_trait]
impl ResourceProvider for FileProvider {
    async fn read(&self, _uri: &str, _params: Option<&Value>) -> Result<Vec<u8>, String> {
        tokio::fs::read(&self.path).await.map_err(|e| e.to_string())
    }
}
