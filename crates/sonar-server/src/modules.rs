//! Built-in tool modules: the CMDB and the credential vault.
//!
//! These are the in-process modules the discovery engine registers at
//! startup. The external discovery tools (Nmap, SNMP, Proxmox, Zabbix
//! wrappers) are separate collaborators and register through the same
//! [`ToolModule`] entry point.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use sonar_cmdb::Cmdb;
use sonar_core::{FieldSpec, ObjectShape, SchemaShape, ToolResult};
use sonar_registry::{
    Registry, RegistryResult, ToolContext, ToolHandler, ToolModule, ToolRegistration,
};
use sonar_vault::{CredentialType, CredentialVault};

fn tool(
    name: &str,
    description: &str,
    shape: ObjectShape,
    category: &str,
    module: &str,
    handler: Arc<dyn ToolHandler>,
) -> ToolRegistration {
    ToolRegistration {
        name: name.to_string(),
        description: description.to_string(),
        schema: SchemaShape::of(shape),
        category: category.to_string(),
        module_origin: module.to_string(),
        handler,
    }
}

fn actor(ctx: &ToolContext) -> &str {
    ctx.session.as_deref().unwrap_or("system")
}

// ---------------------------------------------------------------------
// Memory (CMDB) module
// ---------------------------------------------------------------------

/// Exposes the CMDB as `memory_*` tools.
pub struct MemoryModule {
    cmdb: Arc<Cmdb>,
}

impl MemoryModule {
    /// Wrap a CMDB.
    #[must_use]
    pub fn new(cmdb: Arc<Cmdb>) -> Self {
        Self { cmdb }
    }
}

impl ToolModule for MemoryModule {
    fn name(&self) -> &str {
        "memory"
    }

    fn category(&self) -> &str {
        "memory"
    }

    fn register(&self, registry: &Registry) -> RegistryResult<()> {
        let cmdb = &self.cmdb;
        let entries: [(&str, &str, ObjectShape, Arc<dyn ToolHandler>); 8] = [
            (
                "memory_get",
                "Get a configuration item by key",
                ObjectShape::new().field("key", FieldSpec::string()),
                Arc::new(MemoryGet(Arc::clone(cmdb))),
            ),
            (
                "memory_set",
                "Store a configuration item (last write wins)",
                ObjectShape::new()
                    .field("key", FieldSpec::string())
                    .field("value", FieldSpec::Any),
                Arc::new(MemorySet(Arc::clone(cmdb))),
            ),
            (
                "memory_merge",
                "Shallow-merge fields into a configuration item",
                ObjectShape::new()
                    .field("key", FieldSpec::string())
                    .field("value", FieldSpec::Any),
                Arc::new(MemoryMerge(Arc::clone(cmdb))),
            ),
            (
                "memory_query",
                "Query configuration items by key glob (* wildcard)",
                ObjectShape::new().field("pattern", FieldSpec::optional(FieldSpec::string())),
                Arc::new(MemoryQuery(Arc::clone(cmdb))),
            ),
            (
                "memory_clear",
                "Remove every configuration item",
                ObjectShape::new(),
                Arc::new(MemoryClear(Arc::clone(cmdb))),
            ),
            (
                "memory_stats",
                "Store statistics: item counts per type, dirty keys",
                ObjectShape::new(),
                Arc::new(MemoryStats(Arc::clone(cmdb))),
            ),
            (
                "memory_save",
                "Flush pending changes to the durable store",
                ObjectShape::new(),
                Arc::new(MemorySave(Arc::clone(cmdb))),
            ),
            (
                "memory_migrate",
                "Import a legacy JSON memory store",
                ObjectShape::new().field("path", FieldSpec::string()),
                Arc::new(MemoryMigrate(Arc::clone(cmdb))),
            ),
        ];

        for (name, description, shape, handler) in entries {
            registry.register_tool(tool(
                name,
                description,
                shape,
                "memory",
                self.name(),
                handler,
            ))?;
        }
        Ok(())
    }
}

struct MemoryGet(Arc<Cmdb>);

#[async_trait]
impl ToolHandler for MemoryGet {
    async fn call(&self, _ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let key = required_str(&params, "key")?;
        Ok(match self.0.get(key) {
            Some(value) => ToolResult::json(&value),
            None => ToolResult::error(format!("no configuration item: {key}")),
        })
    }
}

struct MemorySet(Arc<Cmdb>);

#[async_trait]
impl ToolHandler for MemorySet {
    async fn call(&self, _ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let key = required_str(&params, "key")?.to_string();
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        self.0.set(&key, value);
        Ok(ToolResult::text(format!("stored {key}")))
    }
}

struct MemoryMerge(Arc<Cmdb>);

#[async_trait]
impl ToolHandler for MemoryMerge {
    async fn call(&self, _ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let key = required_str(&params, "key")?.to_string();
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        let merged = self.0.merge(&key, value);
        Ok(ToolResult::json(&merged))
    }
}

struct MemoryQuery(Arc<Cmdb>);

#[async_trait]
impl ToolHandler for MemoryQuery {
    async fn call(&self, _ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let pattern = params.get("pattern").and_then(Value::as_str);
        match self.0.query(pattern) {
            Ok(items) => {
                let rows: Vec<Value> = items
                    .into_iter()
                    .map(|(key, value)| json!({"key": key, "value": value}))
                    .collect();
                Ok(ToolResult::json(&Value::Array(rows)))
            },
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

struct MemoryClear(Arc<Cmdb>);

#[async_trait]
impl ToolHandler for MemoryClear {
    async fn call(&self, _ctx: &ToolContext, _params: Value) -> Result<ToolResult, String> {
        self.0.clear();
        Ok(ToolResult::text("memory cleared"))
    }
}

struct MemoryStats(Arc<Cmdb>);

#[async_trait]
impl ToolHandler for MemoryStats {
    async fn call(&self, _ctx: &ToolContext, _params: Value) -> Result<ToolResult, String> {
        let stats = self.0.stats();
        let value = serde_json::to_value(&stats).map_err(|e| e.to_string())?;
        Ok(ToolResult::json(&value))
    }
}

struct MemorySave(Arc<Cmdb>);

#[async_trait]
impl ToolHandler for MemorySave {
    async fn call(&self, _ctx: &ToolContext, _params: Value) -> Result<ToolResult, String> {
        match self.0.save().await {
            Ok(flushed) => Ok(ToolResult::text(format!("flushed {flushed} items"))),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

struct MemoryMigrate(Arc<Cmdb>);

#[async_trait]
impl ToolHandler for MemoryMigrate {
    async fn call(&self, _ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let path = required_str(&params, "path")?;
        match self.0.migrate_from(std::path::Path::new(path)) {
            Ok(report) => Ok(ToolResult::text(format!(
                "imported {} items, skipped {}",
                report.imported, report.skipped
            ))),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------
// Credentials module
// ---------------------------------------------------------------------

/// Exposes the credential vault as `credentials_*` tools.
pub struct CredentialsModule {
    vault: Arc<CredentialVault>,
}

impl CredentialsModule {
    /// Wrap a vault.
    #[must_use]
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        Self { vault }
    }
}

const CREDENTIAL_TYPES: &[&str] = &[
    "password",
    "apiKey",
    "sshKey",
    "oauthToken",
    "certificate",
    "custom",
];

impl ToolModule for CredentialsModule {
    fn name(&self) -> &str {
        "credentials"
    }

    fn category(&self) -> &str {
        "credentials"
    }

    fn register(&self, registry: &Registry) -> RegistryResult<()> {
        let vault = &self.vault;
        let entries: [(&str, &str, ObjectShape, Arc<dyn ToolHandler>); 5] = [
            (
                "credentials_add",
                "Store a credential; secret fields are encrypted at rest",
                ObjectShape::new()
                    .field("id", FieldSpec::string())
                    .field("type", FieldSpec::string_enum(CREDENTIAL_TYPES))
                    .field("secrets", FieldSpec::Any)
                    .field("username", FieldSpec::optional(FieldSpec::string()))
                    .field("url", FieldSpec::optional(FieldSpec::string()))
                    .field("notes", FieldSpec::optional(FieldSpec::string())),
                Arc::new(CredentialsAdd(Arc::clone(vault))),
            ),
            (
                "credentials_get",
                "Get a credential with decrypted secret fields",
                ObjectShape::new().field("id", FieldSpec::string()),
                Arc::new(CredentialsGet(Arc::clone(vault))),
            ),
            (
                "credentials_list",
                "List credential metadata (never secrets)",
                ObjectShape::new()
                    .field("type", FieldSpec::optional(FieldSpec::string_enum(CREDENTIAL_TYPES))),
                Arc::new(CredentialsList(Arc::clone(vault))),
            ),
            (
                "credentials_remove",
                "Remove a credential",
                ObjectShape::new().field("id", FieldSpec::string()),
                Arc::new(CredentialsRemove(Arc::clone(vault))),
            ),
            (
                "credentials_rotate_key",
                "Rotate the vault master key, re-encrypting every record",
                ObjectShape::new()
                    .field("newKey", FieldSpec::optional(FieldSpec::string())),
                Arc::new(CredentialsRotate(Arc::clone(vault))),
            ),
        ];

        for (name, description, shape, handler) in entries {
            registry.register_tool(tool(
                name,
                description,
                shape,
                "credentials",
                self.name(),
                handler,
            ))?;
        }
        Ok(())
    }
}

fn parse_credential_type(raw: &str) -> Result<CredentialType, String> {
    match raw {
        "password" => Ok(CredentialType::Password),
        "apiKey" => Ok(CredentialType::ApiKey),
        "sshKey" => Ok(CredentialType::SshKey),
        "oauthToken" => Ok(CredentialType::OauthToken),
        "certificate" => Ok(CredentialType::Certificate),
        "custom" => Ok(CredentialType::Custom),
        other => Err(format!("unknown credential type: {other}")),
    }
}

struct CredentialsAdd(Arc<CredentialVault>);

#[async_trait]
impl ToolHandler for CredentialsAdd {
    async fn call(&self, ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let id = required_str(&params, "id")?.to_string();
        let credential_type = parse_credential_type(required_str(&params, "type")?)?;

        let secrets: BTreeMap<String, String> = params
            .get("secrets")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(field, value)| {
                        let value = value
                            .as_str()
                            .map_or_else(|| value.to_string(), ToString::to_string);
                        (field.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        if secrets.is_empty() {
            return Ok(ToolResult::error("secrets must be a non-empty object"));
        }

        let get_opt = |field: &str| {
            params
                .get(field)
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };
        match self
            .0
            .add(
                actor(ctx),
                &id,
                credential_type,
                secrets,
                get_opt("username"),
                get_opt("url"),
                get_opt("notes"),
            )
            .await
        {
            Ok(metadata) => {
                let value = serde_json::to_value(&metadata).map_err(|e| e.to_string())?;
                Ok(ToolResult::json(&value))
            },
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

struct CredentialsGet(Arc<CredentialVault>);

#[async_trait]
impl ToolHandler for CredentialsGet {
    async fn call(&self, ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let id = required_str(&params, "id")?;
        match self.0.get(actor(ctx), id).await {
            Ok(credential) => {
                let value = json!({
                    "id": credential.metadata.id,
                    "type": credential.metadata.credential_type.as_str(),
                    "username": credential.metadata.username,
                    "url": credential.metadata.url,
                    "secrets": credential.secret_fields,
                    "notes": credential.notes,
                });
                Ok(ToolResult::json(&value))
            },
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

struct CredentialsList(Arc<CredentialVault>);

#[async_trait]
impl ToolHandler for CredentialsList {
    async fn call(&self, ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let filter = match params.get("type").and_then(Value::as_str) {
            Some(raw) => Some(parse_credential_type(raw)?),
            None => None,
        };
        match self.0.list(actor(ctx), filter).await {
            Ok(listed) => {
                let value = serde_json::to_value(&listed).map_err(|e| e.to_string())?;
                Ok(ToolResult::json(&value))
            },
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

struct CredentialsRemove(Arc<CredentialVault>);

#[async_trait]
impl ToolHandler for CredentialsRemove {
    async fn call(&self, ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let id = required_str(&params, "id")?;
        match self.0.remove(actor(ctx), id).await {
            Ok(()) => Ok(ToolResult::text(format!("removed {id}"))),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

struct CredentialsRotate(Arc<CredentialVault>);

#[async_trait]
impl ToolHandler for CredentialsRotate {
    async fn call(&self, ctx: &ToolContext, params: Value) -> Result<ToolResult, String> {
        let new_key = match params.get("newKey").and_then(Value::as_str) {
            Some(encoded) => match sonar_crypto::MasterKey::from_base64(encoded) {
                Ok(key) => Some(key),
                Err(e) => return Ok(ToolResult::error(e.to_string())),
            },
            None => None,
        };
        match self.0.rotate_key(actor(ctx), new_key).await {
            Ok(()) => Ok(ToolResult::text("master key rotated")),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required parameter: {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_audit::MemorySink;
    use sonar_config::MemoryConfig;
    use sonar_registry::NotificationHub;
    use sonar_storage::MemoryKvStore;

    async fn cmdb() -> Arc<Cmdb> {
        Arc::new(
            Cmdb::open(Arc::new(MemoryKvStore::new()), MemoryConfig::default())
                .await
                .unwrap(),
        )
    }

    fn vault() -> Arc<CredentialVault> {
        let dir = tempfile::tempdir().unwrap().keep();
        Arc::new(CredentialVault::open(&dir, None, Box::new(MemorySink::new())).unwrap())
    }

    #[tokio::test]
    async fn memory_module_registers_all_eight_tools() {
        let registry = Registry::new(Arc::new(NotificationHub::new()));
        let module = MemoryModule::new(cmdb().await);
        registry.start_module("memory", "memory", None).unwrap();
        module.register(&registry).unwrap();
        assert_eq!(registry.list_tools().len(), 8);
    }

    #[tokio::test]
    async fn credentials_module_registers_all_five_tools() {
        let registry = Registry::new(Arc::new(NotificationHub::new()));
        let module = CredentialsModule::new(vault());
        registry.start_module("credentials", "credentials", None).unwrap();
        module.register(&registry).unwrap();
        assert_eq!(registry.list_tools().len(), 5);
    }

    #[tokio::test]
    async fn credentials_add_and_get_round_trip() {
        let vault = vault();
        let add = CredentialsAdd(Arc::clone(&vault));
        let ctx = ToolContext::background();

        let result = add
            .call(
                &ctx,
                json!({
                    "id": "zbx-1",
                    "type": "apiKey",
                    "secrets": {"token": "super-secret"},
                    "url": "https://zabbix.example",
                }),
            )
            .await
            .unwrap();
        assert!(!result.is_error(), "{result:?}");

        let get = CredentialsGet(vault);
        let result = get.call(&ctx, json!({"id": "zbx-1"})).await.unwrap();
        assert!(result.text_content().contains("super-secret"));
    }

    #[tokio::test]
    async fn credentials_list_never_leaks_secrets() {
        let vault = vault();
        let ctx = ToolContext::background();
        CredentialsAdd(Arc::clone(&vault))
            .call(
                &ctx,
                json!({"id": "c", "type": "password", "secrets": {"password": "pw-x"}}),
            )
            .await
            .unwrap();

        let result = CredentialsList(vault)
            .call(&ctx, json!({}))
            .await
            .unwrap();
        assert!(!result.text_content().contains("pw-x"));
        assert!(result.text_content().contains("\"c\""));
    }

    #[tokio::test]
    async fn add_with_empty_secrets_is_a_handler_error() {
        let result = CredentialsAdd(vault())
            .call(
                &ToolContext::background(),
                json!({"id": "x", "type": "custom", "secrets": {}}),
            )
            .await
            .unwrap();
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn rotate_with_bad_key_reports_error_result() {
        let result = CredentialsRotate(vault())
            .call(&ToolContext::background(), json!({"newKey": "!!!"}))
            .await
            .unwrap();
        assert!(result.is_error());
    }
}
