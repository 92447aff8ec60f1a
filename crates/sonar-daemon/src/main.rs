//! sonard — the sonar discovery server daemon.
//!
//! Wires the stores, registries, plugin manager, and transports together
//! and runs until interrupted. Configuration comes from the environment
//! (`TRANSPORT_MODE`, `MCP_*`, `OAUTH_*`, `MEMORY_*`) with CLI flags as
//! overrides.

mod host;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sonar_audit::{AuditLog, JsonlSink};
use sonar_cmdb::Cmdb;
use sonar_config::{ServerConfig, TransportMode};
use sonar_plugins::{PluginManager, PluginPolicy};
use sonar_registry::{DiscoveryEngine, NotificationHub, Registry};
use sonar_server::{CredentialsModule, MemoryModule, Server};
use sonar_storage::SledKvStore;
use sonar_transport::http::HttpState;
use sonar_transport::oauth::OAuthValidator;
use sonar_transport::stdio::StdioTransport;
use sonar_transport::{MessageSink, amqp::AmqpTransport};
use sonar_vault::CredentialVault;

#[derive(Debug, Parser)]
#[command(name = "sonard", version, about = "Network discovery MCP server")]
struct Cli {
    /// Transport mode (overrides TRANSPORT_MODE).
    #[arg(long)]
    transport: Option<TransportModeArg>,

    /// Data directory for the master key, credential store, audit log,
    /// and CMDB.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Plugins root directory.
    #[arg(long, default_value = "plugins")]
    plugins_root: PathBuf,

    /// HTTP bind address.
    #[arg(long)]
    http_addr: Option<String>,

    /// AMQP broker URL.
    #[arg(long)]
    amqp_url: Option<String>,

    /// Require plugin signatures.
    #[arg(long)]
    require_signatures: bool,

    /// Production mode: disables development escape hatches.
    #[arg(long)]
    production: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum TransportModeArg {
    Stdio,
    Http,
    Both,
    Amqp,
}

impl From<TransportModeArg> for TransportMode {
    fn from(arg: TransportModeArg) -> Self {
        match arg {
            TransportModeArg::Stdio => Self::Stdio,
            TransportModeArg::Http => Self::Http,
            TransportModeArg::Both => Self::Both,
            TransportModeArg::Amqp => Self::Amqp,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::from_env().context("configuration")?;
    if let Some(mode) = cli.transport {
        config.transport_mode = mode.into();
    }
    config.data_dir = cli.data_dir.clone();
    if let Some(addr) = cli.http_addr {
        config.http_addr = addr;
    }
    if let Some(url) = cli.amqp_url {
        config.amqp.url = url;
    }
    config.production = config.production || cli.production;

    info!(mode = ?config.transport_mode, data_dir = %config.data_dir.display(), "Starting sonard");

    // Stores.
    let store = Arc::new(
        SledKvStore::open(config.data_dir.join("cmdb")).context("open CMDB store")?,
    );
    let cmdb = Arc::new(
        Cmdb::open(store, config.memory.clone())
            .await
            .context("rehydrate CMDB")?,
    );
    let vault = Arc::new(
        CredentialVault::open(
            &config.data_dir,
            config.creds_key.as_deref(),
            Box::new(JsonlSink::open(config.data_dir.join("vault-audit.jsonl"))?),
        )
        .context("open credential vault")?,
    );

    // Registry + built-in modules, registered once through the bootstrap
    // guard.
    let hub = Arc::new(NotificationHub::new());
    let registry = Arc::new(Registry::new(Arc::clone(&hub)));
    let mut engine = DiscoveryEngine::new();
    engine.add_module(Box::new(MemoryModule::new(Arc::clone(&cmdb))));
    engine.add_module(Box::new(CredentialsModule::new(Arc::clone(&vault))));
    let engine = Arc::new(engine);
    {
        let engine = Arc::clone(&engine);
        let registry_for_bootstrap = Arc::clone(&registry);
        registry
            .bootstrap(move || async move {
                let report = engine.run(&registry_for_bootstrap)?;
                for (module, error) in &report.failed {
                    warn!(module, error, "Module failed during startup registration");
                }
                Ok(())
            })
            .await
            .context("startup registration")?;
    }

    // Plugins.
    let plugin_audit = Arc::new(AuditLog::new(Box::new(JsonlSink::open(
        config.data_dir.join("plugin-audit.jsonl"),
    )?))?);
    let plugins = Arc::new(PluginManager::new(
        cli.plugins_root,
        PluginPolicy {
            require_signature: cli.require_signatures,
            trusted_keys: sonar_crypto::TrustedKeys::new(),
        },
        Arc::clone(&registry),
        Arc::new(host::ArtifactHost),
        plugin_audit,
    ));
    match plugins.discover() {
        Ok(found) => info!(plugins = found.len(), "Plugin discovery finished"),
        Err(e) => warn!(error = %e, "Plugin discovery failed"),
    }

    let auto_save = cmdb.spawn_auto_save();

    let server: Arc<Server> = Arc::new(Server::new(
        Arc::clone(&registry),
        engine,
        Arc::clone(&cmdb),
        vault,
        Some(plugins),
    ));
    let sink: Arc<dyn MessageSink> = Arc::clone(&server);

    // Transports.
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    let stdio = Arc::new(StdioTransport::new(Arc::clone(&sink), Arc::clone(&hub)));
    let http_state = HttpState::new(
        Arc::clone(&sink),
        Arc::clone(&hub),
        config
            .oauth
            .enabled
            .then(|| Arc::new(OAuthValidator::new(config.oauth.clone(), config.production))),
        config.server_url.clone(),
    );
    let amqp = Arc::new(AmqpTransport::new(
        config.amqp.clone(),
        Arc::clone(&sink),
        Arc::clone(&hub),
    ));

    if matches!(config.transport_mode, TransportMode::Stdio | TransportMode::Both) {
        let stdio = Arc::clone(&stdio);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = stdio.run().await {
                warn!(error = %e, "stdio transport stopped");
            }
        }));
    }
    if matches!(config.transport_mode, TransportMode::Http | TransportMode::Both) {
        http_state.spawn_session_sweeper(sonar_transport::http::DEFAULT_IDLE_WINDOW);
        let state = Arc::clone(&http_state);
        let addr = config.http_addr.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = sonar_transport::http::serve(state, &addr).await {
                warn!(error = %e, "HTTP transport stopped");
            }
        }));
    }
    if matches!(config.transport_mode, TransportMode::Amqp) {
        let amqp = Arc::clone(&amqp);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = amqp.run().await {
                warn!(error = %e, "AMQP transport stopped");
            }
        }));
    }

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("Shutting down");

    stdio.close();
    http_state.close();
    amqp.close();
    if let Some(auto_save) = auto_save {
        auto_save.abort();
    }
    if let Err(e) = cmdb.save().await {
        warn!(error = %e, "Final CMDB flush failed");
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
