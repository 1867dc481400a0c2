//! opensandboxd - runtime-neutral sandbox lifecycle engine.
//!
//! This binary loads configuration, selects and constructs the one live [`RuntimeProvider`]
//! named by it, and wires it into a [`SandboxService`]. It does not serve HTTP itself: the
//! web framework, auth middleware, and routing that would call into the service are an
//! external collaborator's responsibility (see the top-level scope statement in the crate
//! docs). `serve` exists to prove the wiring and keep the process alive under a supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use opensandbox_core::config::{self, AppConfig, RuntimeConfig};
use opensandbox_core::provider::RuntimeProvider;
use opensandbox_core::provider::cluster_cr::ClusterCrProvider;
use opensandbox_core::provider::cluster_pod::ClusterPodProvider;
use opensandbox_core::provider::local_daemon::LocalDaemonProvider;
use opensandbox_core::service::SandboxService;
use opensandbox_core::template::Template;

#[derive(Parser)]
#[command(name = "opensandboxd")]
#[command(about = "Runtime-neutral sandbox lifecycle engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "opensandbox.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without starting anything.
    Validate,

    /// Construct the configured provider and service, then idle.
    Serve {
        /// Path to the agent executable on the host, injected into local-daemon containers.
        /// Required when `[runtime] type = "local-daemon"`.
        #[arg(long)]
        agent_binary: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Validate => validate(&cli.config),
        Commands::Serve { agent_binary } => serve(&cli.config, agent_binary).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn validate(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(runtime = runtime_name(&config.runtime), "configuration is valid");
    Ok(())
}

async fn serve(config_path: &Path, agent_binary: Option<PathBuf>) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        runtime = runtime_name(&config.runtime),
        host = %config.server.host,
        port = config.server.port,
        "starting opensandboxd"
    );

    let provider = build_provider(&config, agent_binary).await?;
    let storage = config.storage.clone();
    let timing = config.timing.clone();
    let _service = Arc::new(SandboxService::new(provider, storage, timing));

    info!("service constructed; awaiting external shutdown signal");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    Ok(())
}

/// Construct the one live [`RuntimeProvider`] named by `config.runtime`.
async fn build_provider(config: &AppConfig, agent_binary: Option<PathBuf>) -> Result<Arc<dyn RuntimeProvider>> {
    let watch_timeout = std::time::Duration::from_secs(config.timing.watch_timeout_secs);

    match &config.runtime {
        RuntimeConfig::LocalDaemon { agent_image, network_mode } => {
            let agent_binary = agent_binary
                .ok_or_else(|| anyhow::anyhow!("--agent-binary is required for the local-daemon runtime"))?;
            warn!(
                agent_image,
                "local-daemon injects the agent binary directly; agent_image is not consulted by this runtime"
            );
            let provider = LocalDaemonProvider::connect(*network_mode, agent_binary)?;
            Ok(Arc::new(provider))
        }
        RuntimeConfig::ClusterPod { agent_image } => {
            let cluster = config
                .cluster
                .as_ref()
                .context("cluster runtime requires a [cluster] configuration table")?;
            let provider = ClusterPodProvider::connect(
                cluster.namespace.clone(),
                agent_image.clone(),
                cluster.service_account.clone(),
                watch_timeout,
            )
            .await?;
            Ok(Arc::new(provider))
        }
        RuntimeConfig::ClusterCr { agent_image: _, template_file } => {
            let cluster = config
                .cluster
                .as_ref()
                .context("cluster runtime requires a [cluster] configuration table")?;
            let template = Template::load(Path::new(template_file), "AgentSandbox")
                .with_context(|| format!("failed to load template file {template_file}"))?;
            let provider = ClusterCrProvider::connect(
                cluster.namespace.clone(),
                "opensandbox.io".to_string(),
                "v1".to_string(),
                "AgentSandbox".to_string(),
                template,
                watch_timeout,
            )
            .await?;
            Ok(Arc::new(provider))
        }
    }
}

fn runtime_name(runtime: &RuntimeConfig) -> &'static str {
    match runtime {
        RuntimeConfig::LocalDaemon { .. } => "local-daemon",
        RuntimeConfig::ClusterPod { .. } => "cluster-pod",
        RuntimeConfig::ClusterCr { .. } => "cluster-cr",
    }
}
