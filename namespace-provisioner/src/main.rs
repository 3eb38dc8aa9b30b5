use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cluster_provisioner::{ClusterManager, DnsRecordManager, LocalSpawner, NodeSelector, PortAllocator, RemoteSpawner, ServiceDispatcher, StateStore};
use namespace_provisioner::commands;
use namespace_provisioner::config::ProvisionerConfig;
use tracing_subscriber::EnvFilter;

/// Namespace Cluster Provisioner - control-plane CLI
#[derive(Parser)]
#[command(name = "namespace-provisioner")]
#[command(about = "Provisions per-namespace SQL+cache+gateway clusters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Preview without execution
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a namespace cluster
    Provision(commands::ProvisionArgs),
    /// Poll a cluster's provisioning status
    Status(commands::StatusArgs),
    /// Tear down a namespace cluster
    Deprovision(commands::DeprovisionArgs),
    /// Run the HTTP API server in the foreground
    Serve(commands::ServeArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match ProvisionerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    if cli.dry_run {
        println!("dry run: would execute {:?}", std::env::args().collect::<Vec<_>>());
        return ExitCode::SUCCESS;
    }

    let manager = match build_manager(&config).await {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "unreachable database or registry");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Commands::Provision(args) => commands::provision::run(&manager, args, cli.json).await,
        Commands::Status(args) => commands::status::run(&manager, args, cli.json).await,
        Commands::Deprovision(args) => commands::deprovision::run(&manager, args, cli.json).await,
        Commands::Serve(args) => commands::serve::run(manager, config, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(commands::CommandError::Preflight(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(1)
        }
        Err(commands::CommandError::ProvisioningFailed(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(3)
        }
    }
}

async fn build_manager(config: &ProvisionerConfig) -> anyhow::Result<Arc<ClusterManager>> {
    let store = StateStore::connect(&config.database_url).await?;
    let node_selector = NodeSelector::new(store.clone());
    let port_allocator = PortAllocator::new(store.clone());
    let dns = DnsRecordManager::new(store.clone(), config.base_domain.clone());

    let local = LocalSpawner::new(
        config.base_data_dir.clone(),
        config.sql_binary_path.clone().unwrap_or_else(|| "rqlite".to_string()),
        config.cache_binary_path.clone().unwrap_or_else(|| "olricd".to_string()),
        config.gateway_binary_path.clone(),
    );
    let remote = RemoteSpawner::new(config.control_port)?;
    let dispatcher = Arc::new(ServiceDispatcher::new(config.local_node_id.clone(), local, remote));

    Ok(Arc::new(ClusterManager::new(store, node_selector, port_allocator, dns, dispatcher)))
}
