//! Long-running server entrypoint. Grounded on
//! `bpi-core/src/bin/domain_api_server.rs`: read env-driven config, print a
//! startup banner listing endpoints, bind, serve.

use std::sync::Arc;

use cluster_provisioner::{ClusterManager, DnsRecordManager, LocalSpawner, NodeSelector, PortAllocator, RemoteSpawner, ServiceDispatcher, StateStore};
use namespace_provisioner::api::{create_router, internal_router, AppState};
use namespace_provisioner::config::ProvisionerConfig;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ProvisionerConfig::from_env()?;

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

    let manager = Arc::new(ClusterManager::new(store, node_selector, port_allocator, dns, dispatcher));

    let reconciled = manager.reconcile_stale_provisioning().await?;
    if reconciled > 0 {
        tracing::warn!(reconciled, "reconciled stale provisioning clusters at startup");
    }

    let state = AppState { manager };
    let app = create_router(state.clone()).merge(internal_router(state));

    let addr = format!("0.0.0.0:{}", config.server_port);
    println!("Namespace Cluster Provisioner listening on {addr}");
    println!("  POST   /v1/namespace/provision");
    println!("  GET    /v1/namespace/status?id=<cluster_id>");
    println!("  DELETE /v1/namespace/:id");
    println!("  POST   /v1/internal/namespace/spawn");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
