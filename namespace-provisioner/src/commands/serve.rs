use std::sync::Arc;

use cluster_provisioner::ClusterManager;
use tokio::net::TcpListener;

use crate::api::{create_router, internal_router, AppState};
use crate::config::ProvisionerConfig;

use super::{CommandError, ServeArgs};

pub async fn run(manager: Arc<ClusterManager>, config: ProvisionerConfig, args: ServeArgs) -> Result<(), CommandError> {
    let reconciled = manager
        .reconcile_stale_provisioning()
        .await
        .map_err(|e| CommandError::Preflight(e.to_string()))?;
    if reconciled > 0 {
        tracing::warn!(reconciled, "reconciled stale provisioning clusters at startup");
    }

    let state = AppState { manager };
    let app = create_router(state.clone()).merge(internal_router(state));
    let port = args.port.unwrap_or(config.server_port);
    let addr = format!("0.0.0.0:{port}");

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| CommandError::Preflight(format!("failed to bind {addr}: {e}")))?;
    println!("Namespace Cluster Provisioner listening on {addr}");

    axum::serve(listener, app)
        .await
        .map_err(|e| CommandError::Preflight(e.to_string()))?;
    Ok(())
}
