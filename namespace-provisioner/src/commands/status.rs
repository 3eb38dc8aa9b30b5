use std::sync::Arc;

use cluster_provisioner::ClusterManager;
use serde_json::json;

use super::{CommandError, StatusArgs};

pub async fn run(manager: &Arc<ClusterManager>, args: StatusArgs, json_output: bool) -> Result<(), CommandError> {
    let status = manager.get_cluster_status(&args.cluster_id).await?;

    if json_output {
        println!("{}", serde_json::to_string(&status).unwrap_or_else(|_| json!({}).to_string()));
    } else {
        println!("cluster {}: {:?}", status.cluster_id, status.status);
        println!("  nodes: {:?}", status.node_ids);
        println!(
            "  sql_ready={} cache_ready={} gateway_ready={} dns_ready={}",
            status.sql_ready, status.cache_ready, status.gateway_ready, status.dns_ready
        );
        if let Some(err) = &status.error_message {
            println!("  error: {err}");
        }
    }
    Ok(())
}
