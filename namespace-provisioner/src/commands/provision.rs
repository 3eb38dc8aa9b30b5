use std::sync::Arc;

use cluster_provisioner::ClusterManager;
use serde_json::json;

use super::{CommandError, ProvisionArgs};

pub async fn run(manager: &Arc<ClusterManager>, args: ProvisionArgs, json_output: bool) -> Result<(), CommandError> {
    let cluster = manager
        .provision_cluster(&args.namespace, &args.namespace, &args.requester)
        .await?;

    if json_output {
        println!(
            "{}",
            json!({
                "cluster_id": cluster.id,
                "poll_url": format!("/v1/namespace/status?id={}", cluster.id),
                "status": "provisioning",
                "estimated_time_seconds": 120,
            })
        );
    } else {
        println!("provisioning cluster {} for namespace '{}'", cluster.id, args.namespace);
        println!("poll status with: namespace-provisioner status {}", cluster.id);
    }
    Ok(())
}
