use std::sync::Arc;

use cluster_provisioner::ClusterManager;
use serde_json::json;

use super::{CommandError, DeprovisionArgs};

pub async fn run(manager: &Arc<ClusterManager>, args: DeprovisionArgs, json_output: bool) -> Result<(), CommandError> {
    manager.deprovision_cluster(&args.cluster_id).await?;

    if json_output {
        println!("{}", json!({ "status": "deprovisioning" }));
    } else {
        println!("cluster {} deprovisioned", args.cluster_id);
    }
    Ok(())
}
