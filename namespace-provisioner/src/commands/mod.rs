//! Control-plane CLI subcommands. Grounded on
//! `bpi-core/src/commands/enc_cluster.rs`'s per-command `handle` shape
//! (`json_output`/`dry_run` flags, talking straight to the manager rather
//! than through HTTP).

pub mod deprovision;
pub mod provision;
pub mod serve;
pub mod status;

use clap::Args;

#[derive(Debug)]
pub enum CommandError {
    /// Invalid args or a preflight failure (exit code 1).
    Preflight(String),
    /// Provisioning failed synchronously, distinct from the async poll
    /// story the HTTP API uses (exit code 3).
    ProvisioningFailed(String),
}

impl From<cluster_provisioner::ProvisionError> for CommandError {
    fn from(e: cluster_provisioner::ProvisionError) -> Self {
        CommandError::ProvisioningFailed(e.to_string())
    }
}

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Namespace to provision a cluster for
    pub namespace: String,
    /// Identity recorded as provisioned_by
    #[arg(long, default_value = "cli")]
    pub requester: String,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Cluster id returned by `provision`
    pub cluster_id: String,
}

#[derive(Args, Debug)]
pub struct DeprovisionArgs {
    /// Cluster id to tear down
    pub cluster_id: String,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Override the configured HTTP port
    #[arg(long)]
    pub port: Option<u16>,
}
