use thiserror::Error;

/// Errors surfaced by every public operation in this crate. Each variant
/// corresponds to one row of the error-kinds table: a distinct cause with
/// its own recovery/HTTP-status meaning at the API boundary.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("insufficient nodes available: needed {needed}, found {available}")]
    InsufficientNodes { needed: u32, available: u32 },

    #[error("node {node_id} is at capacity")]
    NodeAtCapacity { node_id: String },

    #[error("no contiguous port block of {size} ports available in range {start}-{end}")]
    PortsExhausted { size: u16, start: u16, end: u16 },

    #[error("port allocation conflict for node {node_id} after {retries} retries")]
    AllocationConflict { node_id: String, retries: u32 },

    #[error("failed to spawn service {service} on node {node_id}: {reason}")]
    ServiceSpawnFailed {
        service: String,
        node_id: String,
        reason: String,
    },

    #[error("gateway binary missing at {path}")]
    GatewayBinaryMissing { path: String },

    #[error("failed to create DNS record for {fqdn}: {reason}")]
    DnsCreateFailed { fqdn: String, reason: String },

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("cluster already exists for namespace {0}")]
    ClusterAlreadyExists(String),

    #[error("invalid cluster status transition: {from} -> {to}")]
    InvalidClusterStatus { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("remote dispatch error: {0}")]
    Remote(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// Maps each variant onto the HTTP status the API layer should return.
    /// Kept here (rather than in the bin crate) so the mapping travels with
    /// the error type it describes.
    pub fn status_code(&self) -> u16 {
        match self {
            ProvisionError::ClusterNotFound(_) => 404,
            ProvisionError::ClusterAlreadyExists(_) => 409,
            ProvisionError::InvalidClusterStatus { .. } => 422,
            ProvisionError::InsufficientNodes { .. }
            | ProvisionError::NodeAtCapacity { .. }
            | ProvisionError::PortsExhausted { .. }
            | ProvisionError::AllocationConflict { .. } => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
