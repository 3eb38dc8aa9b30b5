//! Core of the namespace cluster provisioner: node selection, port
//! allocation, service dispatch, DNS record management, and the cluster
//! lifecycle state machine, all backed by a `sqlx`/SQLite `StateStore`.

pub mod cluster_manager;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod models;
pub mod node_selector;
pub mod port_allocator;
pub mod state_store;

pub use cluster_manager::ClusterManager;
pub use dispatcher::{DispatchAction, DispatchEnvelope, DispatchResponse, LocalSpawner, RemoteSpawner, ServiceDispatcher};
pub use dns::DnsRecordManager;
pub use error::{ProvisionError, Result};
pub use models::{
    Cluster, ClusterEvent, ClusterNode, ClusterStatus, DnsRecord, DnsRecordType, NodeCapacity,
    NodeRole, PortBlock, ProvisioningStatus, RegistryNode, ServiceStatus,
};
pub use node_selector::NodeSelector;
pub use port_allocator::PortAllocator;
pub use state_store::StateStore;
