//! Data model shared by every component: the persisted rows described in
//! the store, plus the derived (non-persisted) `NodeCapacity` snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a `Cluster` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Provisioning,
    Ready,
    Degraded,
    Deprovisioning,
    Failed,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Deprovisioning => "deprovisioning",
            ClusterStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisioning" => Some(Self::Provisioning),
            "ready" => Some(Self::Ready),
            "degraded" => Some(Self::Degraded),
            "deprovisioning" => Some(Self::Deprovisioning),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal state machine transition (spec §4.1).
    /// Deprovisioning is reachable from every status except itself: the
    /// spec's only named rejection is deprovisioning an already-
    /// deprovisioning cluster (§7's `invalid_cluster_status`), so
    /// `Provisioning`/`Failed` -> `Deprovisioning` are legal alongside the
    /// `Ready`/`Degraded` cases the lifecycle diagram draws explicitly.
    pub fn can_transition_to(&self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        matches!(
            (*self, next),
            (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Provisioning, Deprovisioning)
                | (Ready, Degraded)
                | (Ready, Deprovisioning)
                | (Degraded, Ready)
                | (Degraded, Deprovisioning)
                | (Failed, Provisioning)
                | (Failed, Deprovisioning)
        )
    }
}

/// Role a `ClusterNode` plays within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    SqlLeader,
    SqlFollower,
    Cache,
    Gateway,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::SqlLeader => "sql_leader",
            NodeRole::SqlFollower => "sql_follower",
            NodeRole::Cache => "cache",
            NodeRole::Gateway => "gateway",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sql_leader" => Some(Self::SqlLeader),
            "sql_follower" => Some(Self::SqlFollower),
            "cache" => Some(Self::Cache),
            "gateway" => Some(Self::Gateway),
            _ => None,
        }
    }
}

/// Run state of an individual spawned service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub namespace_id: String,
    pub namespace_name: String,
    pub status: ClusterStatus,
    pub rqlite_node_count: u32,
    pub cache_node_count: u32,
    pub gateway_node_count: u32,
    pub provisioned_by: String,
    pub provisioned_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub cluster_id: String,
    pub node_id: String,
    pub role: NodeRole,
    pub sql_http_port: Option<u16>,
    pub sql_raft_port: Option<u16>,
    pub cache_http_port: Option<u16>,
    pub cache_memberlist_port: Option<u16>,
    pub gateway_http_port: Option<u16>,
    pub status: ServiceStatus,
    pub process_pid: Option<u32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBlock {
    pub id: String,
    pub node_id: String,
    pub cluster_id: String,
    pub port_start: u16,
    pub port_end: u16,
}

impl PortBlock {
    pub const PORTS_PER_BLOCK: u16 = 5;

    pub fn sql_http_port(&self) -> u16 {
        self.port_start
    }
    pub fn sql_raft_port(&self) -> u16 {
        self.port_start + 1
    }
    pub fn cache_http_port(&self) -> u16 {
        self.port_start + 2
    }
    pub fn cache_memberlist_port(&self) -> u16 {
        self.port_start + 3
    }
    pub fn gateway_http_port(&self) -> u16 {
        self.port_start + 4
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub id: String,
    pub cluster_id: String,
    pub event_type: String,
    pub node_id: Option<String>,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Monotonic per-cluster tiebreaker for events sharing a `created_at`
    /// second (sqlite `CURRENT_TIMESTAMP` has only second resolution).
    pub seq: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    A,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub fqdn: String,
    pub record_type: DnsRecordType,
    pub value: String,
    pub ttl: u32,
    pub namespace: String,
    pub created_by: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived, not persisted: computed on demand by `NodeSelector` from the
/// node registry plus existing allocation tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub node_id: String,
    pub ip: String,
    pub deployment_count: u32,
    pub allocated_ports: u32,
    pub used_memory_mb: u32,
    pub used_cpu_percent: u32,
    pub namespace_instance_count: u32,
    pub score: f64,
}

/// Snapshot returned by `GetClusterStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningStatus {
    pub cluster_id: String,
    pub status: ClusterStatus,
    pub node_ids: Vec<String>,
    pub sql_ready: bool,
    pub cache_ready: bool,
    pub gateway_ready: bool,
    pub dns_ready: bool,
    pub error_message: Option<String>,
    pub provisioned_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
}

/// A row from the external node registry (read-only from this core's POV).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegistryNode {
    pub node_id: String,
    pub ip: String,
    pub last_seen: DateTime<Utc>,
    pub status: String,
    pub deployment_count: i64,
    pub allocated_ports: i64,
    pub used_memory_mb: i64,
    pub used_cpu_percent: i64,
}
