//! Orchestrates the full provisioning workflow and owns the cluster state
//! machine. Grounded on `enc-cluster-manager/src/lib.rs::EncClusterManager`:
//! a struct that owns its sub-managers, is constructed with an async `new`,
//! and emits an audit event after each mutation.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::dispatcher::{DispatchAction, DispatchEnvelope, ServiceDispatcher};
use crate::dns::DnsRecordManager;
use crate::error::{ProvisionError, Result};
use crate::models::{Cluster, ClusterStatus, NodeCapacity, NodeRole, ProvisioningStatus, ServiceStatus};
use crate::node_selector::NodeSelector;
use crate::port_allocator::PortAllocator;
use crate::state_store::StateStore;

const CLUSTER_SIZE: u32 = 3;
const STALE_PROVISIONING_THRESHOLD_SECS: i64 = 600;
const DEFAULT_NAMESPACE: &str = "default";

pub struct ClusterManager {
    store: StateStore,
    node_selector: NodeSelector,
    port_allocator: PortAllocator,
    dns: DnsRecordManager,
    dispatcher: Arc<ServiceDispatcher>,
    /// Process-local per-namespace serialization; combined with the DB's
    /// UNIQUE(namespace_id) constraint as a second line of defense.
    namespace_locks: Arc<DashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ClusterManager {
    pub fn new(
        store: StateStore,
        node_selector: NodeSelector,
        port_allocator: PortAllocator,
        dns: DnsRecordManager,
        dispatcher: Arc<ServiceDispatcher>,
    ) -> Self {
        Self {
            store,
            node_selector,
            port_allocator,
            dns,
            dispatcher,
            namespace_locks: Arc::new(DashMap::new()),
        }
    }

    fn namespace_lock(&self, namespace_id: &str) -> Arc<AsyncMutex<()>> {
        self.namespace_locks
            .entry(namespace_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Returns immediately with a `provisioning` (or existing) `Cluster`
    /// row; the actual workflow runs on a detached background task that
    /// outlives the caller's request context.
    pub async fn provision_cluster(
        self: &Arc<Self>,
        namespace_id: &str,
        namespace_name: &str,
        provisioned_by: &str,
    ) -> Result<Cluster> {
        if namespace_name == DEFAULT_NAMESPACE || namespace_name.is_empty() {
            return Err(ProvisionError::Internal(
                "the default namespace uses a pre-existing global cluster".to_string(),
            ));
        }

        let lock = self.namespace_lock(namespace_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.get_cluster_by_namespace(namespace_id).await? {
            if matches!(existing.status, ClusterStatus::Provisioning | ClusterStatus::Ready) {
                return Ok(existing);
            }
        }

        let cluster = match self
            .store
            .create_cluster(namespace_id, namespace_name, CLUSTER_SIZE, CLUSTER_SIZE, CLUSTER_SIZE, provisioned_by)
            .await
        {
            Ok(c) => c,
            Err(ProvisionError::ClusterAlreadyExists(_)) => {
                // Second line of defense: another caller won the DB race.
                self.store
                    .get_cluster_by_namespace(namespace_id)
                    .await?
                    .ok_or_else(|| ProvisionError::ClusterNotFound(namespace_id.to_string()))?
            }
            Err(e) => return Err(e),
        };

        self.store
            .record_event(&cluster.id, "provisioning_started", None, "provisioning started", serde_json::json!({}))
            .await?;

        let manager = Arc::clone(self);
        let cluster_id = cluster.id.clone();
        let namespace_name = namespace_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.run_provisioning(&cluster_id, &namespace_name).await {
                error!(cluster_id, error = %e, "provisioning task failed");
            }
        });

        Ok(cluster)
    }

    async fn run_provisioning(&self, cluster_id: &str, namespace_name: &str) -> Result<()> {
        let nodes = match self.node_selector.select_nodes_for_cluster(CLUSTER_SIZE).await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.fail_cluster(cluster_id, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.allocate_ports(cluster_id, &nodes).await {
            self.fail_cluster(cluster_id, &e).await;
            return Err(e);
        }

        if let Err(e) = self.start_sql(cluster_id, namespace_name, &nodes).await {
            self.rollback_provisioning(cluster_id, &nodes).await;
            self.fail_cluster(cluster_id, &e).await;
            return Err(e);
        }

        self.start_cache(cluster_id, namespace_name, &nodes).await;

        self.start_gateways(cluster_id, namespace_name, &nodes).await;

        let node_ips: Vec<String> = nodes.iter().map(|n| n.ip.clone()).collect();
        if let Err(e) = self.dns.create_namespace_records(namespace_name, &node_ips, "cluster-manager").await {
            warn!(cluster_id, error = %e, "DNS record creation failed, continuing (best-effort)");
            self.store
                .record_event(cluster_id, "dns_create_failed", None, &e.to_string(), serde_json::json!({}))
                .await?;
        }

        self.store.set_cluster_status(cluster_id, ClusterStatus::Ready, None).await?;
        self.store
            .record_event(cluster_id, "cluster_ready", None, "cluster is ready", serde_json::json!({}))
            .await?;
        info!(cluster_id, "cluster provisioned");
        Ok(())
    }

    async fn allocate_ports(&self, cluster_id: &str, nodes: &[NodeCapacity]) -> Result<()> {
        let mut allocated = Vec::new();
        for node in nodes {
            match self.port_allocator.allocate_port_block(&node.node_id, cluster_id).await {
                Ok(block) => allocated.push(block),
                Err(e) => {
                    for block in &allocated {
                        let _ = self.port_allocator.deallocate_port_block(cluster_id, &block.node_id).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn start_sql(&self, cluster_id: &str, namespace: &str, nodes: &[NodeCapacity]) -> Result<()> {
        let leader = &nodes[0];
        let leader_block = self
            .store
            .find_port_block(&leader.node_id, cluster_id)
            .await?
            .ok_or_else(|| ProvisionError::Internal("leader port block missing".to_string()))?;
        let raft_adv_addr = format!("{}:{}", leader.ip, leader_block.sql_raft_port());
        let http_adv_addr = format!("{}:{}", leader.ip, leader_block.sql_http_port());

        self.spawn_sql_instance(cluster_id, namespace, leader, &leader_block, &http_adv_addr, &raft_adv_addr, &[], true)
            .await?;
        self.store
            .record_event(cluster_id, "sql_started", Some(&leader.node_id), "sql leader started", serde_json::json!({}))
            .await?;
        self.store
            .record_event(cluster_id, "sql_leader_elected", Some(&leader.node_id), "sql leader elected", serde_json::json!({}))
            .await?;

        for follower in &nodes[1..] {
            let block = self
                .store
                .find_port_block(&follower.node_id, cluster_id)
                .await?
                .ok_or_else(|| ProvisionError::Internal("follower port block missing".to_string()))?;
            let follower_http_adv = format!("{}:{}", follower.ip, block.sql_http_port());
            let follower_raft_adv = format!("{}:{}", follower.ip, block.sql_raft_port());
            if let Err(e) = self
                .spawn_sql_instance(
                    cluster_id,
                    namespace,
                    follower,
                    &block,
                    &follower_http_adv,
                    &follower_raft_adv,
                    &[raft_adv_addr.clone()],
                    false,
                )
                .await
            {
                // Stop all SQL instances started so far, including the leader.
                self.dispatcher.local().stop_instance(namespace, &leader.node_id, "sql").await.ok();
                for earlier in &nodes[1..] {
                    if earlier.node_id == follower.node_id {
                        break;
                    }
                    self.dispatcher.local().stop_instance(namespace, &earlier.node_id, "sql").await.ok();
                }
                return Err(e);
            }
            self.store
                .record_event(cluster_id, "sql_started", Some(&follower.node_id), "sql follower started", serde_json::json!({}))
                .await?;
            self.store
                .record_event(cluster_id, "sql_joined", Some(&follower.node_id), "sql follower joined", serde_json::json!({}))
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_sql_instance(
        &self,
        cluster_id: &str,
        namespace: &str,
        node: &NodeCapacity,
        block: &crate::models::PortBlock,
        http_adv_addr: &str,
        raft_adv_addr: &str,
        join_addrs: &[String],
        is_leader: bool,
    ) -> Result<()> {
        let pid = if self.dispatcher.is_local(&node.node_id) {
            self.dispatcher
                .local()
                .spawn_sql(
                    namespace,
                    &node.node_id,
                    block.sql_http_port(),
                    block.sql_raft_port(),
                    http_adv_addr,
                    raft_adv_addr,
                    join_addrs,
                    is_leader,
                )
                .await?
        } else {
            let mut config = std::collections::HashMap::new();
            config.insert("sql_http_port".to_string(), serde_json::json!(block.sql_http_port()));
            config.insert("sql_raft_port".to_string(), serde_json::json!(block.sql_raft_port()));
            config.insert("sql_http_adv_addr".to_string(), serde_json::json!(http_adv_addr));
            config.insert("sql_raft_adv_addr".to_string(), serde_json::json!(raft_adv_addr));
            config.insert("sql_join_addrs".to_string(), serde_json::json!(join_addrs));
            config.insert("sql_is_leader".to_string(), serde_json::json!(is_leader));
            let envelope = DispatchEnvelope {
                action: DispatchAction::SpawnSql,
                namespace: namespace.to_string(),
                node_id: node.node_id.clone(),
                config,
            };
            self.dispatcher.dispatch_remote(&node.ip, envelope).await?.pid.unwrap_or(0)
        };

        let role = if is_leader { NodeRole::SqlLeader } else { NodeRole::SqlFollower };
        let cluster_node = self.store.add_cluster_node(cluster_id, &node.node_id, role, block).await?;
        self.store
            .set_node_status(&cluster_node.id, ServiceStatus::Running, Some(pid), None)
            .await?;
        Ok(())
    }

    /// Cache membership is gossip-based: the full peer list is handed to
    /// every instance, with no designated leader, so one failure does not
    /// cascade into stopping earlier instances the way SQL follower failure
    /// does.
    async fn start_cache(&self, cluster_id: &str, namespace: &str, nodes: &[NodeCapacity]) {
        let mut peers = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Ok(Some(block)) = self.store.find_port_block(&node.node_id, cluster_id).await {
                peers.push(format!("{}:{}", node.ip, block.cache_memberlist_port()));
            }
        }

        for node in nodes {
            let Ok(Some(block)) = self.store.find_port_block(&node.node_id, cluster_id).await else {
                continue;
            };
            let result = if self.dispatcher.is_local(&node.node_id) {
                self.dispatcher
                    .local()
                    .spawn_cache(
                        namespace,
                        &node.node_id,
                        block.cache_http_port(),
                        block.cache_memberlist_port(),
                        &node.ip,
                        &node.ip,
                        &peers,
                    )
                    .await
            } else {
                let mut config = std::collections::HashMap::new();
                config.insert("cache_http_port".to_string(), serde_json::json!(block.cache_http_port()));
                config.insert("cache_memberlist_port".to_string(), serde_json::json!(block.cache_memberlist_port()));
                config.insert("cache_bind_addr".to_string(), serde_json::json!(node.ip));
                config.insert("cache_advertise_addr".to_string(), serde_json::json!(node.ip));
                config.insert("cache_peer_addresses".to_string(), serde_json::json!(peers));
                let envelope = DispatchEnvelope {
                    action: DispatchAction::SpawnCache,
                    namespace: namespace.to_string(),
                    node_id: node.node_id.clone(),
                    config,
                };
                self.dispatcher
                    .dispatch_remote(&node.ip, envelope)
                    .await
                    .map(|r| r.pid.unwrap_or(0))
            };

            match result {
                Ok(pid) => {
                    if let Ok(cluster_node) =
                        self.store.add_cluster_node(cluster_id, &node.node_id, NodeRole::Cache, &block).await
                    {
                        let _ = self
                            .store
                            .set_node_status(&cluster_node.id, ServiceStatus::Running, Some(pid), None)
                            .await;
                    }
                    let _ = self
                        .store
                        .record_event(cluster_id, "cache_started", Some(&node.node_id), "cache started", serde_json::json!({}))
                        .await;
                    let _ = self
                        .store
                        .record_event(cluster_id, "cache_joined", Some(&node.node_id), "cache joined", serde_json::json!({}))
                        .await;
                }
                Err(e) => {
                    warn!(cluster_id, node_id = %node.node_id, error = %e, "cache spawn failed");
                }
            }
        }
    }

    /// Gateway spawn failure due to a missing binary is non-fatal: the
    /// cluster still reaches `ready`; any other gateway failure here is
    /// logged the same way (the spec marks only the binary-missing case as
    /// non-fatal, but both are handled per-node so one gateway failure does
    /// not block the rest).
    async fn start_gateways(&self, cluster_id: &str, namespace: &str, nodes: &[NodeCapacity]) {
        let cache_endpoints: Vec<String> = {
            let mut v = Vec::new();
            for node in nodes {
                if let Ok(Some(block)) = self.store.find_port_block(&node.node_id, cluster_id).await {
                    v.push(format!("{}:{}", node.ip, block.cache_http_port()));
                }
            }
            v
        };

        for node in nodes {
            let Ok(Some(block)) = self.store.find_port_block(&node.node_id, cluster_id).await else {
                continue;
            };
            let sql_endpoint = format!("{}:{}", node.ip, block.sql_http_port());

            // Gateway has no remote dispatch action (§4.4): it is always
            // started through this host's own local spawner, never POSTed
            // to a peer's internal spawn endpoint.
            let result = self
                .dispatcher
                .local()
                .spawn_gateway(namespace, &node.node_id, block.gateway_http_port(), &cache_endpoints, &sql_endpoint)
                .await;

            match result {
                Ok(pid) => {
                    if let Ok(cluster_node) =
                        self.store.add_cluster_node(cluster_id, &node.node_id, NodeRole::Gateway, &block).await
                    {
                        let _ = self
                            .store
                            .set_node_status(&cluster_node.id, ServiceStatus::Running, Some(pid), None)
                            .await;
                    }
                    let _ = self
                        .store
                        .record_event(cluster_id, "gateway_started", Some(&node.node_id), "gateway started", serde_json::json!({}))
                        .await;
                }
                Err(ProvisionError::GatewayBinaryMissing { .. }) => {
                    let _ = self
                        .store
                        .record_event(
                            cluster_id,
                            "gateway_skipped",
                            Some(&node.node_id),
                            "gateway binary not available, tenant falls back to shared gateway",
                            serde_json::json!({}),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(cluster_id, node_id = %node.node_id, error = %e, "gateway spawn failed");
                }
            }
        }
    }

    /// Best-effort remote stop: posts the §4.4 stop envelope and logs on
    /// failure rather than retrying, per §9 ("the dispatcher does not retry
    /// on failure; orphan processes on a dead remote host are tolerated").
    async fn stop_remote_best_effort(&self, node_ip: &str, namespace: &str, node_id: &str, action: DispatchAction) {
        let envelope = DispatchEnvelope {
            action,
            namespace: namespace.to_string(),
            node_id: node_id.to_string(),
            config: std::collections::HashMap::new(),
        };
        if let Err(e) = self.dispatcher.dispatch_remote(node_ip, envelope).await {
            warn!(namespace, node_id, error = %e, "remote stop failed, continuing (best-effort, not retried)");
        }
    }

    async fn rollback_provisioning(&self, cluster_id: &str, nodes: &[NodeCapacity]) {
        let cluster = match self.store.get_cluster(cluster_id).await {
            Ok(c) => c,
            Err(_) => return,
        };
        let namespace = cluster.namespace_name;

        for node in nodes {
            // Gateway is always spawned through this host's own local
            // spawner (§4.4: "gateway kept local"), never dispatched
            // remotely, so its stop is always local too.
            let _ = self.dispatcher.local().stop_instance(&namespace, &node.node_id, "gateway").await;

            if self.dispatcher.is_local(&node.node_id) {
                let _ = self.dispatcher.local().stop_instance(&namespace, &node.node_id, "cache").await;
                let _ = self.dispatcher.local().stop_instance(&namespace, &node.node_id, "sql").await;
            } else {
                self.stop_remote_best_effort(&node.ip, &namespace, &node.node_id, DispatchAction::StopCache).await;
                self.stop_remote_best_effort(&node.ip, &namespace, &node.node_id, DispatchAction::StopSql).await;
            }
        }

        let _ = self.port_allocator.deallocate_all_port_blocks(cluster_id).await;
        let _ = self.store.delete_cluster_nodes_for_cluster(cluster_id).await;
    }

    async fn fail_cluster(&self, cluster_id: &str, err: &ProvisionError) {
        let _ = self.store.increment_retry_count(cluster_id).await;
        match self
            .store
            .set_cluster_status(cluster_id, ClusterStatus::Failed, Some(&err.to_string()))
            .await
        {
            Ok(()) => {
                let _ = self
                    .store
                    .record_event(cluster_id, "cluster_failed", None, &err.to_string(), serde_json::json!({}))
                    .await;
            }
            Err(e) => {
                // Rejected transition: spec §4.1 says emit no event.
                warn!(cluster_id, error = %e, "could not transition cluster to failed");
            }
        }
        let _ = self.port_allocator.deallocate_all_port_blocks(cluster_id).await;
    }

    /// Synchronous teardown: best-effort stop of every service, then
    /// deallocation, DNS removal, and finally the row deletes. Errors on
    /// individual stop attempts are logged but never abort the sweep.
    pub async fn deprovision_cluster(&self, cluster_id: &str) -> Result<()> {
        let cluster = self.store.get_cluster(cluster_id).await?;
        if cluster.status == ClusterStatus::Deprovisioning {
            return Err(ProvisionError::InvalidClusterStatus {
                from: cluster.status.as_str().to_string(),
                to: ClusterStatus::Deprovisioning.as_str().to_string(),
            });
        }

        self.store.set_cluster_status(cluster_id, ClusterStatus::Deprovisioning, None).await?;

        let cluster_nodes = self.store.list_cluster_nodes(cluster_id).await?;
        for cn in &cluster_nodes {
            let role = match cn.role {
                NodeRole::SqlLeader | NodeRole::SqlFollower => "sql",
                NodeRole::Cache => "cache",
                NodeRole::Gateway => "gateway",
            };

            // Gateway has no remote dispatch action (§4.4: "gateway kept
            // local") so it only ever needs a local stop. SQL/cache on a
            // remote node are dispatched a best-effort stop envelope; port
            // deallocation below proceeds regardless so ports are never
            // leaked from the allocator's point of view even if the remote
            // host is dead.
            if self.dispatcher.is_local(&cn.node_id) || matches!(cn.role, NodeRole::Gateway) {
                if let Err(e) = self.dispatcher.local().stop_instance(&cluster.namespace_name, &cn.node_id, role).await {
                    warn!(cluster_id, node_id = %cn.node_id, error = %e, "stop failed during deprovision, continuing");
                }
            } else {
                let action = match cn.role {
                    NodeRole::Cache => DispatchAction::StopCache,
                    _ => DispatchAction::StopSql,
                };
                match self.store.find_registry_node_ip(&cn.node_id).await {
                    Ok(Some(ip)) => {
                        self.stop_remote_best_effort(&ip, &cluster.namespace_name, &cn.node_id, action).await
                    }
                    Ok(None) => warn!(cluster_id, node_id = %cn.node_id, "remote node missing from registry, cannot dispatch stop"),
                    Err(e) => warn!(cluster_id, node_id = %cn.node_id, error = %e, "failed to look up remote node ip"),
                }
            }
        }

        self.port_allocator.deallocate_all_port_blocks(cluster_id).await.ok();
        self.dns.delete_namespace_records(&cluster.namespace_name).await.ok();
        self.store.delete_cluster(cluster_id).await?;
        Ok(())
    }

    /// Exposes the dispatcher so the bin crate's internal spawn endpoint can
    /// route an incoming envelope to the local spawner on this host.
    pub fn dispatcher(&self) -> &Arc<ServiceDispatcher> {
        &self.dispatcher
    }

    pub async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        self.store.get_cluster(cluster_id).await
    }

    pub async fn get_cluster_by_namespace_name(&self, namespace_id: &str) -> Result<Option<Cluster>> {
        self.store.get_cluster_by_namespace(namespace_id).await
    }

    pub async fn get_cluster_status(&self, cluster_id: &str) -> Result<ProvisioningStatus> {
        let cluster = self.store.get_cluster(cluster_id).await?;
        let nodes = self.store.list_cluster_nodes(cluster_id).await?;

        let running_count = |role: NodeRole| {
            nodes
                .iter()
                .filter(|n| n.role == role && n.status == ServiceStatus::Running)
                .count() as u32
        };
        let sql_ready = running_count(NodeRole::SqlLeader) + running_count(NodeRole::SqlFollower)
            >= cluster.rqlite_node_count;
        let cache_ready = running_count(NodeRole::Cache) >= cluster.cache_node_count;
        let gateway_ready = running_count(NodeRole::Gateway) >= cluster.gateway_node_count;
        let dns_ready = !self
            .dns
            .list_namespace_records(&cluster.namespace_name)
            .await
            .unwrap_or_default()
            .is_empty();

        Ok(ProvisioningStatus {
            cluster_id: cluster.id,
            status: cluster.status,
            node_ids: nodes.iter().map(|n| n.node_id.clone()).collect::<std::collections::BTreeSet<_>>().into_iter().collect(),
            sql_ready,
            cache_ready,
            gateway_ready,
            dns_ready,
            error_message: cluster.error_message,
            provisioned_at: cluster.provisioned_at,
            ready_at: cluster.ready_at,
        })
    }

    /// Returns `(cluster_id, status, needs_provisioning)`.
    pub async fn check_namespace_cluster(&self, namespace_id: &str, namespace_name: &str) -> Result<(String, String, bool)> {
        if namespace_name == DEFAULT_NAMESPACE || namespace_name.is_empty() {
            return Ok((String::new(), DEFAULT_NAMESPACE.to_string(), false));
        }

        self.store.delete_if_failed(namespace_id).await?;

        match self.store.get_cluster_by_namespace(namespace_id).await? {
            Some(cluster) => Ok((cluster.id, cluster.status.as_str().to_string(), false)),
            None => Ok((String::new(), String::new(), true)),
        }
    }

    /// Run once at startup before the HTTP listener binds: any cluster
    /// stuck in `provisioning` past the threshold likely belongs to a
    /// process that crashed mid-workflow, and its namespace lock is gone
    /// with it, so it is transitioned to `failed` rather than left dangling.
    pub async fn reconcile_stale_provisioning(&self) -> Result<u32> {
        let stale = self
            .store
            .stale_provisioning_clusters(STALE_PROVISIONING_THRESHOLD_SECS)
            .await?;
        for cluster in &stale {
            warn!(cluster_id = %cluster.id, "reconciling stale provisioning cluster at startup");
            self.store
                .set_cluster_status(&cluster.id, ClusterStatus::Failed, Some("stale provisioning reconciled at startup"))
                .await?;
            self.store
                .record_event(&cluster.id, "cluster_failed", None, "reconciled stale provisioning at startup", serde_json::json!({}))
                .await?;
        }
        Ok(stale.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{LocalSpawner, RemoteSpawner};
    use chrono::Utc;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    async fn test_manager() -> Arc<ClusterManager> {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        let node_selector = NodeSelector::new(store.clone());
        let port_allocator = PortAllocator::new(store.clone());
        let dns = DnsRecordManager::new(store.clone(), "devnet-orama.network".to_string());
        let local = LocalSpawner::new("/tmp".to_string(), "/bin/true".to_string(), "/bin/true".to_string(), None);
        let remote = RemoteSpawner::new(19999).unwrap();
        let dispatcher = Arc::new(ServiceDispatcher::new("self-node".to_string(), local, remote));
        Arc::new(ClusterManager::new(store, node_selector, port_allocator, dns, dispatcher))
    }

    /// A tiny shell script that ignores whatever CLI flags are appended to
    /// it and just sleeps, standing in for a real long-running service
    /// binary so spawn_tracked's post-spawn liveness check passes.
    fn long_running_stub() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\nexec sleep 30").unwrap();
        let mut perms = file.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o755);
        file.as_file().set_permissions(perms).unwrap();
        file
    }

    /// Stands in for a peer worker node: serves the real §4.4 internal
    /// dispatch contract over loopback HTTP, backed by its own
    /// [`LocalSpawner`], so `RemoteSpawner` round-trips against something
    /// real rather than a hand-rolled stub.
    async fn start_mock_remote_node() -> (u16, tokio::task::JoinHandle<()>, tempfile::NamedTempFile) {
        let stub = long_running_stub();
        let path = stub.path().to_string_lossy().to_string();
        let remote_spawner = Arc::new(LocalSpawner::new(
            std::env::temp_dir().to_string_lossy().to_string(),
            path.clone(),
            path,
            None,
        ));
        let app = axum::Router::new().route(
            "/v1/internal/namespace/spawn",
            axum::routing::post(move |axum::Json(envelope): axum::Json<DispatchEnvelope>| {
                let spawner = remote_spawner.clone();
                async move {
                    match spawner.handle_envelope(&envelope).await {
                        Ok(pid) => axum::Json(serde_json::json!({"success": true, "pid": pid})),
                        Err(e) => axum::Json(serde_json::json!({"success": false, "error": e.to_string()})),
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (port, handle, stub)
    }

    /// A manager whose local spawner keeps a process alive through the
    /// startup-grace check and whose remote dispatch targets a real mock
    /// peer node, for exercising the full provisioning workflow (leader
    /// local, followers remote) rather than just its early failure paths.
    async fn test_manager_with_live_spawner() -> (
        Arc<ClusterManager>,
        tempfile::NamedTempFile,
        tokio::task::JoinHandle<()>,
        tempfile::NamedTempFile,
    ) {
        let stub = long_running_stub();
        let path = stub.path().to_string_lossy().to_string();
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        let node_selector = NodeSelector::new(store.clone());
        let port_allocator = PortAllocator::new(store.clone());
        let dns = DnsRecordManager::new(store.clone(), "devnet-orama.network".to_string());
        let local = LocalSpawner::new(std::env::temp_dir().to_string_lossy().to_string(), path.clone(), path, None);
        let (mock_port, mock_handle, mock_stub) = start_mock_remote_node().await;
        let remote = RemoteSpawner::new(mock_port).unwrap();
        // "node-0" is this host; node-1/node-2 are the mock peer above.
        let dispatcher = Arc::new(ServiceDispatcher::new("node-0".to_string(), local, remote));
        (
            Arc::new(ClusterManager::new(store, node_selector, port_allocator, dns, dispatcher)),
            stub,
            mock_handle,
            mock_stub,
        )
    }

    /// All three registry entries resolve to the same loopback address: the
    /// local one (`node-0`) is dispatched in-process, the other two are
    /// dispatched over real HTTP to the mock peer node above.
    async fn seed_three_nodes(manager: &ClusterManager) {
        for i in 0..3 {
            manager
                .store
                .seed_registry_node(&format!("node-{i}"), "127.0.0.1", Utc::now())
                .await
                .unwrap();
        }
    }

    /// A manager whose local (leader) spawn succeeds but whose remote
    /// dispatch target has nothing listening, so follower sql spawns fail
    /// with a connection error rather than a slow timeout.
    async fn test_manager_with_unreachable_remote() -> (Arc<ClusterManager>, tempfile::NamedTempFile) {
        let stub = long_running_stub();
        let path = stub.path().to_string_lossy().to_string();
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        let node_selector = NodeSelector::new(store.clone());
        let port_allocator = PortAllocator::new(store.clone());
        let dns = DnsRecordManager::new(store.clone(), "devnet-orama.network".to_string());
        let local = LocalSpawner::new(std::env::temp_dir().to_string_lossy().to_string(), path.clone(), path, None);

        // Grab a genuinely free ephemeral port, then drop the listener so
        // nothing answers there — remote dispatch fails fast (connection
        // refused) instead of waiting out a 60s timeout.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);
        let remote = RemoteSpawner::new(dead_port).unwrap();
        let dispatcher = Arc::new(ServiceDispatcher::new("node-0".to_string(), local, remote));
        (Arc::new(ClusterManager::new(store, node_selector, port_allocator, dns, dispatcher)), stub)
    }

    #[tokio::test]
    async fn default_namespace_is_rejected_for_provisioning() {
        let manager = test_manager().await;
        let err = manager.provision_cluster("ns-default", "default", "api").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Internal(_)));
    }

    #[tokio::test]
    async fn check_namespace_cluster_default_short_circuits() {
        let manager = test_manager().await;
        let (id, status, needs) = manager.check_namespace_cluster("ns-default", "default").await.unwrap();
        assert_eq!(id, "");
        assert_eq!(status, "default");
        assert!(!needs);
    }

    #[tokio::test]
    async fn check_namespace_cluster_unknown_needs_provisioning() {
        let manager = test_manager().await;
        let (id, status, needs) = manager.check_namespace_cluster("ns-new", "fresh").await.unwrap();
        assert_eq!(id, "");
        assert_eq!(status, "");
        assert!(needs);
    }

    #[tokio::test]
    async fn provision_without_eligible_nodes_fails_the_cluster() {
        let manager = test_manager().await;
        let cluster = manager.provision_cluster("ns-1", "alice", "api").await.unwrap();
        // The background task runs with no registry nodes seeded, so it
        // must fail fast with insufficient_nodes.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let status = manager.get_cluster_status(&cluster.id).await.unwrap();
        assert_eq!(status.status, ClusterStatus::Failed);
        assert!(status.error_message.is_some());
    }

    #[tokio::test]
    async fn deprovision_of_already_deprovisioning_cluster_is_refused() {
        let manager = test_manager().await;
        let cluster = manager.provision_cluster("ns-2", "bob", "api").await.unwrap();
        manager
            .store
            .set_cluster_status(&cluster.id, ClusterStatus::Deprovisioning, None)
            .await
            .unwrap();
        let err = manager.deprovision_cluster(&cluster.id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidClusterStatus { .. }));
    }

    #[tokio::test]
    async fn deprovision_removes_all_child_rows() {
        let manager = test_manager().await;
        let cluster = manager.provision_cluster("ns-3", "carol", "api").await.unwrap();
        manager.deprovision_cluster(&cluster.id).await.unwrap();
        assert!(manager.get_cluster(&cluster.id).await.is_err());
        assert!(manager
            .get_cluster_by_namespace_name("ns-3")
            .await
            .unwrap()
            .is_none());
    }

    /// End-to-end scenario 1 from the testable-properties list: three fresh
    /// eligible nodes, gateway binary unset (so gateways fall back to
    /// `gateway_skipped` the same way a missing binary does), and a
    /// namespace with no prior cluster. The workflow should reach `ready`
    /// with one port block per node and nine+ cluster-node rows.
    #[tokio::test]
    async fn happy_path_three_fresh_nodes_reaches_ready() {
        let (manager, _stub, _mock_handle, _mock_stub) = test_manager_with_live_spawner().await;
        seed_three_nodes(&manager).await;

        let cluster = manager.provision_cluster("ns-alice", "alice", "wallet-0xAB").await.unwrap();

        let mut status = manager.get_cluster_status(&cluster.id).await.unwrap();
        for _ in 0..50 {
            if status.status == ClusterStatus::Ready || status.status == ClusterStatus::Failed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            status = manager.get_cluster_status(&cluster.id).await.unwrap();
        }

        assert_eq!(status.status, ClusterStatus::Ready);
        assert!(status.sql_ready);
        assert!(status.cache_ready);
        // No gateway binary configured in this harness, so gateways are
        // skipped (non-fatal) rather than running.
        assert!(!status.gateway_ready);
        assert!(status.dns_ready);
        assert_eq!(status.node_ids.len(), 3);

        let nodes = manager.store.list_cluster_nodes(&cluster.id).await.unwrap();
        // 3 sql (1 leader + 2 followers) + 3 cache; gateways skipped.
        assert_eq!(nodes.len(), 6);
        assert_eq!(
            nodes.iter().filter(|n| n.role == NodeRole::SqlLeader).count(),
            1
        );

        // All three mock nodes share one loopback address, so the primary
        // and wildcard A records collapse to one value each rather than
        // three (distinct-IP fan-out is covered directly in dns.rs's tests).
        let dns_records = manager.dns.list_namespace_records("alice").await.unwrap();
        assert_eq!(dns_records.len(), 2);
        assert!(dns_records.iter().any(|r| r.fqdn == "ns-alice.devnet-orama.network."));
        assert!(dns_records.iter().any(|r| r.fqdn == "*.ns-alice.devnet-orama.network."));

        let refetched = manager.get_cluster(&cluster.id).await.unwrap();
        assert!(refetched.ready_at.is_some());
    }

    /// Port contention: two namespaces racing for the same node must each
    /// end up with their own, non-overlapping block rather than colliding.
    #[tokio::test]
    async fn concurrent_provisioning_on_shared_node_gets_distinct_port_blocks() {
        let (manager, _stub, _mock_handle, _mock_stub) = test_manager_with_live_spawner().await;
        seed_three_nodes(&manager).await;

        let alice = manager.provision_cluster("ns-alice", "alice", "api").await.unwrap();
        let bob = manager.provision_cluster("ns-bob", "bob", "api").await.unwrap();

        for cluster_id in [&alice.id, &bob.id] {
            let mut status = manager.get_cluster_status(cluster_id).await.unwrap();
            for _ in 0..50 {
                if status.status == ClusterStatus::Ready || status.status == ClusterStatus::Failed {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                status = manager.get_cluster_status(cluster_id).await.unwrap();
            }
            assert_eq!(status.status, ClusterStatus::Ready);
        }

        let alice_block = manager.store.find_port_block("node-0", &alice.id).await.unwrap().unwrap();
        let bob_block = manager.store.find_port_block("node-0", &bob.id).await.unwrap().unwrap();
        assert_ne!(alice_block.port_start, bob_block.port_start);
    }

    /// End-to-end scenario 3: the sql leader comes up locally, but the first
    /// follower's remote dispatch can't reach anything. The whole cluster
    /// must roll back — leader stopped, no sql cluster-node rows survive —
    /// and the cluster itself is marked `failed`, not left half-provisioned.
    #[tokio::test]
    async fn sql_follower_spawn_failure_rolls_back_and_fails_cluster() {
        let (manager, _stub) = test_manager_with_unreachable_remote().await;
        seed_three_nodes(&manager).await;

        let cluster = manager.provision_cluster("ns-alice", "alice", "api").await.unwrap();

        let mut status = manager.get_cluster_status(&cluster.id).await.unwrap();
        for _ in 0..50 {
            if status.status == ClusterStatus::Ready || status.status == ClusterStatus::Failed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            status = manager.get_cluster_status(&cluster.id).await.unwrap();
        }

        assert_eq!(status.status, ClusterStatus::Failed);
        assert!(status.error_message.is_some());

        let nodes = manager.store.list_cluster_nodes(&cluster.id).await.unwrap();
        assert!(nodes.is_empty(), "rollback must remove every cluster-node row, found {nodes:?}");

        let alice_block = manager.store.find_port_block("node-0", &cluster.id).await.unwrap();
        assert!(alice_block.is_none(), "rollback must deallocate the leader's port block too");
    }
}
