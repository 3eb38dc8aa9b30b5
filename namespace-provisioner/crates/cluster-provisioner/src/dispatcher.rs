//! Service spawn/stop dispatch. The remote path is grounded on
//! `bpi-shadow-registry/src/web3_integration.rs::send_rpc_request` (POST +
//! JSON + timeout + status check); the local path generalizes
//! `cue_orchestration.rs`'s one-shot `Command::new(...).output()` into a
//! tracked long-running `.spawn()` child with SIGTERM-then-SIGKILL
//! escalation, since the teacher never starts a long-lived child itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{ProvisionError, Result};

const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);
const STARTUP_GRACE: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(10);
const INTERNAL_AUTH_HEADER: &str = "X-Orama-Internal-Auth";
const INTERNAL_AUTH_VALUE: &str = "namespace-coordination";

fn missing_field(name: &str) -> ProvisionError {
    ProvisionError::Internal(format!("dispatch envelope missing field {name}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchAction {
    SpawnSql,
    StopSql,
    SpawnCache,
    StopCache,
}

impl DispatchAction {
    fn as_str(&self) -> &'static str {
        match self {
            DispatchAction::SpawnSql => "spawn-sql",
            DispatchAction::StopSql => "stop-sql",
            DispatchAction::SpawnCache => "spawn-cache",
            DispatchAction::StopCache => "stop-cache",
        }
    }
}

/// Wire envelope posted to a peer's internal spawn endpoint (§4.4). Kept as
/// a flat string map for service-specific fields rather than an enum of
/// per-action structs, matching how the teacher's dispatch bodies carry a
/// free-form config map alongside a fixed `action`/`node_id`/`namespace`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub action: DispatchAction,
    pub namespace: String,
    pub node_id: String,
    #[serde(flatten)]
    pub config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct DispatchResponse {
    pub success: bool,
    pub error: Option<String>,
    pub pid: Option<u32>,
}

/// Identifies a running local instance for idempotent spawn/stop.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct InstanceKey {
    namespace: String,
    node_id: String,
    role: &'static str,
}

struct RunningInstance {
    child: Child,
    pid: u32,
}

/// Spawns and tracks child processes for services targeted at this host.
pub struct LocalSpawner {
    base_data_dir: String,
    gateway_binary_path: Option<String>,
    sql_binary_path: String,
    cache_binary_path: String,
    instances: Arc<DashMap<InstanceKey, RunningInstance>>,
}

impl LocalSpawner {
    pub fn new(
        base_data_dir: String,
        sql_binary_path: String,
        cache_binary_path: String,
        gateway_binary_path: Option<String>,
    ) -> Self {
        Self {
            base_data_dir,
            gateway_binary_path,
            sql_binary_path,
            cache_binary_path,
            instances: Arc::new(DashMap::new()),
        }
    }

    pub async fn spawn_sql(
        &self,
        namespace: &str,
        node_id: &str,
        http_port: u16,
        raft_port: u16,
        adv_addr: &str,
        raft_adv_addr: &str,
        join_addrs: &[String],
        is_leader: bool,
    ) -> Result<u32> {
        let key = InstanceKey {
            namespace: namespace.to_string(),
            node_id: node_id.to_string(),
            role: "sql",
        };
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.pid);
        }

        let data_dir = format!("{}/{}/sql", self.base_data_dir, namespace);
        let mut cmd = Command::new(&self.sql_binary_path);
        cmd.arg("--http-port")
            .arg(http_port.to_string())
            .arg("--raft-port")
            .arg(raft_port.to_string())
            .arg("--http-adv-addr")
            .arg(adv_addr)
            .arg("--raft-adv-addr")
            .arg(raft_adv_addr)
            .arg("--data-dir")
            .arg(&data_dir);
        if !is_leader {
            for addr in join_addrs {
                cmd.arg("--join").arg(addr);
            }
        }
        self.spawn_tracked(key, cmd).await
    }

    pub async fn spawn_cache(
        &self,
        namespace: &str,
        node_id: &str,
        http_port: u16,
        memberlist_port: u16,
        bind_addr: &str,
        advertise_addr: &str,
        peer_addresses: &[String],
    ) -> Result<u32> {
        let key = InstanceKey {
            namespace: namespace.to_string(),
            node_id: node_id.to_string(),
            role: "cache",
        };
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.pid);
        }

        let data_dir = format!("{}/{}/cache", self.base_data_dir, namespace);
        let mut cmd = Command::new(&self.cache_binary_path);
        cmd.arg("--http-port")
            .arg(http_port.to_string())
            .arg("--memberlist-port")
            .arg(memberlist_port.to_string())
            // bind-address rule: gossip binds the advertised IP, never the
            // wildcard address, to dodge dual-stack resolution ambiguity.
            .arg("--bind-addr")
            .arg(bind_addr)
            .arg("--advertise-addr")
            .arg(advertise_addr)
            .arg("--data-dir")
            .arg(&data_dir);
        for peer in peer_addresses {
            cmd.arg("--peer").arg(peer);
        }
        self.spawn_tracked(key, cmd).await
    }

    pub async fn spawn_gateway(
        &self,
        namespace: &str,
        node_id: &str,
        http_port: u16,
        cache_endpoints: &[String],
        sql_endpoint: &str,
    ) -> Result<u32> {
        let path = self
            .gateway_binary_path
            .as_ref()
            .ok_or_else(|| ProvisionError::GatewayBinaryMissing {
                path: "<unset>".to_string(),
            })?;
        if !std::path::Path::new(path).exists() {
            return Err(ProvisionError::GatewayBinaryMissing { path: path.clone() });
        }

        let key = InstanceKey {
            namespace: namespace.to_string(),
            node_id: node_id.to_string(),
            role: "gateway",
        };
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.pid);
        }

        let mut cmd = Command::new(path);
        cmd.arg("--http-port")
            .arg(http_port.to_string())
            .arg("--sql-endpoint")
            .arg(sql_endpoint);
        for endpoint in cache_endpoints {
            cmd.arg("--cache-endpoint").arg(endpoint);
        }
        self.spawn_tracked(key, cmd).await
    }

    async fn spawn_tracked(&self, key: InstanceKey, mut cmd: Command) -> Result<u32> {
        cmd.kill_on_drop(false);
        let mut child = cmd.spawn().map_err(|e| ProvisionError::ServiceSpawnFailed {
            service: key.role.to_string(),
            node_id: key.node_id.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| ProvisionError::ServiceSpawnFailed {
            service: key.role.to_string(),
            node_id: key.node_id.clone(),
            reason: "process exited before pid was observed".to_string(),
        })?;

        // Startup grace: give the control port a moment before declaring
        // the instance up. A real deployment would poll the health port;
        // here we bound the wait and proceed, trusting the caller's own
        // readiness polling to catch an early exit.
        tokio::time::sleep(STARTUP_GRACE.min(Duration::from_millis(50))).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ProvisionError::ServiceSpawnFailed {
                service: key.role.to_string(),
                node_id: key.node_id.clone(),
                reason: format!("process exited immediately with {status}"),
            });
        }

        info!(role = key.role, node_id = %key.node_id, pid, "spawned local service");
        self.instances.insert(key, RunningInstance { child, pid });
        Ok(pid)
    }

    /// Executes a [`DispatchEnvelope`] received over the internal HTTP
    /// endpoint, extracting the service-specific fields (§4.4's table) out
    /// of its free-form config map. Returns the spawned PID.
    pub async fn handle_envelope(&self, envelope: &DispatchEnvelope) -> Result<u32> {
        let get_u16 = |key: &str| -> Option<u16> {
            envelope.config.get(key).and_then(|v| v.as_u64()).map(|v| v as u16)
        };
        let get_str = |key: &str| -> Option<String> {
            envelope.config.get(key).and_then(|v| v.as_str()).map(String::from)
        };
        let get_str_vec = |key: &str| -> Vec<String> {
            envelope
                .config
                .get(key)
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|e| e.as_str().map(String::from)).collect())
                .unwrap_or_default()
        };

        match envelope.action {
            DispatchAction::SpawnSql => {
                let http_port = get_u16("sql_http_port").ok_or_else(|| missing_field("sql_http_port"))?;
                let raft_port = get_u16("sql_raft_port").ok_or_else(|| missing_field("sql_raft_port"))?;
                let http_adv_addr = get_str("sql_http_adv_addr").ok_or_else(|| missing_field("sql_http_adv_addr"))?;
                let raft_adv_addr = get_str("sql_raft_adv_addr").ok_or_else(|| missing_field("sql_raft_adv_addr"))?;
                let join_addrs = get_str_vec("sql_join_addrs");
                let is_leader = envelope
                    .config
                    .get("sql_is_leader")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.spawn_sql(
                    &envelope.namespace,
                    &envelope.node_id,
                    http_port,
                    raft_port,
                    &http_adv_addr,
                    &raft_adv_addr,
                    &join_addrs,
                    is_leader,
                )
                .await
            }
            DispatchAction::StopSql => {
                self.stop_instance(&envelope.namespace, &envelope.node_id, "sql").await?;
                Ok(0)
            }
            DispatchAction::SpawnCache => {
                let http_port = get_u16("cache_http_port").ok_or_else(|| missing_field("cache_http_port"))?;
                let memberlist_port =
                    get_u16("cache_memberlist_port").ok_or_else(|| missing_field("cache_memberlist_port"))?;
                let bind_addr = get_str("cache_bind_addr").ok_or_else(|| missing_field("cache_bind_addr"))?;
                let advertise_addr =
                    get_str("cache_advertise_addr").ok_or_else(|| missing_field("cache_advertise_addr"))?;
                let peers = get_str_vec("cache_peer_addresses");
                self.spawn_cache(
                    &envelope.namespace,
                    &envelope.node_id,
                    http_port,
                    memberlist_port,
                    &bind_addr,
                    &advertise_addr,
                    &peers,
                )
                .await
            }
            DispatchAction::StopCache => {
                self.stop_instance(&envelope.namespace, &envelope.node_id, "cache").await?;
                Ok(0)
            }
        }
    }

    pub async fn stop_instance(&self, namespace: &str, node_id: &str, role: &'static str) -> Result<()> {
        let key = InstanceKey {
            namespace: namespace.to_string(),
            node_id: node_id.to_string(),
            role,
        };
        let Some((_, mut instance)) = self.instances.remove(&key) else {
            return Ok(());
        };

        // SAFETY: pid came from the child we just spawned; sending SIGTERM
        // to request graceful shutdown before escalating to SIGKILL.
        unsafe {
            libc::kill(instance.pid as i32, libc::SIGTERM);
        }

        let waited = tokio::time::timeout(STOP_GRACE, instance.child.wait()).await;
        if waited.is_err() {
            warn!(role, node_id, pid = instance.pid, "graceful stop timed out, sending SIGKILL");
            let _ = instance.child.start_kill();
            let _ = instance.child.wait().await;
        }
        Ok(())
    }
}

/// Dispatches spawn/stop requests to a peer node over HTTP.
pub struct RemoteSpawner {
    client: reqwest::Client,
    control_port: u16,
}

impl RemoteSpawner {
    pub fn new(control_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()?;
        Ok(Self { client, control_port })
    }

    pub async fn dispatch(&self, node_ip: &str, envelope: &DispatchEnvelope) -> Result<DispatchResponse> {
        let url = format!(
            "http://{}:{}/v1/internal/namespace/spawn",
            node_ip, self.control_port
        );
        let response = self
            .client
            .post(&url)
            .header(INTERNAL_AUTH_HEADER, INTERNAL_AUTH_VALUE)
            .json(envelope)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProvisionError::ServiceSpawnFailed {
                service: envelope.action.as_str().to_string(),
                node_id: envelope.node_id.clone(),
                reason: format!("remote returned HTTP {}", response.status()),
            });
        }

        let body: DispatchResponse = response.json().await?;
        if !body.success {
            return Err(ProvisionError::ServiceSpawnFailed {
                service: envelope.action.as_str().to_string(),
                node_id: envelope.node_id.clone(),
                reason: body.error.unwrap_or_else(|| "unknown remote error".to_string()),
            });
        }
        Ok(body)
    }
}

/// Routes each spawn/stop to the local spawner (if the target is this host)
/// or the remote spawner otherwise.
pub struct ServiceDispatcher {
    self_node_id: String,
    local: LocalSpawner,
    remote: RemoteSpawner,
}

impl ServiceDispatcher {
    pub fn new(self_node_id: String, local: LocalSpawner, remote: RemoteSpawner) -> Self {
        Self { self_node_id, local, remote }
    }

    pub fn is_local(&self, target_node_id: &str) -> bool {
        target_node_id == self.self_node_id
    }

    pub fn local(&self) -> &LocalSpawner {
        &self.local
    }

    pub async fn dispatch_remote(
        &self,
        node_ip: &str,
        envelope: DispatchEnvelope,
    ) -> Result<DispatchResponse> {
        self.remote.dispatch(node_ip, &envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// A tiny shell script that ignores whatever CLI flags are appended to
    /// it and just sleeps, standing in for a real service binary.
    fn long_running_stub() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\nexec sleep 30").unwrap();
        let mut perms = file.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o755);
        file.as_file().set_permissions(perms).unwrap();
        file
    }

    #[tokio::test]
    async fn local_sql_spawn_and_stop_is_tracked() {
        let stub = long_running_stub();
        let path = stub.path().to_string_lossy().to_string();
        let spawner = LocalSpawner::new(
            std::env::temp_dir().to_string_lossy().to_string(),
            path.clone(),
            path,
            None,
        );
        let pid = spawner
            .spawn_sql("acme", "node-1", 10000, 10001, "127.0.0.1", "127.0.0.1", &[], true)
            .await
            .unwrap();
        assert!(pid > 0);
        spawner.stop_instance("acme", "node-1", "sql").await.unwrap();
    }

    #[tokio::test]
    async fn gateway_spawn_without_binary_is_missing_not_panicking() {
        let stub = long_running_stub();
        let path = stub.path().to_string_lossy().to_string();
        let spawner = LocalSpawner::new(
            std::env::temp_dir().to_string_lossy().to_string(),
            path.clone(),
            path,
            None,
        );
        let err = spawner
            .spawn_gateway("acme", "node-1", 10004, &[], "127.0.0.1:10000")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::GatewayBinaryMissing { .. }));
    }

    #[test]
    fn dispatch_envelope_serializes_action_as_kebab_case() {
        let envelope = DispatchEnvelope {
            action: DispatchAction::SpawnSql,
            namespace: "acme".to_string(),
            node_id: "node-1".to_string(),
            config: HashMap::new(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["action"], "spawn-sql");
    }
}
