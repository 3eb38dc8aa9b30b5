//! Persistence layer. Wraps a `sqlx::SqlitePool` the way
//! `metanode-core/receipts/src/storage.rs` wraps its pool: a struct holding
//! the pool plus an `initialize_schema`-style constructor, everything else
//! expressed as parametrized queries returning typed rows.

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{ProvisionError, Result};
use crate::models::{
    Cluster, ClusterEvent, ClusterNode, ClusterStatus, DnsRecord, DnsRecordType, NodeRole,
    PortBlock, RegistryNode, ServiceStatus,
};

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS namespace_clusters (
                id TEXT PRIMARY KEY,
                namespace_id TEXT NOT NULL UNIQUE,
                namespace_name TEXT NOT NULL,
                status TEXT NOT NULL,
                rqlite_node_count INTEGER NOT NULL,
                cache_node_count INTEGER NOT NULL,
                gateway_node_count INTEGER NOT NULL,
                provisioned_by TEXT NOT NULL,
                provisioned_at TEXT NOT NULL,
                ready_at TEXT,
                last_health_check TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS namespace_cluster_nodes (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL REFERENCES namespace_clusters(id),
                node_id TEXT NOT NULL,
                role TEXT NOT NULL,
                sql_http_port INTEGER,
                sql_raft_port INTEGER,
                cache_http_port INTEGER,
                cache_memberlist_port INTEGER,
                gateway_http_port INTEGER,
                status TEXT NOT NULL,
                process_pid INTEGER,
                last_heartbeat TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(cluster_id, role, node_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS namespace_port_allocations (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                cluster_id TEXT NOT NULL REFERENCES namespace_clusters(id),
                port_start INTEGER NOT NULL,
                port_end INTEGER NOT NULL,
                UNIQUE(node_id, port_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS namespace_cluster_events (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL REFERENCES namespace_clusters(id),
                event_type TEXT NOT NULL,
                node_id TEXT,
                message TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                seq INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dns_records (
                id TEXT PRIMARY KEY,
                fqdn TEXT NOT NULL,
                record_type TEXT NOT NULL,
                value TEXT NOT NULL,
                ttl INTEGER NOT NULL,
                namespace TEXT NOT NULL,
                created_by TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(fqdn, record_type, value)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // [SUPPLEMENT] read-only registry this core queries but does not own.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                status TEXT NOT NULL,
                deployment_count INTEGER NOT NULL DEFAULT 0,
                allocated_ports INTEGER NOT NULL DEFAULT 0,
                used_memory_mb INTEGER NOT NULL DEFAULT 0,
                used_cpu_percent INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- clusters ----------------------------------------------------

    pub async fn create_cluster(
        &self,
        namespace_id: &str,
        namespace_name: &str,
        rqlite_node_count: u32,
        cache_node_count: u32,
        gateway_node_count: u32,
        provisioned_by: &str,
    ) -> Result<Cluster> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let existing = sqlx::query("SELECT id FROM namespace_clusters WHERE namespace_id = ?")
            .bind(namespace_id)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(ProvisionError::ClusterAlreadyExists(namespace_id.to_string()));
        }
        sqlx::query(
            r#"
            INSERT INTO namespace_clusters
                (id, namespace_id, namespace_name, status, rqlite_node_count,
                 cache_node_count, gateway_node_count, provisioned_by,
                 provisioned_at, retry_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(namespace_id)
        .bind(namespace_name)
        .bind(ClusterStatus::Provisioning.as_str())
        .bind(rqlite_node_count)
        .bind(cache_node_count)
        .bind(gateway_node_count)
        .bind(provisioned_by)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_cluster(&id).await
    }

    pub async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        let row = sqlx::query("SELECT * FROM namespace_clusters WHERE id = ?")
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ProvisionError::ClusterNotFound(cluster_id.to_string()))?;
        row_to_cluster(&row)
    }

    pub async fn get_cluster_by_namespace(&self, namespace_id: &str) -> Result<Option<Cluster>> {
        let row = sqlx::query("SELECT * FROM namespace_clusters WHERE namespace_id = ?")
            .bind(namespace_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_cluster).transpose()
    }

    /// Rejects illegal transitions per spec §4.1's state machine rather than
    /// writing any status unconditionally: "Any other transition is a bug;
    /// implementations MUST reject it and emit no event." Callers that
    /// propagate this error via `?` (rather than swallowing it) naturally
    /// skip the event they would otherwise record after a successful write.
    pub async fn set_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let current = self.get_cluster(cluster_id).await?;
        if !current.status.can_transition_to(status) {
            return Err(ProvisionError::InvalidClusterStatus {
                from: current.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        let ready_at = if status == ClusterStatus::Ready {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        sqlx::query(
            r#"
            UPDATE namespace_clusters
            SET status = ?, error_message = ?,
                ready_at = COALESCE(?, ready_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(ready_at)
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_retry_count(&self, cluster_id: &str) -> Result<()> {
        sqlx::query("UPDATE namespace_clusters SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_health_check(&self, cluster_id: &str) -> Result<()> {
        sqlx::query("UPDATE namespace_clusters SET last_health_check = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_cluster(&self, cluster_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM namespace_cluster_nodes WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM namespace_port_allocations WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM namespace_cluster_events WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM namespace_clusters WHERE id = ?")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Part of the spec-adopted resolution: a `failed` cluster row is
    /// replaced, not reused, the next time its namespace is checked.
    pub async fn delete_if_failed(&self, namespace_id: &str) -> Result<bool> {
        if let Some(cluster) = self.get_cluster_by_namespace(namespace_id).await? {
            if cluster.status == ClusterStatus::Failed {
                self.delete_cluster(&cluster.id).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn stale_provisioning_clusters(&self, older_than_secs: i64) -> Result<Vec<Cluster>> {
        let rows = sqlx::query(
            "SELECT * FROM namespace_clusters WHERE status = ? AND provisioned_at < ?",
        )
        .bind(ClusterStatus::Provisioning.as_str())
        .bind((Utc::now() - chrono::Duration::seconds(older_than_secs)).to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_cluster).collect()
    }

    // ---- cluster nodes -------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn add_cluster_node(
        &self,
        cluster_id: &str,
        node_id: &str,
        role: NodeRole,
        ports: &PortBlock,
    ) -> Result<ClusterNode> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO namespace_cluster_nodes
                (id, cluster_id, node_id, role, sql_http_port, sql_raft_port,
                 cache_http_port, cache_memberlist_port, gateway_http_port,
                 status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(cluster_id)
        .bind(node_id)
        .bind(role.as_str())
        .bind(ports.sql_http_port())
        .bind(ports.sql_raft_port())
        .bind(ports.cache_http_port())
        .bind(ports.cache_memberlist_port())
        .bind(ports.gateway_http_port())
        .bind(ServiceStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        self.get_cluster_node(&id).await
    }

    pub async fn get_cluster_node(&self, id: &str) -> Result<ClusterNode> {
        let row = sqlx::query("SELECT * FROM namespace_cluster_nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ProvisionError::Internal(format!("cluster node {id} not found")))?;
        row_to_cluster_node(&row)
    }

    pub async fn list_cluster_nodes(&self, cluster_id: &str) -> Result<Vec<ClusterNode>> {
        let rows = sqlx::query("SELECT * FROM namespace_cluster_nodes WHERE cluster_id = ?")
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_cluster_node).collect()
    }

    pub async fn set_node_status(
        &self,
        id: &str,
        status: ServiceStatus,
        process_pid: Option<u32>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE namespace_cluster_nodes
            SET status = ?, process_pid = COALESCE(?, process_pid),
                error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(process_pid)
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_cluster_nodes_for_cluster(&self, cluster_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM namespace_cluster_nodes WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_node_heartbeat(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE namespace_cluster_nodes SET last_heartbeat = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- port allocations ----------------------------------------------

    pub async fn allocated_ports_for_node(&self, node_id: &str) -> Result<Vec<(u16, u16)>> {
        let rows =
            sqlx::query("SELECT port_start, port_end FROM namespace_port_allocations WHERE node_id = ?")
                .bind(node_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>("port_start") as u16, r.get::<i64, _>("port_end") as u16))
            .collect())
    }

    pub async fn find_port_block(&self, node_id: &str, cluster_id: &str) -> Result<Option<PortBlock>> {
        let row = sqlx::query(
            "SELECT * FROM namespace_port_allocations WHERE node_id = ? AND cluster_id = ?",
        )
        .bind(node_id)
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(|r| {
                Ok(PortBlock {
                    id: r.get("id"),
                    node_id: r.get("node_id"),
                    cluster_id: r.get("cluster_id"),
                    port_start: r.get::<i64, _>("port_start") as u16,
                    port_end: r.get::<i64, _>("port_end") as u16,
                })
            })
            .transpose()
    }

    pub async fn insert_port_block(&self, block: &PortBlock) -> Result<()> {
        sqlx::query(
            "INSERT INTO namespace_port_allocations (id, node_id, cluster_id, port_start, port_end) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&block.id)
        .bind(&block.node_id)
        .bind(&block.cluster_id)
        .bind(block.port_start)
        .bind(block.port_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_port_blocks_for_cluster(&self, cluster_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM namespace_port_allocations WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- events ---------------------------------------------------------

    pub async fn record_event(
        &self,
        cluster_id: &str,
        event_type: &str,
        node_id: Option<&str>,
        message: &str,
        metadata: serde_json::Value,
    ) -> Result<ClusterEvent> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM namespace_cluster_events WHERE cluster_id = ?",
        )
        .bind(cluster_id)
        .fetch_one(&self.pool)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO namespace_cluster_events
                (id, cluster_id, event_type, node_id, message, metadata, created_at, seq)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(cluster_id)
        .bind(event_type)
        .bind(node_id)
        .bind(message)
        .bind(metadata.to_string())
        .bind(now.to_rfc3339())
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(ClusterEvent {
            id,
            cluster_id: cluster_id.to_string(),
            event_type: event_type.to_string(),
            node_id: node_id.map(String::from),
            message: message.to_string(),
            metadata,
            created_at: now,
            seq,
        })
    }

    pub async fn list_events(&self, cluster_id: &str) -> Result<Vec<ClusterEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM namespace_cluster_events WHERE cluster_id = ? ORDER BY created_at, seq",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let metadata_raw: String = r.get("metadata");
                Ok(ClusterEvent {
                    id: r.get("id"),
                    cluster_id: r.get("cluster_id"),
                    event_type: r.get("event_type"),
                    node_id: r.get("node_id"),
                    message: r.get("message"),
                    metadata: serde_json::from_str(&metadata_raw)
                        .unwrap_or(serde_json::Value::Null),
                    created_at: parse_ts(r.get("created_at"))?,
                    seq: r.get("seq"),
                })
            })
            .collect()
    }

    // ---- node registry (read-only) --------------------------------------

    pub async fn list_registry_nodes(&self) -> Result<Vec<RegistryNode>> {
        let rows = sqlx::query_as::<_, RegistryNode>("SELECT * FROM nodes WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Seeds a row in the external node registry this core only ever reads
    /// in production. Exists purely so tests can exercise `NodeSelector` and
    /// `ClusterManager` against a populated registry without standing up the
    /// real registry owner.
    #[cfg(test)]
    pub(crate) async fn seed_registry_node(&self, node_id: &str, ip: &str, last_seen: chrono::DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (node_id, ip, last_seen, status, deployment_count, allocated_ports, used_memory_mb, used_cpu_percent)
            VALUES (?, ?, ?, 'active', 0, 0, 0, 0)
            "#,
        )
        .bind(node_id)
        .bind(ip)
        .bind(last_seen.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unfiltered by `status`, unlike [`Self::list_registry_nodes`]: used to
    /// resolve a peer's IP for a best-effort remote stop during deprovision,
    /// where the node may since have dropped out of the "active" set.
    pub async fn find_registry_node_ip(&self, node_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT ip FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("ip")))
    }

    pub async fn namespace_instance_count(&self, node_id: &str) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT cluster_id) FROM namespace_cluster_nodes WHERE node_id = ?",
        )
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    // ---- DNS --------------------------------------------------------------

    pub async fn upsert_dns_record(
        &self,
        fqdn: &str,
        record_type: DnsRecordType,
        value: &str,
        ttl: u32,
        namespace: &str,
        created_by: &str,
    ) -> Result<DnsRecord> {
        let existing = sqlx::query(
            "SELECT id FROM dns_records WHERE fqdn = ? AND record_type = ? AND value = ?",
        )
        .bind(fqdn)
        .bind(match record_type {
            DnsRecordType::A => "A",
        })
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        let now = Utc::now();
        let id = if let Some(row) = existing {
            let id: String = row.get("id");
            sqlx::query(
                "UPDATE dns_records SET value = ?, ttl = ?, is_active = 1, updated_at = ? WHERE id = ?",
            )
            .bind(value)
            .bind(ttl)
            .bind(now.to_rfc3339())
            .bind(&id)
            .execute(&self.pool)
            .await?;
            id
        } else {
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO dns_records
                    (id, fqdn, record_type, value, ttl, namespace, created_by,
                     is_active, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(fqdn)
            .bind("A")
            .bind(value)
            .bind(ttl)
            .bind(namespace)
            .bind(created_by)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            id
        };
        self.get_dns_record(&id).await
    }

    pub async fn get_dns_record(&self, id: &str) -> Result<DnsRecord> {
        let row = sqlx::query("SELECT * FROM dns_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ProvisionError::Internal(format!("dns record {id} not found")))?;
        row_to_dns_record(&row)
    }

    pub async fn list_dns_records_for_namespace(&self, namespace: &str) -> Result<Vec<DnsRecord>> {
        let rows = sqlx::query("SELECT * FROM dns_records WHERE namespace = ?")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_dns_record).collect()
    }

    pub async fn set_dns_record_active(&self, id: &str, active: bool) -> Result<()> {
        sqlx::query("UPDATE dns_records SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_dns_records_for_namespace(&self, namespace: &str) -> Result<()> {
        sqlx::query("DELETE FROM dns_records WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_ts(raw: String) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ProvisionError::Internal(format!("bad timestamp {raw}: {e}")))
}

fn row_to_cluster(row: &sqlx::sqlite::SqliteRow) -> Result<Cluster> {
    let status_raw: String = row.get("status");
    Ok(Cluster {
        id: row.get("id"),
        namespace_id: row.get("namespace_id"),
        namespace_name: row.get("namespace_name"),
        status: ClusterStatus::parse(&status_raw)
            .ok_or_else(|| ProvisionError::Internal(format!("bad cluster status {status_raw}")))?,
        rqlite_node_count: row.get::<i64, _>("rqlite_node_count") as u32,
        cache_node_count: row.get::<i64, _>("cache_node_count") as u32,
        gateway_node_count: row.get::<i64, _>("gateway_node_count") as u32,
        provisioned_by: row.get("provisioned_by"),
        provisioned_at: parse_ts(row.get("provisioned_at"))?,
        ready_at: row
            .get::<Option<String>, _>("ready_at")
            .map(parse_ts)
            .transpose()?,
        last_health_check: row
            .get::<Option<String>, _>("last_health_check")
            .map(parse_ts)
            .transpose()?,
        error_message: row.get("error_message"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
    })
}

fn row_to_cluster_node(row: &sqlx::sqlite::SqliteRow) -> Result<ClusterNode> {
    let role_raw: String = row.get("role");
    let status_raw: String = row.get("status");
    Ok(ClusterNode {
        id: row.get("id"),
        cluster_id: row.get("cluster_id"),
        node_id: row.get("node_id"),
        role: NodeRole::parse(&role_raw)
            .ok_or_else(|| ProvisionError::Internal(format!("bad node role {role_raw}")))?,
        sql_http_port: row.get::<Option<i64>, _>("sql_http_port").map(|p| p as u16),
        sql_raft_port: row.get::<Option<i64>, _>("sql_raft_port").map(|p| p as u16),
        cache_http_port: row.get::<Option<i64>, _>("cache_http_port").map(|p| p as u16),
        cache_memberlist_port: row
            .get::<Option<i64>, _>("cache_memberlist_port")
            .map(|p| p as u16),
        gateway_http_port: row
            .get::<Option<i64>, _>("gateway_http_port")
            .map(|p| p as u16),
        status: ServiceStatus::parse(&status_raw)
            .ok_or_else(|| ProvisionError::Internal(format!("bad node status {status_raw}")))?,
        process_pid: row.get::<Option<i64>, _>("process_pid").map(|p| p as u32),
        last_heartbeat: row
            .get::<Option<String>, _>("last_heartbeat")
            .map(parse_ts)
            .transpose()?,
        error_message: row.get("error_message"),
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

fn row_to_dns_record(row: &sqlx::sqlite::SqliteRow) -> Result<DnsRecord> {
    Ok(DnsRecord {
        id: row.get("id"),
        fqdn: row.get("fqdn"),
        record_type: DnsRecordType::A,
        value: row.get("value"),
        ttl: row.get::<i64, _>("ttl") as u32,
        namespace: row.get("namespace"),
        created_by: row.get("created_by"),
        is_active: row.get("is_active"),
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeRole;

    async fn test_store() -> StateStore {
        StateStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_cluster_round_trips() {
        let store = test_store().await;
        let cluster = store
            .create_cluster("ns-1", "acme", 3, 3, 2, "api")
            .await
            .unwrap();
        assert_eq!(cluster.status, ClusterStatus::Provisioning);

        let fetched = store.get_cluster(&cluster.id).await.unwrap();
        assert_eq!(fetched.namespace_id, "ns-1");
    }

    #[tokio::test]
    async fn duplicate_namespace_is_rejected() {
        let store = test_store().await;
        store.create_cluster("ns-2", "acme", 3, 3, 2, "api").await.unwrap();
        let err = store
            .create_cluster("ns-2", "acme", 3, 3, 2, "api")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ClusterAlreadyExists(_)));
    }

    #[tokio::test]
    async fn event_sequence_increments_per_cluster() {
        let store = test_store().await;
        let cluster = store.create_cluster("ns-3", "acme", 3, 3, 2, "api").await.unwrap();
        let e1 = store
            .record_event(&cluster.id, "provisioning_started", None, "start", serde_json::json!({}))
            .await
            .unwrap();
        let e2 = store
            .record_event(&cluster.id, "node_selected", None, "picked", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
    }

    #[tokio::test]
    async fn failed_cluster_deletes_on_check() {
        let store = test_store().await;
        let cluster = store.create_cluster("ns-4", "acme", 3, 3, 2, "api").await.unwrap();
        store
            .set_cluster_status(&cluster.id, ClusterStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let deleted = store.delete_if_failed("ns-4").await.unwrap();
        assert!(deleted);
        assert!(store.get_cluster_by_namespace("ns-4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dns_upsert_is_idempotent() {
        let store = test_store().await;
        let r1 = store
            .upsert_dns_record("acme.svc.local", DnsRecordType::A, "10.0.0.1", 60, "acme", "api")
            .await
            .unwrap();
        let r2 = store
            .upsert_dns_record("acme.svc.local", DnsRecordType::A, "10.0.0.1", 60, "acme", "api")
            .await
            .unwrap();
        // Same (fqdn, record_type, value) triple: second call updates the
        // existing row in place rather than inserting a duplicate.
        assert_eq!(r1.id, r2.id);
        let all = sqlx::query("SELECT COUNT(*) as c FROM dns_records WHERE fqdn = ?")
            .bind("acme.svc.local")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let count: i64 = all.get("c");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn cluster_node_insert_honors_port_block() {
        let store = test_store().await;
        let cluster = store.create_cluster("ns-5", "acme", 3, 3, 2, "api").await.unwrap();
        let block = PortBlock {
            id: Uuid::new_v4().to_string(),
            node_id: "node-a".into(),
            cluster_id: cluster.id.clone(),
            port_start: 10000,
            port_end: 10004,
        };
        let node = store
            .add_cluster_node(&cluster.id, "node-a", NodeRole::SqlLeader, &block)
            .await
            .unwrap();
        assert_eq!(node.sql_http_port, Some(10000));
        assert_eq!(node.gateway_http_port, Some(10004));
    }
}
