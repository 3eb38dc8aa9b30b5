//! Contiguous port-block allocation. Grounded on the teacher's
//! `PortManager`/`port_registry: DashMap<u16, PortAllocation>` shape
//! (`enc-cluster-manager`'s daemon-tree variant), generalized from a single
//! global counter into per-scope contiguous 5-port blocks with
//! contention-retry against the DB's UNIQUE constraint.

use std::time::Duration;

use uuid::Uuid;

use crate::error::{ProvisionError, Result};
use crate::models::PortBlock;
use crate::state_store::StateStore;

pub const RANGE_START: u16 = 10000;
pub const RANGE_END: u16 = 10099;
const MAX_RETRIES: u32 = 10;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BLOCKS_PER_SCOPE: usize = 20;

pub struct PortAllocator {
    store: StateStore,
}

impl PortAllocator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub async fn allocate_port_block(&self, node_id: &str, cluster_id: &str) -> Result<PortBlock> {
        if let Some(existing) = self.existing_block(node_id, cluster_id).await? {
            return Ok(existing);
        }

        let scope_node_ids = self.allocation_scope(node_id).await?;
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 0..MAX_RETRIES {
            let mut used_starts = Vec::new();
            for scope_node in &scope_node_ids {
                used_starts.extend(
                    self.store
                        .allocated_ports_for_node(scope_node)
                        .await?
                        .into_iter()
                        .map(|(start, _)| start),
                );
            }

            if used_starts.len() >= MAX_BLOCKS_PER_SCOPE {
                return Err(ProvisionError::NodeAtCapacity {
                    node_id: node_id.to_string(),
                });
            }

            let chosen = match Self::smallest_free_start(&used_starts) {
                Some(s) => s,
                None => {
                    return Err(ProvisionError::PortsExhausted {
                        size: PortBlock::PORTS_PER_BLOCK,
                        start: RANGE_START,
                        end: RANGE_END,
                    })
                }
            };

            let block = PortBlock {
                id: Uuid::new_v4().to_string(),
                node_id: node_id.to_string(),
                cluster_id: cluster_id.to_string(),
                port_start: chosen,
                port_end: chosen + PortBlock::PORTS_PER_BLOCK - 1,
            };

            match self.store.insert_port_block(&block).await {
                Ok(()) => return Ok(block),
                Err(ProvisionError::Storage(e)) if is_unique_violation(&e) => {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProvisionError::AllocationConflict {
            node_id: node_id.to_string(),
            retries: MAX_RETRIES,
        })
    }

    pub async fn deallocate_port_block(&self, cluster_id: &str, _node_id: &str) -> Result<()> {
        // (cluster_id, node_id) is unique per cluster (invariant 2), so a
        // cluster-scoped delete is equivalent to a point delete here.
        self.store.delete_port_blocks_for_cluster(cluster_id).await
    }

    pub async fn deallocate_all_port_blocks(&self, cluster_id: &str) -> Result<()> {
        self.store.delete_port_blocks_for_cluster(cluster_id).await
    }

    async fn existing_block(&self, node_id: &str, cluster_id: &str) -> Result<Option<PortBlock>> {
        self.store.find_port_block(node_id, cluster_id).await
    }

    async fn allocation_scope(&self, node_id: &str) -> Result<Vec<String>> {
        let registry = self.store.list_registry_nodes().await?;
        let target_ip = registry
            .iter()
            .find(|n| n.node_id == node_id)
            .map(|n| n.ip.clone());

        match target_ip {
            Some(ip) => {
                let co_located: Vec<String> = registry
                    .iter()
                    .filter(|n| n.ip == ip)
                    .map(|n| n.node_id.clone())
                    .collect();
                if co_located.len() > 1 {
                    Ok(co_located)
                } else {
                    Ok(vec![node_id.to_string()])
                }
            }
            None => Ok(vec![node_id.to_string()]),
        }
    }

    fn smallest_free_start(used_starts: &[u16]) -> Option<u16> {
        let mut s = RANGE_START;
        while s <= RANGE_END - PortBlock::PORTS_PER_BLOCK + 1 {
            if !used_starts.contains(&s) {
                return Some(s);
            }
            s += PortBlock::PORTS_PER_BLOCK;
        }
        None
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_free_start_skips_used_blocks() {
        let used = vec![10000, 10005, 10015];
        assert_eq!(PortAllocator::smallest_free_start(&used), Some(10010));
    }

    #[test]
    fn smallest_free_start_exhausted_returns_none() {
        let used: Vec<u16> = (0..20).map(|i| RANGE_START + i * 5).collect();
        assert_eq!(PortAllocator::smallest_free_start(&used), None);
    }

    #[tokio::test]
    async fn allocate_is_idempotent() {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        let cluster = store.create_cluster("ns-pa", "acme", 3, 3, 2, "api").await.unwrap();
        let allocator = PortAllocator::new(store);
        let b1 = allocator.allocate_port_block("node-1", &cluster.id).await.unwrap();
        let b2 = allocator.allocate_port_block("node-1", &cluster.id).await.unwrap();
        assert_eq!(b1.id, b2.id);
        assert_eq!(b1.port_start, 10000);
    }

    #[tokio::test]
    async fn port_block_derives_five_contiguous_ports() {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        let cluster = store.create_cluster("ns-pb", "acme", 3, 3, 2, "api").await.unwrap();
        let allocator = PortAllocator::new(store);
        let block = allocator.allocate_port_block("node-1", &cluster.id).await.unwrap();
        assert_eq!(block.port_end, block.port_start + 4);
        assert_eq!(block.sql_http_port(), block.port_start);
        assert_eq!(block.gateway_http_port(), block.port_start + 4);
    }
}
