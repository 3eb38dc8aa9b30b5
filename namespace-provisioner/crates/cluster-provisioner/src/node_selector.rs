//! Weighted capacity scoring, generalized from the teacher's
//! `ClusterMetrics`/`NodeCapabilities` snapshot shape into a ranking used to
//! pick provisioning targets rather than just report usage.

use chrono::Utc;

use crate::error::{ProvisionError, Result};
use crate::models::NodeCapacity;
use crate::state_store::StateStore;

const MAX_DEPLOYMENTS: f64 = 100.0;
const MAX_PORTS: f64 = 9900.0;
const MAX_MEMORY_MB: f64 = 8192.0;
const MAX_CPU_PERCENT: f64 = 400.0;
const MAX_NAMESPACE_INSTANCES: f64 = 20.0;

const WEIGHT_DEPLOYMENTS: f64 = 0.30;
const WEIGHT_PORTS: f64 = 0.15;
const WEIGHT_MEMORY: f64 = 0.15;
const WEIGHT_CPU: f64 = 0.15;
const WEIGHT_NAMESPACE_INSTANCES: f64 = 0.25;

const REGISTRY_FRESHNESS_SECS: i64 = 120;
const MAX_NS_PER_NODE: u32 = 20;

pub struct NodeSelector {
    store: StateStore,
}

impl NodeSelector {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Ranks eligible nodes and returns the top `n`, highest score first.
    pub async fn select_nodes_for_cluster(&self, n: u32) -> Result<Vec<NodeCapacity>> {
        let registry = self.store.list_registry_nodes().await?;
        let now = Utc::now();

        let mut candidates = Vec::with_capacity(registry.len());
        for node in registry {
            let age = now.signed_duration_since(node.last_seen);
            if age.num_seconds() > REGISTRY_FRESHNESS_SECS {
                continue;
            }
            let namespace_instance_count = self.store.namespace_instance_count(&node.node_id).await?;
            let available_slots = MAX_NS_PER_NODE.saturating_sub(namespace_instance_count);
            if available_slots == 0 {
                continue;
            }
            let score = Self::score(
                node.deployment_count as u32,
                node.allocated_ports as u32,
                node.used_memory_mb as u32,
                node.used_cpu_percent as u32,
                namespace_instance_count,
            );
            candidates.push(NodeCapacity {
                node_id: node.node_id,
                ip: node.ip,
                deployment_count: node.deployment_count as u32,
                allocated_ports: node.allocated_ports as u32,
                used_memory_mb: node.used_memory_mb as u32,
                used_cpu_percent: node.used_cpu_percent as u32,
                namespace_instance_count,
                score,
            });
        }

        // Stable sort: registry insertion order (from `list_registry_nodes`,
        // which orders by the DB's rowid) is preserved among equal scores.
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        if (candidates.len() as u32) < n {
            return Err(ProvisionError::InsufficientNodes {
                needed: n,
                available: candidates.len() as u32,
            });
        }

        candidates.truncate(n as usize);
        Ok(candidates)
    }

    fn score(
        deployment_count: u32,
        allocated_ports: u32,
        used_memory_mb: u32,
        used_cpu_percent: u32,
        namespace_instance_count: u32,
    ) -> f64 {
        let dim = |used: f64, max: f64| (1.0 - used / max).max(0.0);
        WEIGHT_DEPLOYMENTS * dim(deployment_count as f64, MAX_DEPLOYMENTS)
            + WEIGHT_PORTS * dim(allocated_ports as f64, MAX_PORTS)
            + WEIGHT_MEMORY * dim(used_memory_mb as f64, MAX_MEMORY_MB)
            + WEIGHT_CPU * dim(used_cpu_percent as f64, MAX_CPU_PERCENT)
            + WEIGHT_NAMESPACE_INSTANCES * dim(namespace_instance_count as f64, MAX_NAMESPACE_INSTANCES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_node_scores_near_one() {
        let score = NodeSelector::score(0, 0, 0, 0, 0);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn saturated_node_scores_near_zero() {
        let score = NodeSelector::score(100, 9900, 8192, 400, 20);
        assert!(score.abs() < 1e-9);
    }

    #[test]
    fn over_capacity_dimension_clamps_at_zero_not_negative() {
        let score = NodeSelector::score(500, 0, 0, 0, 0);
        assert!(score >= 0.0);
    }

    #[tokio::test]
    async fn insufficient_nodes_surfaces_error() {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        let selector = NodeSelector::new(store);
        let err = selector.select_nodes_for_cluster(3).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::InsufficientNodes { needed: 3, available: 0 }
        ));
    }

    #[tokio::test]
    async fn exactly_n_eligible_nodes_returns_n_not_more() {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        for i in 0..3 {
            store
                .seed_registry_node(&format!("node-{i}"), &format!("10.0.0.{i}"), Utc::now())
                .await
                .unwrap();
        }
        let selector = NodeSelector::new(store);
        let nodes = selector.select_nodes_for_cluster(3).await.unwrap();
        assert_eq!(nodes.len(), 3);
    }

    #[tokio::test]
    async fn one_fewer_than_needed_is_insufficient() {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        for i in 0..2 {
            store
                .seed_registry_node(&format!("node-{i}"), &format!("10.0.0.{i}"), Utc::now())
                .await
                .unwrap();
        }
        let selector = NodeSelector::new(store);
        let err = selector.select_nodes_for_cluster(3).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::InsufficientNodes { needed: 3, available: 2 }
        ));
    }

    #[tokio::test]
    async fn stale_nodes_are_ignored() {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        store.seed_registry_node("fresh", "10.0.0.1", Utc::now()).await.unwrap();
        store
            .seed_registry_node("stale", "10.0.0.2", Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        let selector = NodeSelector::new(store);
        let nodes = selector.select_nodes_for_cluster(1).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "fresh");
    }
}
