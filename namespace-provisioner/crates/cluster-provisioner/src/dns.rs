//! DNS record management. Generalized from the teacher's
//! `domain_resolver.rs` registry-of-records-behind-a-store shape, from
//! http:cg/rootzk protocol records down to plain A records over a
//! namespace-tagged subdomain.

use tracing::warn;

use crate::error::Result;
use crate::models::{DnsRecord, DnsRecordType};
use crate::state_store::StateStore;

const TTL_SECONDS: u32 = 60;

pub struct DnsRecordManager {
    store: StateStore,
    base_domain: String,
}

impl DnsRecordManager {
    pub fn new(store: StateStore, base_domain: String) -> Self {
        Self { store, base_domain }
    }

    fn primary_fqdn(&self, namespace: &str) -> String {
        format!("ns-{}.{}.", namespace, self.base_domain)
    }

    fn wildcard_fqdn(&self, namespace: &str) -> String {
        format!("*.ns-{}.{}.", namespace, self.base_domain)
    }

    /// Deletes any existing records tagged for this namespace, then inserts
    /// one A record per node IP plus a wildcard A record covering
    /// per-deployment subdomains. Wildcard failures are warnings; primary
    /// FQDN failures abort the step (propagated to the caller).
    pub async fn create_namespace_records(
        &self,
        namespace: &str,
        node_ips: &[String],
        created_by: &str,
    ) -> Result<Vec<DnsRecord>> {
        self.store.delete_dns_records_for_namespace(namespace).await?;

        let mut created = Vec::with_capacity(node_ips.len());
        let primary = self.primary_fqdn(namespace);
        for ip in node_ips {
            let record = self
                .store
                .upsert_dns_record(&primary, DnsRecordType::A, ip, TTL_SECONDS, namespace, created_by)
                .await?;
            created.push(record);
        }

        let wildcard = self.wildcard_fqdn(namespace);
        for ip in node_ips {
            match self
                .store
                .upsert_dns_record(&wildcard, DnsRecordType::A, ip, TTL_SECONDS, namespace, created_by)
                .await
            {
                Ok(record) => created.push(record),
                Err(e) => warn!(namespace, %wildcard, error = %e, "wildcard DNS record failed, continuing"),
            }
        }

        Ok(created)
    }

    pub async fn delete_namespace_records(&self, namespace: &str) -> Result<()> {
        self.store.delete_dns_records_for_namespace(namespace).await
    }

    pub async fn disable_namespace_record(&self, record_id: &str) -> Result<()> {
        self.store.set_dns_record_active(record_id, false).await
    }

    pub async fn enable_namespace_record(&self, record_id: &str) -> Result<()> {
        self.store.set_dns_record_active(record_id, true).await
    }

    pub async fn list_namespace_records(&self, namespace: &str) -> Result<Vec<DnsRecord>> {
        self.store.list_dns_records_for_namespace(namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> DnsRecordManager {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        DnsRecordManager::new(store, "devnet-orama.network".to_string())
    }

    #[tokio::test]
    async fn create_namespace_records_writes_primary_and_wildcard() {
        let dns = manager().await;
        let records = dns
            .create_namespace_records("acme", &["10.0.0.1".to_string(), "10.0.0.2".to_string()], "api")
            .await
            .unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().any(|r| r.fqdn == "ns-acme.devnet-orama.network."));
        assert!(records.iter().any(|r| r.fqdn == "*.ns-acme.devnet-orama.network."));
    }

    #[tokio::test]
    async fn create_namespace_records_is_idempotent_on_record_set() {
        let dns = manager().await;
        let ips = vec!["10.0.0.1".to_string()];
        dns.create_namespace_records("acme", &ips, "api").await.unwrap();
        dns.create_namespace_records("acme", &ips, "api").await.unwrap();
        let records = dns.list_namespace_records("acme").await.unwrap();
        // One primary + one wildcard, not duplicated by the second call.
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn delete_namespace_records_removes_all_tagged_rows() {
        let dns = manager().await;
        dns.create_namespace_records("acme", &["10.0.0.1".to_string()], "api")
            .await
            .unwrap();
        dns.delete_namespace_records("acme").await.unwrap();
        assert!(dns.list_namespace_records("acme").await.unwrap().is_empty());
    }
}
