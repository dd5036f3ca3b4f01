use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::provider::{DnsError, DnsProvider};
use crate::db::FleetStore;
use crate::db::entities::prelude::{DnsRecordModel, NodeModel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsSyncOutcome {
    /// The stored answer already matched, nothing was sent.
    Unchanged,
    Updated(BTreeSet<String>),
    /// The provider failed, the stored answer was left as it was.
    Failed,
    NoProvider,
}

/// Keeps a shared DNS record pointing at the active members of its node group.
pub struct DnsSynchronizer {
    store: Arc<FleetStore>,
    provider: Option<Arc<dyn DnsProvider>>,
}

impl DnsSynchronizer {
    pub fn new(store: Arc<FleetStore>, provider: Option<Arc<dyn DnsProvider>>) -> Self {
        Self { store, provider }
    }

    /// Public addresses of the active nodes sharing the record, lowercased.
    pub async fn desired_answers(&self, record_id: i32) -> BTreeSet<String> {
        self.store
            .nodes_for_record(record_id)
            .await
            .into_iter()
            .filter(|node| node.is_active)
            .filter_map(|node| node.public_ip)
            .map(|ip| ip.to_string().to_lowercase())
            .collect()
    }

    pub async fn sync_record(&self, record_id: i32) -> DnsSyncOutcome {
        let Some(record) = self.store.record(record_id).await else {
            error!(record_id = record_id, "DNS record not found.");
            return DnsSyncOutcome::Failed;
        };
        let desired = self.desired_answers(record_id).await;
        if desired == record.answers() {
            return DnsSyncOutcome::Unchanged;
        }
        let Some(provider) = &self.provider else {
            warn!(record = %record.fqdn(), "No DNS provider configured, record left as is.");
            return DnsSyncOutcome::NoProvider;
        };

        if let Err(e) = push(provider.as_ref(), &record, &desired).await {
            error!(record = %record.fqdn(), error = %e, "Failed to update DNS record.");
            return DnsSyncOutcome::Failed;
        }
        match self.store.set_record_answer(record_id, &desired).await {
            Ok(_) => {
                info!(record = %record.fqdn(), answers = ?desired, "DNS record updated.");
                DnsSyncOutcome::Updated(desired)
            }
            Err(e) => {
                error!(record = %record.fqdn(), error = %e, "Failed to store DNS answer.");
                DnsSyncOutcome::Failed
            }
        }
    }

    /// Re-syncs the records touched by a node mutation.
    ///
    /// `None` for `old` means the node was created, `None` for `new` that it
    /// was deleted. A moved node syncs both its old and its new record.
    pub async fn on_node_changed(
        &self,
        old: Option<&NodeModel>,
        new: Option<&NodeModel>,
    ) -> Vec<(i32, DnsSyncOutcome)> {
        let mut records = BTreeSet::new();
        match (old, new) {
            (Some(old), Some(new)) => {
                if old.is_active != new.is_active
                    || old.public_ip != new.public_ip
                    || old.record_id != new.record_id
                {
                    records.extend(old.record_id);
                    records.extend(new.record_id);
                }
            }
            (None, Some(node)) | (Some(node), None) => records.extend(node.record_id),
            (None, None) => {}
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for record_id in records {
            outcomes.push((record_id, self.sync_record(record_id).await));
        }
        outcomes
    }
}

async fn push(
    provider: &dyn DnsProvider,
    record: &DnsRecordModel,
    desired: &BTreeSet<String>,
) -> Result<(), DnsError> {
    let name = record.fqdn();
    let record_type = record.record_type.as_str();
    let current: BTreeSet<String> = provider
        .list_records(record_type, &name)
        .await?
        .into_iter()
        .map(|entry| entry.content.to_lowercase())
        .collect();

    let rejected = |action: &'static str, content: &str| DnsError::Rejected {
        action,
        name: name.clone(),
        reason: format!("answer {content} was not accepted"),
    };

    if current.len() == 1 && desired.len() == 1 {
        if let Some(content) = desired.iter().next() {
            if !provider.update_record(record_type, &name, content).await? {
                return Err(rejected("update", content));
            }
        }
        return Ok(());
    }
    for stale in current.difference(desired) {
        if !provider.delete_record(record_type, &name, Some(stale)).await? {
            return Err(rejected("delete", stale));
        }
    }
    for missing in desired.difference(&current) {
        if !provider.create_record(record_type, &name, missing).await? {
            return Err(rejected("create", missing));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewNode, NewRecord};
    use crate::test_support::RecordingDnsProvider;

    async fn setup(provider: Arc<RecordingDnsProvider>) -> (Arc<FleetStore>, DnsSynchronizer, i32) {
        let store = Arc::new(FleetStore::new());
        let record = store
            .insert_record(NewRecord {
                host: "vpn".to_string(),
                domain: "example.com".to_string(),
                record_type: "A".to_string(),
                answer: None,
            })
            .await
            .unwrap();
        let sync = DnsSynchronizer::new(store.clone(), Some(provider));
        (store, sync, record.id)
    }

    fn node(name: &str, ip: &str, record_id: i32, is_active: bool) -> NewNode {
        NewNode {
            name: name.to_string(),
            public_ip: Some(ip.parse().unwrap()),
            private_ip: None,
            location: None,
            is_active,
            record_id: Some(record_id),
            ip_change_webhook: None,
        }
    }

    #[tokio::test]
    async fn test_sync_pushes_active_members_once() {
        let provider = Arc::new(RecordingDnsProvider::default());
        let (store, sync, record_id) = setup(provider.clone()).await;
        store.insert_node(node("a", "1.2.3.4", record_id, true)).await.unwrap();
        store.insert_node(node("b", "5.6.7.8", record_id, true)).await.unwrap();
        store.insert_node(node("c", "9.9.9.9", record_id, false)).await.unwrap();

        let outcome = sync.sync_record(record_id).await;
        let expected: BTreeSet<String> = ["1.2.3.4", "5.6.7.8"].iter().map(|s| s.to_string()).collect();
        assert_eq!(outcome, DnsSyncOutcome::Updated(expected.clone()));
        assert_eq!(provider.answers("vpn.example.com"), expected);
        assert_eq!(store.record(record_id).await.unwrap().answers(), expected);

        // Unchanged membership: no provider traffic at all.
        let calls = provider.calls().len();
        assert_eq!(sync.sync_record(record_id).await, DnsSyncOutcome::Unchanged);
        assert_eq!(provider.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_single_answer_is_updated_in_place() {
        let provider = Arc::new(RecordingDnsProvider::default());
        let (store, sync, record_id) = setup(provider.clone()).await;
        let a = store.insert_node(node("a", "1.2.3.4", record_id, true)).await.unwrap();
        sync.sync_record(record_id).await;

        let (old, new) = store
            .update_node(a.id, node("a", "4.3.2.1", record_id, true))
            .await
            .unwrap();
        let outcomes = sync.on_node_changed(Some(&old), Some(&new)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(provider.calls().last().map(String::as_str), Some("update A vpn.example.com 4.3.2.1"));
        assert_eq!(
            provider.answers("vpn.example.com").into_iter().collect::<Vec<_>>(),
            vec!["4.3.2.1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_record_unchanged() {
        let provider = Arc::new(RecordingDnsProvider::default());
        let (store, sync, record_id) = setup(provider.clone()).await;
        store.insert_node(node("a", "1.2.3.4", record_id, true)).await.unwrap();
        provider.set_failing(true);

        assert_eq!(sync.sync_record(record_id).await, DnsSyncOutcome::Failed);
        assert_eq!(store.record(record_id).await.unwrap().answer, None);

        provider.set_failing(false);
        assert!(matches!(sync.sync_record(record_id).await, DnsSyncOutcome::Updated(_)));
    }

    #[tokio::test]
    async fn test_unrelated_node_change_does_nothing() {
        let provider = Arc::new(RecordingDnsProvider::default());
        let (store, sync, record_id) = setup(provider.clone()).await;
        let a = store.insert_node(node("a", "1.2.3.4", record_id, true)).await.unwrap();
        let mut renamed = node("renamed", "1.2.3.4", record_id, true);
        renamed.location = Some("Tokyo".to_string());
        let (old, new) = store.update_node(a.id, renamed).await.unwrap();

        assert!(sync.on_node_changed(Some(&old), Some(&new)).await.is_empty());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_without_provider_record_is_left_alone() {
        let store = Arc::new(FleetStore::new());
        let record = store
            .insert_record(NewRecord {
                host: "vpn".to_string(),
                domain: "example.com".to_string(),
                record_type: "A".to_string(),
                answer: None,
            })
            .await
            .unwrap();
        store.insert_node(node("a", "1.2.3.4", record.id, true)).await.unwrap();
        let sync = DnsSynchronizer::new(store.clone(), None);

        assert_eq!(sync.sync_record(record.id).await, DnsSyncOutcome::NoProvider);
        assert_eq!(store.record(record.id).await.unwrap().answer, None);
    }
}
