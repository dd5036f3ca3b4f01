use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::ConfigHandle;
use crate::db::entities::prelude::{AccountModel, DnsRecordModel, NodeModel, SsManagerModel, StatTarget};
use crate::db::enums::{Interface, ServerEdition};
use crate::db::models::{ManagerSettings, NewAccount, NewNode, NewRecord};
use crate::db::{AssignmentView, FleetStore};
use crate::dns::DnsSynchronizer;
use crate::error::FleetError;
use crate::reconciler::Reconciler;

/// The mutation boundary of the fleet.
///
/// Every write is validated, stored, and then pushed to the affected daemons
/// and DNS records before the call returns.
pub struct Fleet {
    store: Arc<FleetStore>,
    reconciler: Arc<Reconciler>,
    dns: Arc<DnsSynchronizer>,
    config: ConfigHandle,
}

fn account_input(account: &AccountModel) -> NewAccount {
    NewAccount {
        port: account.port,
        password: account.password.clone(),
        full_name: account.full_name.clone(),
        email: account.email.clone(),
        is_active: account.is_active,
    }
}

pub(crate) fn node_input(node: &NodeModel) -> NewNode {
    NewNode {
        name: node.name.clone(),
        public_ip: node.public_ip,
        private_ip: node.private_ip,
        location: node.location.clone(),
        is_active: node.is_active,
        record_id: node.record_id,
        ip_change_webhook: node.ip_change_webhook.clone(),
    }
}

impl Fleet {
    pub fn new(
        store: Arc<FleetStore>,
        reconciler: Arc<Reconciler>,
        dns: Arc<DnsSynchronizer>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            store,
            reconciler,
            dns,
            config,
        }
    }

    pub fn store(&self) -> &Arc<FleetStore> {
        &self.store
    }

    // Accounts

    fn check_port(&self, port: u16) -> Result<(), FleetError> {
        let config = self.config.get();
        if !config.port_range().contains(&port) {
            return Err(FleetError::PortOutOfRange {
                port,
                begin: config.port_begin,
                end: config.port_end,
            });
        }
        Ok(())
    }

    pub async fn create_account(&self, input: NewAccount) -> Result<AccountModel, FleetError> {
        self.check_port(input.port)?;
        let account = self.store.insert_account(input).await?;
        info!(account_id = account.id, port = account.port, "Account created.");
        Ok(account)
    }

    #[instrument(skip(self, input), fields(port = input.port))]
    pub async fn update_account(&self, id: i32, input: NewAccount) -> Result<AccountModel, FleetError> {
        self.check_port(input.port)?;
        let (old, new) = self.store.update_account(id, input).await?;
        self.reconciler.on_account_changed(&old, &new).await;
        Ok(new)
    }

    pub async fn set_account_active(&self, id: i32, is_active: bool) -> Result<AccountModel, FleetError> {
        let account = self
            .store
            .account(id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("account {id}")))?;
        let mut input = account_input(&account);
        input.is_active = is_active;
        self.update_account(id, input).await
    }

    pub async fn toggle_account(&self, id: i32) -> Result<AccountModel, FleetError> {
        let account = self
            .store
            .account(id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("account {id}")))?;
        self.set_account_active(id, !account.is_active).await
    }

    /// Removes the account's ports everywhere, then the account and its
    /// statistics.
    #[instrument(skip(self))]
    pub async fn delete_account(&self, id: i32) -> Result<AccountModel, FleetError> {
        for view in self.store.views_for_account(id).await {
            self.delete_assignment(view.assignment.id).await?;
        }
        let account = self.store.delete_account(id).await?;
        self.store.remove_statistics_for(StatTarget::Account(id)).await;
        info!(account_id = id, port = account.port, "Account deleted.");
        Ok(account)
    }

    /// Assigns the account to every node it is not on yet.
    pub async fn assign_all_nodes(&self, account_id: i32) -> Result<Vec<AssignmentView>, FleetError> {
        if self.store.account(account_id).await.is_none() {
            return Err(FleetError::NotFound(format!("account {account_id}")));
        }
        let mut created = Vec::new();
        for node in self.store.nodes().await {
            if self.store.assignment_for(node.id, account_id).await.is_some() {
                continue;
            }
            created.push(self.create_assignment(node.id, account_id, true).await?);
        }
        Ok(created)
    }

    // Nodes

    async fn check_node(&self, input: &NewNode, id: Option<i32>) -> Result<(), FleetError> {
        if input.public_ip.is_none() && input.record_id.is_none() {
            return Err(FleetError::AddressRequired(format!(
                "node {} needs a public IP or a DNS record",
                input.name
            )));
        }
        if let Some(record_id) = input.record_id {
            if self.store.record(record_id).await.is_none() {
                return Err(FleetError::NotFound(format!("dns record {record_id}")));
            }
        }
        let manager = match id {
            Some(id) => self.store.manager_for_node(id).await,
            None => None,
        };
        if let Some(manager) = manager {
            let interface_ip = match manager.interface {
                Interface::Localhost => true,
                Interface::Private => input.private_ip.is_some(),
                Interface::Public => input.public_ip.is_some(),
            };
            if !interface_ip {
                return Err(FleetError::MissingInterfaceIp {
                    node: input.name.clone(),
                    interface: manager.interface.to_string(),
                });
            }
            if manager.server_edition == ServerEdition::Python && input.public_ip.is_none() {
                return Err(public_address_required(&input.name));
            }
        }
        Ok(())
    }

    pub async fn create_node(&self, input: NewNode) -> Result<NodeModel, FleetError> {
        self.check_node(&input, None).await?;
        let node = self.store.insert_node(input).await?;
        info!(node = %node.name, "Node created.");
        self.dns.on_node_changed(None, Some(&node)).await;
        Ok(node)
    }

    #[instrument(skip(self, input), fields(node = %input.name))]
    pub async fn update_node(&self, id: i32, input: NewNode) -> Result<NodeModel, FleetError> {
        self.check_node(&input, Some(id)).await?;
        let (old, new) = self.store.update_node(id, input).await?;
        self.reconciler.on_node_changed(&old, &new).await;
        self.dns.on_node_changed(Some(&old), Some(&new)).await;
        Ok(new)
    }

    pub async fn set_node_active(&self, id: i32, is_active: bool) -> Result<NodeModel, FleetError> {
        let node = self
            .store
            .node(id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("node {id}")))?;
        let mut input = node_input(&node);
        input.is_active = is_active;
        self.update_node(id, input).await
    }

    pub async fn toggle_node(&self, id: i32) -> Result<NodeModel, FleetError> {
        let node = self
            .store
            .node(id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("node {id}")))?;
        self.set_node_active(id, !node.is_active).await
    }

    /// Removes the node's ports and manager, then the node itself, its
    /// statistics and its address from the shared DNS record.
    #[instrument(skip(self))]
    pub async fn delete_node(&self, id: i32) -> Result<NodeModel, FleetError> {
        for view in self.store.views_for_node(id).await {
            self.delete_assignment(view.assignment.id).await?;
        }
        self.remove_manager(id).await?;
        let node = self.store.delete_node(id).await?;
        self.store.remove_statistics_for(StatTarget::Node(id)).await;
        self.dns.on_node_changed(Some(&node), None).await;
        info!(node = %node.name, "Node deleted.");
        Ok(node)
    }

    // Assignments

    pub async fn create_assignment(
        &self,
        node_id: i32,
        account_id: i32,
        is_active: bool,
    ) -> Result<AssignmentView, FleetError> {
        let view = self.store.insert_assignment(node_id, account_id, is_active).await?;
        self.reconciler.on_assignment_created(&view).await;
        Ok(view)
    }

    pub async fn set_assignment_active(&self, id: i32, is_active: bool) -> Result<AssignmentView, FleetError> {
        let (old, new) = self.store.set_assignment_active(id, is_active).await?;
        self.reconciler.on_assignment_changed(&old, &new).await;
        Ok(new)
    }

    pub async fn toggle_assignment(&self, id: i32) -> Result<AssignmentView, FleetError> {
        let view = self
            .store
            .assignment_view(id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("assignment {id}")))?;
        self.set_assignment_active(id, !view.assignment.is_active).await
    }

    pub async fn delete_assignment(&self, id: i32) -> Result<AssignmentView, FleetError> {
        let view = self.store.delete_assignment(id).await?;
        self.reconciler.on_assignment_deleted(&view).await;
        self.store.remove_statistics_for(StatTarget::NodeAccount(id)).await;
        info!(assignment = %view, "Assignment deleted.");
        Ok(view)
    }

    // Managers

    /// Creates or reconfigures the node's manager endpoint.
    #[instrument(skip(self, settings))]
    pub async fn set_manager(&self, node_id: i32, settings: ManagerSettings) -> Result<SsManagerModel, FleetError> {
        if settings.is_server_enabled && settings.server_edition != ServerEdition::Python {
            return Err(FleetError::ServerEditionMismatch);
        }
        let node = self
            .store
            .node(node_id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("node {node_id}")))?;
        if node.ip_for_interface(settings.interface).is_none() {
            return Err(FleetError::MissingInterfaceIp {
                node: node.name.clone(),
                interface: settings.interface.to_string(),
            });
        }
        // Ports of the python edition are only confirmed by connecting to them.
        if settings.server_edition == ServerEdition::Python && node.public_ip.is_none() {
            return Err(public_address_required(&node.name));
        }
        let (old, new) = self.store.set_manager(node_id, settings).await?;
        self.reconciler.on_manager_changed(&node, old.as_ref(), &new).await;
        Ok(new)
    }

    pub async fn remove_manager(&self, node_id: i32) -> Result<Option<SsManagerModel>, FleetError> {
        let node = self
            .store
            .node(node_id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("node {node_id}")))?;
        let Some(old) = self.store.delete_manager(node_id).await else {
            return Ok(None);
        };
        warn!(node = %node.name, "Manager removed, the node's ports are no longer managed.");
        self.reconciler.on_manager_deleted(&node, &old).await;
        Ok(Some(old))
    }

    // DNS records

    pub async fn create_record(&self, input: NewRecord) -> Result<DnsRecordModel, FleetError> {
        let record = self.store.insert_record(input).await?;
        info!(record = %record.fqdn(), "DNS record created.");
        Ok(record)
    }
}

fn public_address_required(node: &str) -> FleetError {
    FleetError::MissingInterfaceIp {
        node: node.to_string(),
        interface: Interface::Public.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::prelude::Period;
    use crate::test_support::{Harness, new_account};

    fn node(name: &str, ip: Option<&str>, record_id: Option<i32>) -> NewNode {
        NewNode {
            name: name.to_string(),
            public_ip: ip.map(|ip| ip.parse().unwrap()),
            private_ip: None,
            location: None,
            is_active: true,
            record_id,
            ip_change_webhook: None,
        }
    }

    fn record() -> NewRecord {
        NewRecord {
            host: "vpn".to_string(),
            domain: "example.com".to_string(),
            record_type: "A".to_string(),
            answer: None,
        }
    }

    #[tokio::test]
    async fn test_account_port_must_be_in_range() {
        let h = Harness::new(ServerEdition::Libev).await;
        let err = h.fleet.create_account(new_account(7999)).await.unwrap_err();
        assert!(matches!(err, FleetError::PortOutOfRange { port: 7999, begin: 8000, end: 9000 }));

        let account = h.fleet.create_account(new_account(8381)).await.unwrap();
        assert!(matches!(
            h.fleet.update_account(account.id, new_account(9001)).await,
            Err(FleetError::PortOutOfRange { .. })
        ));
        assert!(matches!(
            h.fleet.create_account(new_account(8381)).await,
            Err(FleetError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_node_needs_an_address() {
        let h = Harness::new(ServerEdition::Libev).await;
        assert!(matches!(
            h.fleet.create_node(node("b", None, None)).await,
            Err(FleetError::AddressRequired(_))
        ));
        assert!(matches!(
            h.fleet.create_node(node("b", None, Some(999))).await,
            Err(FleetError::NotFound(_))
        ));
        let record = h.fleet.create_record(record()).await.unwrap();
        assert!(h.fleet.create_node(node("b", None, Some(record.id))).await.is_ok());
    }

    #[tokio::test]
    async fn test_manager_validation() {
        let h = Harness::new(ServerEdition::Libev).await;
        let enabled_on_libev = ManagerSettings {
            is_server_enabled: true,
            ..ManagerSettings::default()
        };
        assert!(matches!(
            h.fleet.set_manager(h.node.id, enabled_on_libev).await,
            Err(FleetError::ServerEditionMismatch)
        ));

        let private = ManagerSettings {
            interface: Interface::Private,
            ..ManagerSettings::default()
        };
        assert!(matches!(
            h.fleet.set_manager(h.node.id, private).await,
            Err(FleetError::MissingInterfaceIp { .. })
        ));

        // A node cannot drop the address its manager listens on.
        let b = h.fleet.create_node(node("b", Some("5.6.7.8"), None)).await.unwrap();
        let public = ManagerSettings {
            interface: Interface::Public,
            ..ManagerSettings::default()
        };
        h.fleet.set_manager(b.id, public).await.unwrap();
        let record = h.fleet.create_record(record()).await.unwrap();
        assert!(matches!(
            h.fleet.update_node(b.id, node("b", None, Some(record.id))).await,
            Err(FleetError::MissingInterfaceIp { .. })
        ));
    }

    #[tokio::test]
    async fn test_python_edition_needs_public_address() {
        let h = Harness::new(ServerEdition::Python).await;
        let python = ManagerSettings {
            server_edition: ServerEdition::Python,
            ..ManagerSettings::default()
        };

        let record = h.fleet.create_record(record()).await.unwrap();
        let c = h.fleet.create_node(node("c", None, Some(record.id))).await.unwrap();
        assert!(matches!(
            h.fleet.set_manager(c.id, python).await,
            Err(FleetError::MissingInterfaceIp { .. })
        ));
        assert!(h.store.manager_for_node(c.id).await.is_none());
        h.fleet.set_manager(c.id, ManagerSettings::default()).await.unwrap();

        // Node "a" runs the python edition and must keep its public address.
        assert!(matches!(
            h.fleet.update_node(h.node.id, node("a", None, Some(record.id))).await,
            Err(FleetError::MissingInterfaceIp { .. })
        ));

        let account = h.fleet.create_account(new_account(8381)).await.unwrap();
        h.fleet.create_assignment(h.node.id, account.id, true).await.unwrap();
        assert!(h.client().await.add(8381, "secret").await);
        h.reconciler.heartbeat().await;
        assert_eq!(h.daemon.count("add"), 1);
    }

    #[tokio::test]
    async fn test_toggles_keep_assignment_flag() {
        let h = Harness::new(ServerEdition::Libev).await;
        let account = h.fleet.create_account(new_account(8381)).await.unwrap();
        let view = h.fleet.create_assignment(h.node.id, account.id, true).await.unwrap();

        h.fleet.toggle_account(account.id).await.unwrap();
        h.fleet.toggle_node(h.node.id).await.unwrap();
        let current = h.store.assignment_view(view.assignment.id).await.unwrap();
        assert!(current.assignment.is_active);
        assert!(!current.desired());
        assert!(!h.daemon.has_port(8381));

        h.fleet.toggle_node(h.node.id).await.unwrap();
        assert!(!h.daemon.has_port(8381));
        h.fleet.toggle_account(account.id).await.unwrap();
        assert!(h.daemon.has_port(8381));

        let paused = h.fleet.toggle_assignment(view.assignment.id).await.unwrap();
        assert!(!paused.assignment.is_active);
        assert!(!h.daemon.has_port(8381));
    }

    #[tokio::test]
    async fn test_assign_all_nodes_skips_existing() {
        let h = Harness::new(ServerEdition::Libev).await;
        h.fleet.create_node(node("b", Some("5.6.7.8"), None)).await.unwrap();
        h.fleet.create_node(node("c", Some("9.9.9.9"), None)).await.unwrap();
        let account = h.fleet.create_account(new_account(8381)).await.unwrap();
        h.fleet.create_assignment(h.node.id, account.id, false).await.unwrap();

        let created = h.fleet.assign_all_nodes(account.id).await.unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|view| view.assignment.is_active));
        assert_eq!(h.store.views_for_account(account.id).await.len(), 3);
        assert!(h.fleet.assign_all_nodes(account.id).await.unwrap().is_empty());
        // The existing paused assignment stays paused.
        assert!(!h.daemon.has_port(8381));
    }

    #[tokio::test]
    async fn test_delete_account_cascades() {
        let h = Harness::new(ServerEdition::Libev).await;
        let account = h.fleet.create_account(new_account(8381)).await.unwrap();
        let view = h.fleet.create_assignment(h.node.id, account.id, true).await.unwrap();
        h.daemon.set_counter(8381, 100);
        h.statistics.statistic().await;
        assert!(h
            .store
            .statistic(Period::total(), StatTarget::Account(account.id))
            .await
            .is_some());

        h.fleet.delete_account(account.id).await.unwrap();
        assert!(!h.daemon.has_port(8381));
        assert!(h.store.assignment_view(view.assignment.id).await.is_none());
        assert!(h.store.account(account.id).await.is_none());
        let leftovers: Vec<_> = h
            .store
            .statistics()
            .await
            .into_iter()
            .filter(|row| {
                row.target == StatTarget::Account(account.id)
                    || row.target == StatTarget::NodeAccount(view.assignment.id)
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_delete_node_cascades_to_dns() {
        let h = Harness::new(ServerEdition::Libev).await;
        let record = h.fleet.create_record(record()).await.unwrap();
        let mut a = node_input(&h.node);
        a.record_id = Some(record.id);
        h.fleet.update_node(h.node.id, a).await.unwrap();
        h.fleet
            .create_node(node("b", Some("5.6.7.8"), Some(record.id)))
            .await
            .unwrap();
        assert_eq!(h.store.record(record.id).await.unwrap().answers().len(), 2);

        let account = h.fleet.create_account(new_account(8381)).await.unwrap();
        h.fleet.create_assignment(h.node.id, account.id, true).await.unwrap();

        h.fleet.delete_node(h.node.id).await.unwrap();
        assert!(!h.daemon.has_port(8381));
        assert!(h.store.manager_for_node(h.node.id).await.is_none());
        assert!(h.store.views_for_account(account.id).await.is_empty());
        let answers = h.store.record(record.id).await.unwrap().answers();
        assert_eq!(answers.into_iter().collect::<Vec<_>>(), vec!["5.6.7.8".to_string()]);
    }
}
