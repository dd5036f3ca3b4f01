use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio::sync::RwLock;

use crate::db::entities::{account, dns_record, node, node_account, ss_manager, statistic};
use crate::db::entities::prelude::*;
use crate::db::models::{ManagerSettings, NewAccount, NewNode, NewRecord};
use crate::error::FleetError;

/// An assignment joined with everything reconciliation needs to act on it.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignmentView {
    pub assignment: NodeAccountModel,
    pub account: AccountModel,
    pub node: NodeModel,
    pub manager: Option<SsManagerModel>,
}

impl AssignmentView {
    /// Whether the account's port should exist on the node's daemon.
    pub fn desired(&self) -> bool {
        self.account.is_active && self.node.is_active && self.assignment.is_active
    }
}

impl fmt::Display for AssignmentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.account.port, self.node.name)
    }
}

#[derive(Default)]
struct Tables {
    next_id: i32,
    accounts: BTreeMap<i32, account::Model>,
    nodes: BTreeMap<i32, node::Model>,
    assignments: BTreeMap<i32, node_account::Model>,
    managers: BTreeMap<i32, ss_manager::Model>,
    records: BTreeMap<i32, dns_record::Model>,
    statistics: BTreeMap<(Period, StatTarget), statistic::Model>,
}

impl Tables {
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    fn manager_for_node(&self, node_id: i32) -> Option<&ss_manager::Model> {
        self.managers.values().find(|m| m.node_id == node_id)
    }

    fn view(&self, assignment: &node_account::Model) -> Option<AssignmentView> {
        let account = self.accounts.get(&assignment.account_id)?;
        let node = self.nodes.get(&assignment.node_id)?;
        Some(AssignmentView {
            assignment: assignment.clone(),
            account: account.clone(),
            node: node.clone(),
            manager: self.manager_for_node(node.id).cloned(),
        })
    }

    fn check_account_port(&self, port: u16, except: Option<i32>) -> Result<(), FleetError> {
        if self
            .accounts
            .values()
            .any(|a| a.port == port && Some(a.id) != except)
        {
            return Err(FleetError::Conflict(format!("account port {port} already exists")));
        }
        Ok(())
    }

    fn check_node(&self, input: &NewNode, except: Option<i32>) -> Result<(), FleetError> {
        for existing in self.nodes.values().filter(|n| Some(n.id) != except) {
            if existing.name == input.name {
                return Err(FleetError::Conflict(format!("node name {} already exists", input.name)));
            }
            if input.public_ip.is_some() && existing.public_ip == input.public_ip {
                return Err(FleetError::Conflict(format!(
                    "public ip {} already used by node {}",
                    existing.public_ip.map(|ip| ip.to_string()).unwrap_or_default(),
                    existing.name
                )));
            }
        }
        if let Some(record_id) = input.record_id {
            if !self.records.contains_key(&record_id) {
                return Err(FleetError::NotFound(format!("dns record {record_id}")));
            }
        }
        Ok(())
    }
}

/// In-memory fleet tables.
///
/// Enforces the uniqueness rules of the data model: account ports, node names
/// and public addresses, one assignment per (node, account), one manager per
/// node and one statistics row per (period, target).
#[derive(Default)]
pub struct FleetStore {
    tables: RwLock<Tables>,
}

impl FleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Accounts

    pub async fn insert_account(&self, input: NewAccount) -> Result<AccountModel, FleetError> {
        let mut tables = self.tables.write().await;
        tables.check_account_port(input.port, None)?;
        let now = Utc::now();
        let model = account::Model {
            id: tables.next_id(),
            port: input.port,
            password: input.password,
            full_name: input.full_name,
            email: input.email,
            is_active: input.is_active,
            created_at: now,
            updated_at: now,
        };
        tables.accounts.insert(model.id, model.clone());
        Ok(model)
    }

    /// Replaces the editable fields and returns the previous and new rows.
    pub async fn update_account(
        &self,
        id: i32,
        input: NewAccount,
    ) -> Result<(AccountModel, AccountModel), FleetError> {
        let mut tables = self.tables.write().await;
        tables.check_account_port(input.port, Some(id))?;
        let row = tables
            .accounts
            .get_mut(&id)
            .ok_or_else(|| FleetError::NotFound(format!("account {id}")))?;
        let old = row.clone();
        row.port = input.port;
        row.password = input.password;
        row.full_name = input.full_name;
        row.email = input.email;
        row.is_active = input.is_active;
        row.updated_at = Utc::now();
        Ok((old, row.clone()))
    }

    pub async fn account(&self, id: i32) -> Option<AccountModel> {
        self.tables.read().await.accounts.get(&id).cloned()
    }

    pub async fn account_by_port(&self, port: u16) -> Option<AccountModel> {
        let tables = self.tables.read().await;
        tables.accounts.values().find(|a| a.port == port).cloned()
    }

    pub async fn accounts(&self) -> Vec<AccountModel> {
        self.tables.read().await.accounts.values().cloned().collect()
    }

    pub async fn delete_account(&self, id: i32) -> Result<AccountModel, FleetError> {
        let mut tables = self.tables.write().await;
        tables
            .accounts
            .remove(&id)
            .ok_or_else(|| FleetError::NotFound(format!("account {id}")))
    }

    // Nodes

    pub async fn insert_node(&self, input: NewNode) -> Result<NodeModel, FleetError> {
        let mut tables = self.tables.write().await;
        tables.check_node(&input, None)?;
        let now = Utc::now();
        let model = node::Model {
            id: tables.next_id(),
            name: input.name,
            public_ip: input.public_ip,
            private_ip: input.private_ip,
            location: input.location,
            is_active: input.is_active,
            record_id: input.record_id,
            ip_change_webhook: input.ip_change_webhook,
            created_at: now,
            updated_at: now,
        };
        tables.nodes.insert(model.id, model.clone());
        Ok(model)
    }

    pub async fn update_node(
        &self,
        id: i32,
        input: NewNode,
    ) -> Result<(NodeModel, NodeModel), FleetError> {
        let mut tables = self.tables.write().await;
        tables.check_node(&input, Some(id))?;
        let row = tables
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FleetError::NotFound(format!("node {id}")))?;
        let old = row.clone();
        row.name = input.name;
        row.public_ip = input.public_ip;
        row.private_ip = input.private_ip;
        row.location = input.location;
        row.is_active = input.is_active;
        row.record_id = input.record_id;
        row.ip_change_webhook = input.ip_change_webhook;
        row.updated_at = Utc::now();
        Ok((old, row.clone()))
    }

    pub async fn node(&self, id: i32) -> Option<NodeModel> {
        self.tables.read().await.nodes.get(&id).cloned()
    }

    pub async fn node_by_name(&self, name: &str) -> Option<NodeModel> {
        let tables = self.tables.read().await;
        tables.nodes.values().find(|n| n.name == name).cloned()
    }

    pub async fn nodes(&self) -> Vec<NodeModel> {
        self.tables.read().await.nodes.values().cloned().collect()
    }

    pub async fn nodes_for_record(&self, record_id: i32) -> Vec<NodeModel> {
        let tables = self.tables.read().await;
        tables
            .nodes
            .values()
            .filter(|n| n.record_id == Some(record_id))
            .cloned()
            .collect()
    }

    pub async fn delete_node(&self, id: i32) -> Result<NodeModel, FleetError> {
        let mut tables = self.tables.write().await;
        tables
            .nodes
            .remove(&id)
            .ok_or_else(|| FleetError::NotFound(format!("node {id}")))
    }

    // Assignments

    pub async fn insert_assignment(
        &self,
        node_id: i32,
        account_id: i32,
        is_active: bool,
    ) -> Result<AssignmentView, FleetError> {
        let mut tables = self.tables.write().await;
        if !tables.nodes.contains_key(&node_id) {
            return Err(FleetError::NotFound(format!("node {node_id}")));
        }
        if !tables.accounts.contains_key(&account_id) {
            return Err(FleetError::NotFound(format!("account {account_id}")));
        }
        if tables
            .assignments
            .values()
            .any(|a| a.node_id == node_id && a.account_id == account_id)
        {
            return Err(FleetError::Conflict(format!(
                "account {account_id} is already assigned to node {node_id}"
            )));
        }
        let now = Utc::now();
        let model = node_account::Model {
            id: tables.next_id(),
            node_id,
            account_id,
            is_active,
            created_at: now,
            updated_at: now,
        };
        tables.assignments.insert(model.id, model.clone());
        tables
            .view(&model)
            .ok_or_else(|| FleetError::NotFound(format!("assignment {}", model.id)))
    }

    pub async fn set_assignment_active(
        &self,
        id: i32,
        is_active: bool,
    ) -> Result<(AssignmentView, AssignmentView), FleetError> {
        let mut tables = self.tables.write().await;
        let not_found = || FleetError::NotFound(format!("assignment {id}"));
        let row = tables.assignments.get_mut(&id).ok_or_else(not_found)?;
        let old_row = row.clone();
        row.is_active = is_active;
        row.updated_at = Utc::now();
        let new_row = row.clone();
        let old = tables.view(&old_row).ok_or_else(not_found)?;
        let new = tables.view(&new_row).ok_or_else(not_found)?;
        Ok((old, new))
    }

    /// Removes the assignment and returns the last joined view of it.
    pub async fn delete_assignment(&self, id: i32) -> Result<AssignmentView, FleetError> {
        let mut tables = self.tables.write().await;
        let not_found = || FleetError::NotFound(format!("assignment {id}"));
        let row = tables.assignments.get(&id).cloned().ok_or_else(not_found)?;
        let view = tables.view(&row).ok_or_else(not_found)?;
        tables.assignments.remove(&id);
        Ok(view)
    }

    pub async fn assignment_view(&self, id: i32) -> Option<AssignmentView> {
        let tables = self.tables.read().await;
        tables.assignments.get(&id).and_then(|a| tables.view(a))
    }

    pub async fn assignment_for(&self, node_id: i32, account_id: i32) -> Option<AssignmentView> {
        let tables = self.tables.read().await;
        tables
            .assignments
            .values()
            .find(|a| a.node_id == node_id && a.account_id == account_id)
            .and_then(|a| tables.view(a))
    }

    pub async fn views_for_node(&self, node_id: i32) -> Vec<AssignmentView> {
        self.views_where(|a| a.node_id == node_id).await
    }

    pub async fn views_for_account(&self, account_id: i32) -> Vec<AssignmentView> {
        self.views_where(|a| a.account_id == account_id).await
    }

    pub async fn all_views(&self) -> Vec<AssignmentView> {
        self.views_where(|_| true).await
    }

    async fn views_where<F>(&self, filter: F) -> Vec<AssignmentView>
    where
        F: Fn(&node_account::Model) -> bool,
    {
        let tables = self.tables.read().await;
        tables
            .assignments
            .values()
            .filter(|a| filter(a))
            .filter_map(|a| tables.view(a))
            .collect()
    }

    /// Assignment id to (node id, account id) for every assignment.
    pub async fn memberships(&self) -> BTreeMap<i32, (i32, i32)> {
        let tables = self.tables.read().await;
        tables
            .assignments
            .values()
            .map(|a| (a.id, (a.node_id, a.account_id)))
            .collect()
    }

    // Managers

    /// Creates or replaces the node's manager, returning the previous one.
    pub async fn set_manager(
        &self,
        node_id: i32,
        settings: ManagerSettings,
    ) -> Result<(Option<SsManagerModel>, SsManagerModel), FleetError> {
        let mut tables = self.tables.write().await;
        if !tables.nodes.contains_key(&node_id) {
            return Err(FleetError::NotFound(format!("node {node_id}")));
        }
        let now = Utc::now();
        let old = tables.manager_for_node(node_id).cloned();
        let (id, created_at) = match &old {
            Some(m) => (m.id, m.created_at),
            None => (tables.next_id(), now),
        };
        let model = ss_manager::Model {
            id,
            node_id,
            interface: settings.interface,
            port: settings.port,
            encrypt: settings.encrypt,
            timeout: settings.timeout,
            fastopen: settings.fastopen,
            server_edition: settings.server_edition,
            is_server_enabled: settings.is_server_enabled,
            created_at,
            updated_at: now,
        };
        tables.managers.insert(id, model.clone());
        Ok((old, model))
    }

    pub async fn manager_for_node(&self, node_id: i32) -> Option<SsManagerModel> {
        self.tables.read().await.manager_for_node(node_id).cloned()
    }

    pub async fn delete_manager(&self, node_id: i32) -> Option<SsManagerModel> {
        let mut tables = self.tables.write().await;
        let id = tables.manager_for_node(node_id)?.id;
        tables.managers.remove(&id)
    }

    // DNS records

    pub async fn insert_record(&self, input: NewRecord) -> Result<DnsRecordModel, FleetError> {
        let mut tables = self.tables.write().await;
        if tables
            .records
            .values()
            .any(|r| r.host == input.host && r.domain == input.domain && r.record_type == input.record_type)
        {
            return Err(FleetError::Conflict(format!(
                "dns record {} {}.{} already exists",
                input.record_type, input.host, input.domain
            )));
        }
        let now = Utc::now();
        let model = dns_record::Model {
            id: tables.next_id(),
            host: input.host,
            domain: input.domain,
            record_type: input.record_type,
            answer: input.answer,
            created_at: now,
            updated_at: now,
        };
        tables.records.insert(model.id, model.clone());
        Ok(model)
    }

    pub async fn record(&self, id: i32) -> Option<DnsRecordModel> {
        self.tables.read().await.records.get(&id).cloned()
    }

    pub async fn records(&self) -> Vec<DnsRecordModel> {
        self.tables.read().await.records.values().cloned().collect()
    }

    pub async fn set_record_answer(
        &self,
        id: i32,
        answers: &BTreeSet<String>,
    ) -> Result<DnsRecordModel, FleetError> {
        let mut tables = self.tables.write().await;
        let row = tables
            .records
            .get_mut(&id)
            .ok_or_else(|| FleetError::NotFound(format!("dns record {id}")))?;
        row.set_answers(answers);
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    // Statistics

    pub async fn statistic(&self, period: Period, target: StatTarget) -> Option<StatisticModel> {
        self.tables.read().await.statistics.get(&(period, target)).cloned()
    }

    pub async fn statistic_or_default(&self, period: Period, target: StatTarget) -> StatisticModel {
        self.statistic(period, target)
            .await
            .unwrap_or_else(|| statistic::Model::empty(period, target))
    }

    pub async fn save_statistic(&self, row: StatisticModel) {
        let mut tables = self.tables.write().await;
        tables.statistics.insert((row.period, row.target), row);
    }

    pub async fn statistics(&self) -> Vec<StatisticModel> {
        self.tables.read().await.statistics.values().cloned().collect()
    }

    pub async fn remove_statistics_for(&self, target: StatTarget) -> usize {
        let mut tables = self.tables.write().await;
        let before = tables.statistics.len();
        tables.statistics.retain(|(_, t), _| *t != target);
        before - tables.statistics.len()
    }
}
