//! Startup seed of the fleet from a TOML file.
//!
//! ```toml
//! [[records]]
//! host = "vpn"
//! domain = "example.com"
//!
//! [[nodes]]
//! name = "tokyo-1"
//! public_ip = "203.0.113.7"
//! record = "vpn.example.com"
//!
//! [[managers]]
//! node = "tokyo-1"
//! interface = "public"
//! port = 6001
//!
//! [[accounts]]
//! port = 8381
//! password = "secret"
//! assign_all = true
//!
//! [[assignments]]
//! node = "tokyo-1"
//! port = 8382
//! ```
//!
//! Entities refer to each other by record name, node name and account port.
//! Everything goes through [`Fleet`], so seeded entities are validated and
//! pushed to the daemons like any other mutation.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::db::models::{ManagerSettings, NewAccount, NewNode, NewRecord};
use crate::error::FleetError;
use crate::services::Fleet;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read inventory at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse inventory: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Unknown DNS record {0}")]
    UnknownRecord(String),
    #[error("Unknown node {0}")]
    UnknownNode(String),
    #[error("No account with port {0}")]
    UnknownAccount(u16),
    #[error(transparent)]
    Fleet(#[from] FleetError),
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug)]
pub struct NodeSeed {
    #[serde(flatten)]
    pub node: NewNode,
    /// Fully qualified name of the shared record.
    #[serde(default)]
    pub record: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ManagerSeed {
    pub node: String,
    #[serde(flatten)]
    pub settings: ManagerSettings,
}

#[derive(Deserialize, Debug)]
pub struct AccountSeed {
    #[serde(flatten)]
    pub account: NewAccount,
    #[serde(default)]
    pub assign_all: bool,
}

#[derive(Deserialize, Debug)]
pub struct AssignmentSeed {
    pub node: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Inventory {
    pub records: Vec<NewRecord>,
    pub nodes: Vec<NodeSeed>,
    pub managers: Vec<ManagerSeed>,
    pub accounts: Vec<AccountSeed>,
    pub assignments: Vec<AssignmentSeed>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InventoryReport {
    pub records: usize,
    pub nodes: usize,
    pub managers: usize,
    pub accounts: usize,
    pub assignments: usize,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let contents = fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, InventoryError> {
        Ok(toml::from_str(contents)?)
    }

    /// Creates everything in dependency order. Stops at the first error;
    /// entities created before it stay.
    pub async fn apply(self, fleet: &Fleet) -> Result<InventoryReport, InventoryError> {
        let mut report = InventoryReport::default();

        for record in self.records {
            fleet.create_record(record).await?;
            report.records += 1;
        }

        let records = fleet.store().records().await;
        for seed in self.nodes {
            let mut node = seed.node;
            if let Some(name) = seed.record {
                let record = records
                    .iter()
                    .find(|r| r.fqdn().eq_ignore_ascii_case(&name))
                    .ok_or(InventoryError::UnknownRecord(name))?;
                node.record_id = Some(record.id);
            }
            fleet.create_node(node).await?;
            report.nodes += 1;
        }

        for seed in self.managers {
            let node = fleet
                .store()
                .node_by_name(&seed.node)
                .await
                .ok_or(InventoryError::UnknownNode(seed.node))?;
            fleet.set_manager(node.id, seed.settings).await?;
            report.managers += 1;
        }

        for seed in self.accounts {
            let account = fleet.create_account(seed.account).await?;
            report.accounts += 1;
            if seed.assign_all {
                report.assignments += fleet.assign_all_nodes(account.id).await?.len();
            }
        }

        for seed in self.assignments {
            let node = fleet
                .store()
                .node_by_name(&seed.node)
                .await
                .ok_or_else(|| InventoryError::UnknownNode(seed.node.clone()))?;
            let account = fleet
                .store()
                .account_by_port(seed.port)
                .await
                .ok_or(InventoryError::UnknownAccount(seed.port))?;
            fleet.create_assignment(node.id, account.id, seed.is_active).await?;
            report.assignments += 1;
        }

        info!(
            records = report.records,
            nodes = report.nodes,
            managers = report.managers,
            accounts = report.accounts,
            assignments = report.assignments,
            "Inventory applied."
        );
        Ok(report)
    }
}
