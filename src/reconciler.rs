//! Keeps every node's daemon in line with the assignment graph.
//!
//! An assignment's port should exist remotely exactly when its account, its
//! node and the assignment itself are all active. Mutations of those entities
//! call into the [`Reconciler`] explicitly and the periodic heartbeat re-applies
//! the whole graph to repair drift.

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::db::entities::prelude::{AccountModel, NodeModel, SsManagerModel};
use crate::db::enums::ServerEdition;
use crate::db::{AssignmentView, FleetStore};
use crate::manager::{LocalServer, ManagerClient, ManagerContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The port is confirmed on the daemon.
    Present,
    /// The port is confirmed gone from the daemon.
    Absent,
    /// The daemon answered but the change could not be confirmed.
    Failed,
    Unreachable,
    NoEndpoint,
}

/// Desired remote presence of an assignment.
pub fn desired_state(view: &AssignmentView) -> bool {
    view.desired()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub present: usize,
    pub absent: usize,
    pub failed: usize,
    pub unreachable: usize,
    pub no_endpoint: usize,
}

impl HeartbeatReport {
    fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Present => self.present += 1,
            SyncOutcome::Absent => self.absent += 1,
            SyncOutcome::Failed => self.failed += 1,
            SyncOutcome::Unreachable => self.unreachable += 1,
            SyncOutcome::NoEndpoint => self.no_endpoint += 1,
        }
    }
}

impl fmt::Display for HeartbeatReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "present={} absent={} failed={} unreachable={} no_endpoint={}",
            self.present, self.absent, self.failed, self.unreachable, self.no_endpoint
        )
    }
}

pub struct Reconciler {
    store: Arc<FleetStore>,
    ctx: Arc<ManagerContext>,
}

impl Reconciler {
    pub fn new(store: Arc<FleetStore>, ctx: Arc<ManagerContext>) -> Self {
        Self { store, ctx }
    }

    pub fn context(&self) -> &Arc<ManagerContext> {
        &self.ctx
    }

    pub fn client_for(&self, view: &AssignmentView) -> Option<ManagerClient> {
        let manager = view.manager.clone()?;
        Some(self.ctx.client(view.node.clone(), manager))
    }

    /// A client whose daemon currently answers `ping`.
    async fn reachable_client(
        &self,
        view: &AssignmentView,
        action: &str,
    ) -> Result<ManagerClient, SyncOutcome> {
        let Some(client) = self.client_for(view) else {
            info!(assignment = %view, action = action, "Node has no manager, skipping.");
            return Err(SyncOutcome::NoEndpoint);
        };
        if !client.is_reachable().await {
            error!(
                assignment = %view,
                action = action,
                manager = %client,
                "Manager currently is not available."
            );
            return Err(SyncOutcome::Unreachable);
        }
        Ok(client)
    }

    pub async fn ensure_present(&self, view: &AssignmentView) -> SyncOutcome {
        let client = match self.reachable_client(view, "add").await {
            Ok(client) => client,
            Err(outcome) => return outcome,
        };
        let present = client.add(view.account.port, &view.account.password).await;
        self.ctx.clear_port_access(&view.node, view.account.port);
        if present {
            SyncOutcome::Present
        } else {
            warn!(assignment = %view, "Port could not be confirmed on the node.");
            SyncOutcome::Failed
        }
    }

    /// Removes `port`, which may be an account's previous port.
    pub async fn ensure_absent(&self, view: &AssignmentView, port: u16) -> SyncOutcome {
        let client = match self.reachable_client(view, "remove").await {
            Ok(client) => client,
            Err(outcome) => return outcome,
        };
        let absent = client.remove(port).await;
        self.ctx.clear_port_access(&view.node, port);
        if absent {
            SyncOutcome::Absent
        } else {
            warn!(assignment = %view, port = port, "Port removal could not be confirmed.");
            SyncOutcome::Failed
        }
    }

    pub async fn apply(&self, view: &AssignmentView) -> SyncOutcome {
        if desired_state(view) {
            self.ensure_present(view).await
        } else {
            self.ensure_absent(view, view.account.port).await
        }
    }

    pub async fn on_assignment_created(&self, view: &AssignmentView) -> SyncOutcome {
        self.apply(view).await
    }

    pub async fn on_assignment_changed(&self, old: &AssignmentView, new: &AssignmentView) -> SyncOutcome {
        if old.desired() != new.desired() {
            info!(assignment = %new, desired = new.desired(), "Assignment state changed.");
        }
        self.apply(new).await
    }

    pub async fn on_assignment_deleted(&self, view: &AssignmentView) -> SyncOutcome {
        self.ensure_absent(view, view.account.port).await
    }

    /// Re-applies every assignment of the account.
    ///
    /// A changed port or password first removes the previous port, so the
    /// daemon never sees an `add` for a port it already serves.
    pub async fn on_account_changed(&self, old: &AccountModel, new: &AccountModel) -> Vec<SyncOutcome> {
        let credentials_changed = old.port != new.port || old.password != new.password;
        if !credentials_changed && old.is_active == new.is_active {
            return Vec::new();
        }
        let mut outcomes = Vec::new();
        for view in self.store.views_for_account(new.id).await {
            if credentials_changed {
                self.ensure_absent(&view, old.port).await;
            }
            outcomes.push(self.apply(&view).await);
        }
        outcomes
    }

    pub async fn on_node_changed(&self, old: &NodeModel, new: &NodeModel) -> Vec<SyncOutcome> {
        let addresses_changed = old.public_ip != new.public_ip || old.private_ip != new.private_ip;
        if addresses_changed {
            if let Some(manager) = self.store.manager_for_node(new.id).await {
                // Entries of the old addresses.
                self.ctx.client(old.clone(), manager).clear_cache();
            }
            let ports = self.ports_on_node(new.id).await;
            self.ctx.clear_node_access(old, ports);
        }
        if !addresses_changed && old.is_active == new.is_active {
            return Vec::new();
        }
        self.apply_node(new.id).await
    }

    /// Reacts to a new or reconfigured manager endpoint of `node`.
    pub async fn on_manager_changed(
        &self,
        node: &NodeModel,
        old: Option<&SsManagerModel>,
        new: &SsManagerModel,
    ) -> Vec<SyncOutcome> {
        if let Some(old) = old {
            if old.server_edition == ServerEdition::Python
                && (new.server_edition != ServerEdition::Python || old.port != new.port)
            {
                self.stop_local_server(node, old).await;
            }
            self.ctx.client(node.clone(), old.clone()).clear_cache();
            let ports = self.ports_on_node(node.id).await;
            self.ctx.clear_node_access(node, ports);
        }

        if new.server_edition == ServerEdition::Python {
            match self.local_server(node, new) {
                Some(server) if new.is_server_enabled => {
                    server.restart(old.map_or(new.port, |o| o.port)).await;
                }
                Some(server) => {
                    server.stop(new.port).await;
                }
                None => warn!(node = %node.name, "No address for the local server."),
            }
            self.ctx.client(node.clone(), new.clone()).clear_cache();
        }

        let endpoint_moved = old.map_or(true, |o| {
            o.interface != new.interface || o.port != new.port || o.server_edition != new.server_edition
        });
        if endpoint_moved {
            self.apply_node(node.id).await
        } else {
            Vec::new()
        }
    }

    pub async fn on_manager_deleted(&self, node: &NodeModel, old: &SsManagerModel) {
        if old.server_edition == ServerEdition::Python {
            self.stop_local_server(node, old).await;
        }
        self.ctx.client(node.clone(), old.clone()).clear_cache();
        let ports = self.ports_on_node(node.id).await;
        self.ctx.clear_node_access(node, ports);
    }

    fn local_server(&self, node: &NodeModel, manager: &SsManagerModel) -> Option<LocalServer> {
        let ip = node.ip_for_interface(manager.interface)?;
        Some(LocalServer::new(
            self.ctx.config().ssserver_bin.clone(),
            manager.clone(),
            ip,
        ))
    }

    async fn stop_local_server(&self, node: &NodeModel, manager: &SsManagerModel) {
        if let Some(server) = self.local_server(node, manager) {
            server.stop(manager.port).await;
        }
    }

    async fn ports_on_node(&self, node_id: i32) -> Vec<u16> {
        self.store
            .views_for_node(node_id)
            .await
            .into_iter()
            .map(|view| view.account.port)
            .collect()
    }

    async fn apply_node(&self, node_id: i32) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::new();
        for view in self.store.views_for_node(node_id).await {
            outcomes.push(self.apply(&view).await);
        }
        outcomes
    }

    /// Re-applies every assignment, active or not.
    ///
    /// Nodes are handled concurrently so that one stalled daemon only delays
    /// its own assignments.
    #[instrument(skip(self))]
    pub async fn heartbeat(&self) -> HeartbeatReport {
        let mut by_node: BTreeMap<i32, Vec<AssignmentView>> = BTreeMap::new();
        for view in self.store.all_views().await {
            by_node.entry(view.node.id).or_default().push(view);
        }

        let per_node = join_all(by_node.into_values().map(|views| async move {
            let mut outcomes = Vec::with_capacity(views.len());
            for view in &views {
                outcomes.push(self.apply(view).await);
            }
            outcomes
        }))
        .await;

        let mut report = HeartbeatReport::default();
        for outcome in per_node.into_iter().flatten() {
            report.record(outcome);
        }
        info!(report = %report, "Heartbeat finished.");
        report
    }

    /// Whether the assignment's port accepts connections on the node's public
    /// address. Cached like every other probe.
    pub async fn is_accessible(&self, view: &AssignmentView) -> bool {
        self.ctx.port_accessible(&view.node, view.account.port).await
    }
}
