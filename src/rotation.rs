//! Node IP replacement jobs.
//!
//! The replacement itself happens outside this process: a publisher notifies
//! the node's infrastructure, which later reports the new address back through
//! a regular node update.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::ConfigHandle;
use crate::db::FleetStore;
use crate::db::entities::prelude::NodeModel;
use crate::services::Fleet;

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("Node {0} has no IP change endpoint")]
    MissingEndpoint(String),
    #[error("Failed to publish IP change: {0}")]
    SendFailed(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Asks the infrastructure behind a node for a new public address.
#[async_trait]
pub trait IpChangePublisher: Send + Sync {
    async fn publish(&self, node: &NodeModel) -> Result<(), RotationError>;
}

#[derive(Serialize)]
struct ChangeIpMessage<'a> {
    message: &'static str,
    node: &'a str,
}

/// POSTs `{"message":"change_ip","node":<name>}` to the node's webhook.
pub struct WebhookPublisher {
    client: Client,
}

impl WebhookPublisher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for WebhookPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpChangePublisher for WebhookPublisher {
    async fn publish(&self, node: &NodeModel) -> Result<(), RotationError> {
        let url = node
            .ip_change_webhook
            .as_deref()
            .ok_or_else(|| RotationError::MissingEndpoint(node.name.clone()))?;
        let response = self
            .client
            .post(url)
            .json(&ChangeIpMessage {
                message: "change_ip",
                node: &node.name,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(RotationError::SendFailed(format!(
                "Webhook returned non-success status: {status}. Body: {error_body}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RotationReport {
    pub published: usize,
    pub failed: usize,
}

pub struct IpRotator {
    store: Arc<FleetStore>,
    fleet: Arc<Fleet>,
    publisher: Arc<dyn IpChangePublisher>,
    config: ConfigHandle,
}

impl IpRotator {
    pub fn new(
        store: Arc<FleetStore>,
        fleet: Arc<Fleet>,
        publisher: Arc<dyn IpChangePublisher>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            store,
            fleet,
            publisher,
            config,
        }
    }

    async fn candidates(&self) -> Vec<NodeModel> {
        self.store
            .nodes()
            .await
            .into_iter()
            .filter(|node| node.is_active && node.ip_change_webhook.is_some())
            .collect()
    }

    async fn publish(&self, node: &NodeModel, report: &mut RotationReport) {
        match self.publisher.publish(node).await {
            Ok(()) => {
                info!(node = %node.name, "IP change requested.");
                report.published += 1;
            }
            Err(e) => {
                error!(node = %node.name, error = %e, "Failed to request IP change.");
                report.failed += 1;
            }
        }
    }

    /// Requests a new address for every active node at once.
    #[instrument(skip(self))]
    pub async fn rotate_ips(&self) -> RotationReport {
        let mut report = RotationReport::default();
        for node in self.candidates().await {
            self.publish(&node, &mut report).await;
        }
        report
    }

    /// Replaces addresses one node at a time without dropping clients.
    ///
    /// Each node is taken out of service first, so its address leaves the DNS
    /// record before it changes, and is brought back once the new address had
    /// time to arrive.
    #[instrument(skip(self))]
    pub async fn rotate_ips_softly(&self) -> RotationReport {
        let config = self.config.get();
        let dns_wait = Duration::from_secs(config.rotate_dns_wait);
        let capture_wait = Duration::from_secs(config.rotate_capture_wait);

        let mut report = RotationReport::default();
        for node in self.candidates().await {
            if let Err(e) = self.fleet.set_node_active(node.id, false).await {
                error!(node = %node.name, error = %e, "Failed to deactivate node, skipped.");
                report.failed += 1;
                continue;
            }
            tokio::time::sleep(dns_wait).await;
            self.publish(&node, &mut report).await;
            tokio::time::sleep(capture_wait).await;
            if let Err(e) = self.fleet.set_node_active(node.id, true).await {
                error!(node = %node.name, error = %e, "Failed to reactivate node.");
            }
        }
        report
    }
}
