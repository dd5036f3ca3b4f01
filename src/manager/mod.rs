pub mod client;
pub mod probe;
pub mod protocol;
pub mod server;

use std::sync::Arc;

use crate::cache::TtlCache;
use crate::config::{ConfigHandle, ServiceConfig};
use crate::db::entities::prelude::{NodeModel, SsManagerModel};
use crate::retry::{LogObserver, RetryObserver};

pub use client::{ManagerClient, ManagerError};
pub use probe::{PortProbe, TcpProbe};
pub use protocol::{DaemonReply, PingReply, PortEntry};
pub use server::LocalServer;

/// Process-wide state shared by every manager client.
pub struct ManagerContext {
    config: ConfigHandle,
    replies: TtlCache<DaemonReply>,
    access: TtlCache<bool>,
    probe: Arc<dyn PortProbe>,
    retry_observer: Arc<dyn RetryObserver>,
}

impl ManagerContext {
    pub fn new(config: ConfigHandle, probe: Arc<dyn PortProbe>) -> Self {
        Self::with_observer(config, probe, Arc::new(LogObserver))
    }

    pub fn with_observer(
        config: ConfigHandle,
        probe: Arc<dyn PortProbe>,
        retry_observer: Arc<dyn RetryObserver>,
    ) -> Self {
        Self {
            config,
            replies: TtlCache::new(),
            access: TtlCache::new(),
            probe,
            retry_observer,
        }
    }

    pub fn config(&self) -> Arc<ServiceConfig> {
        self.config.get()
    }

    pub fn config_handle(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn replies(&self) -> &TtlCache<DaemonReply> {
        &self.replies
    }

    pub fn retry_observer(&self) -> &dyn RetryObserver {
        self.retry_observer.as_ref()
    }

    pub fn client(self: &Arc<Self>, node: NodeModel, manager: SsManagerModel) -> ManagerClient {
        ManagerClient::new(node, manager, Arc::clone(self))
    }

    fn access_key(node: &NodeModel, port: u16) -> Option<String> {
        node.public_ip.map(|ip| format!("{ip}:{port}"))
    }

    /// Whether `port` accepts TCP connections on the node's public address.
    ///
    /// Best effort, see [`PortProbe`]. Answers are cached for the configured
    /// TTL. A node without a public address is never accessible.
    pub async fn port_accessible(&self, node: &NodeModel, port: u16) -> bool {
        let (Some(ip), Some(key)) = (node.public_ip, Self::access_key(node, port)) else {
            return false;
        };
        if let Some(hit) = self.access.get(&key) {
            return hit;
        }
        let config = self.config.get();
        let open = self.probe.is_open(ip, port, config.timeout_for(ip)).await;
        self.access.insert(key, open, config.cache_ttl());
        open
    }

    pub fn clear_port_access(&self, node: &NodeModel, port: u16) {
        if let Some(key) = Self::access_key(node, port) {
            self.access.invalidate(&key);
        }
    }

    pub fn clear_node_access<I>(&self, node: &NodeModel, ports: I)
    where
        I: IntoIterator<Item = u16>,
    {
        self.access
            .invalidate_many(ports.into_iter().filter_map(|port| Self::access_key(node, port)));
    }
}
