use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, instrument};

use super::ManagerContext;
use super::protocol::{
    Command, DaemonReply, PingReply, PortEntry, ProtocolError, parse_list, parse_ping,
};
use crate::db::entities::prelude::{NodeModel, SsManagerModel};
use crate::db::enums::Interface;

// Largest payload of a single UDP datagram.
const MAX_DATAGRAM: usize = 65507;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Node has no address for the {0} interface")]
    NoAddress(Interface),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out in {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Port {port} is still {state}")]
    NotConfirmed { port: u16, state: &'static str },
}

/// Client of one node's manager API.
///
/// Transport failures are logged and read as "unknown" (`None`), they are
/// never returned to callers.
pub struct ManagerClient {
    node: NodeModel,
    manager: SsManagerModel,
    ctx: Arc<ManagerContext>,
}

impl fmt::Display for ManagerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(ip) => write!(f, "{}", SocketAddr::new(ip, self.manager.port)),
            None => write!(f, "{}:{}", self.manager.interface, self.manager.port),
        }
    }
}

impl ManagerClient {
    pub fn new(node: NodeModel, manager: SsManagerModel, ctx: Arc<ManagerContext>) -> Self {
        Self { node, manager, ctx }
    }

    pub fn node(&self) -> &NodeModel {
        &self.node
    }

    pub fn manager(&self) -> &SsManagerModel {
        &self.manager
    }

    /// Address of the daemon on the manager's interface.
    pub fn ip(&self) -> Option<IpAddr> {
        self.node.ip_for_interface(self.manager.interface)
    }

    fn cache_key(&self, command: &str) -> String {
        format!("{self}-{command}")
    }

    async fn call(&self, command: &Command) -> Result<Option<String>, ManagerError> {
        let ip = self
            .ip()
            .ok_or(ManagerError::NoAddress(self.manager.interface))?;
        let addr = SocketAddr::new(ip, self.manager.port);
        let timeout = self.ctx.config().timeout_for(ip);
        let payload = command.encode()?;

        let bind: SocketAddr = if ip.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        tokio::time::timeout(timeout, socket.send(payload.as_bytes()))
            .await
            .map_err(|_| ManagerError::Timeout(timeout))??;
        if !command.expects_reply() {
            return Ok(None);
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ManagerError::Timeout(timeout))??;
        Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()))
    }

    async fn send(&self, command: Command) {
        if let Err(e) = self.call(&command).await {
            error!(manager = %self, command = command.name(), error = %e, "Manager call failed.");
        }
    }

    async fn query(&self, command: Command) -> Option<String> {
        match self.call(&command).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(manager = %self, command = command.name(), error = %e, "Manager call failed.");
                None
            }
        }
    }

    /// `None` when the daemon did not answer.
    pub async fn ping(&self) -> Option<PingReply> {
        let raw = self.query(Command::Ping).await?;
        match parse_ping(&raw) {
            Ok(reply) => Some(reply),
            Err(e) => {
                error!(manager = %self, error = %e, "Unreadable ping reply.");
                None
            }
        }
    }

    /// `None` when the ports are unknown: the edition cannot list, the daemon
    /// did not answer, or the answer was unreadable. Never an empty stand-in.
    pub async fn list(&self) -> Option<Vec<PortEntry>> {
        if !self.manager.server_edition.supports_list() {
            return None;
        }
        let raw = self.query(Command::List).await?;
        match parse_list(&raw) {
            Ok(entries) => Some(entries),
            Err(e) => {
                error!(manager = %self, error = %e, "Unreadable list reply.");
                None
            }
        }
    }

    /// [`ping`](Self::ping) through the shared cache. `use_cache = false`
    /// forces a fresh call and refreshes the entry.
    pub async fn ping_cached(&self, use_cache: bool) -> Option<PingReply> {
        let key = self.cache_key("ping");
        if use_cache {
            if let Some(DaemonReply::Ping(reply)) = self.ctx.replies().get(&key) {
                debug!(key = %key, "Hitting cache.");
                return Some(reply);
            }
        }
        let reply = self.ping().await?;
        self.ctx.replies().insert(
            key,
            DaemonReply::Ping(reply.clone()),
            self.ctx.config().cache_ttl(),
        );
        Some(reply)
    }

    pub async fn list_cached(&self) -> Option<Vec<PortEntry>> {
        let key = self.cache_key("list");
        if let Some(DaemonReply::List(entries)) = self.ctx.replies().get(&key) {
            debug!(key = %key, "Hitting cache.");
            return Some(entries);
        }
        let entries = self.list().await?;
        self.ctx.replies().insert(
            key,
            DaemonReply::List(entries.clone()),
            self.ctx.config().cache_ttl(),
        );
        Some(entries)
    }

    pub fn clear_cache(&self) {
        let keys = [self.cache_key("ping"), self.cache_key("list")];
        debug!(keys = ?keys, "Clearing cache.");
        self.ctx.replies().invalidate_many(keys);
    }

    /// Whether the daemon answers `ping`.
    pub async fn is_reachable(&self) -> bool {
        self.ping_cached(true).await.is_some()
    }

    /// `None` when the daemon's ports are unknown.
    pub async fn is_port_created(&self, port: u16) -> Option<bool> {
        let entries = self.list_cached().await?;
        Some(entries.iter().any(|entry| entry.server_port == port))
    }

    /// [`is_port_created`](Self::is_port_created), falling back to a TCP
    /// probe of the node's public address when the ports are unknown.
    ///
    /// The fallback is best effort: firewalls make it report false negatives
    /// and an unrelated listener makes it report false positives.
    pub async fn is_port_created_or_accessible(&self, port: u16) -> bool {
        match self.is_port_created(port).await {
            Some(created) => created,
            None => self.ctx.port_accessible(&self.node, port).await,
        }
    }

    fn invalidate(&self, port: u16) {
        self.clear_cache();
        self.ctx.clear_port_access(&self.node, port);
    }

    /// Whether `port` is served with `password`. Without a `list` answer only
    /// the port can be checked, by connecting to it.
    async fn is_port_current(&self, port: u16, password: &str) -> bool {
        match self.list_cached().await {
            Some(entries) => entries
                .iter()
                .any(|entry| entry.server_port == port && serves(entry, password)),
            None => self.ctx.port_accessible(&self.node, port).await,
        }
    }

    async fn try_add(&self, port: u16, password: &str) -> Result<bool, ManagerError> {
        match self.list_cached().await {
            Some(entries) => match entries.iter().find(|entry| entry.server_port == port) {
                Some(entry) if serves(entry, password) => return Ok(true),
                Some(_) => {
                    info!(manager = %self, port = port, "Port serves another password, removing it first.");
                    self.send(Command::Remove { port }).await;
                    self.invalidate(port);
                }
                None => {}
            },
            None => {
                if self.ctx.port_accessible(&self.node, port).await {
                    return Ok(true);
                }
            }
        }

        info!(manager = %self, port = port, "Adding port.");
        self.send(Command::Add {
            port,
            password: password.to_string(),
        })
        .await;
        self.invalidate(port);
        if !self.is_port_current(port, password).await {
            return Err(ManagerError::NotConfirmed { port, state: "absent" });
        }
        Ok(true)
    }

    async fn try_remove(&self, port: u16) -> Result<bool, ManagerError> {
        if self.is_port_created_or_accessible(port).await {
            info!(manager = %self, port = port, "Removing port.");
            self.send(Command::Remove { port }).await;
            self.invalidate(port);
            if self.is_port_created_or_accessible(port).await {
                return Err(ManagerError::NotConfirmed { port, state: "present" });
            }
        }
        Ok(true)
    }

    /// Ensures `port` exists on the daemon with `password` and returns whether
    /// it finally does.
    ///
    /// Skips the wire call when the port is already there, so repeated calls
    /// only ever send one `add`. A port listed with another password is
    /// removed before it is added again.
    #[instrument(skip(self, password), fields(manager = %self))]
    pub async fn add(&self, port: u16, password: &str) -> bool {
        let policy = self.ctx.config().retry_policy();
        let this = self;
        policy
            .run(&format!("add {port} on {this}"), self.ctx.retry_observer(), move || async move {
                this.try_add(port, password).await
            })
            .await
            .unwrap_or(false)
    }

    /// Ensures `port` is gone from the daemon and returns whether it finally is.
    #[instrument(skip(self), fields(manager = %self))]
    pub async fn remove(&self, port: u16) -> bool {
        let policy = self.ctx.config().retry_policy();
        let this = self;
        policy
            .run(&format!("remove {port} on {this}"), self.ctx.retry_observer(), move || async move {
                this.try_remove(port).await
            })
            .await
            .unwrap_or(false)
    }
}

// Entries listed without a password match on the port alone.
fn serves(entry: &PortEntry, password: &str) -> bool {
    entry.password.as_deref().is_none_or(|listed| listed == password)
}
