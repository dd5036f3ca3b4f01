//! Fakes shared by the unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::config::{ConfigHandle, ServiceConfig};
use crate::db::FleetStore;
use crate::db::entities::prelude::NodeModel;
use crate::db::enums::{Interface, ServerEdition};
use crate::db::models::{ManagerSettings, NewAccount, NewNode};
use crate::dns::{DnsError, DnsProvider, DnsRecordEntry, DnsSynchronizer};
use crate::manager::{ManagerClient, ManagerContext, PortProbe};
use crate::reconciler::Reconciler;
use crate::rotation::{IpChangePublisher, IpRotator, RotationError};
use crate::services::Fleet;
use crate::statistics::{LocalLockService, StatisticsEngine};

// Unrecorded round trip used by the probe to wait for queued datagrams.
const FLUSH: &str = "flush";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct DaemonState {
    ports: BTreeMap<u16, String>,
    counters: BTreeMap<u16, u64>,
    commands: Vec<String>,
    silent: bool,
}

/// A manager daemon on a loopback UDP socket.
pub struct FakeDaemon {
    addr: SocketAddr,
    edition: ServerEdition,
    state: Arc<Mutex<DaemonState>>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeDaemon {
    pub async fn start(edition: ServerEdition) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let state = Arc::new(Mutex::new(DaemonState::default()));
        let shared = state.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65507];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
                if let Some(reply) = handle(&shared, edition, &raw) {
                    let _ = socket.send_to(reply.as_bytes(), peer).await;
                }
            }
        });
        Self {
            addr,
            edition,
            state,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn edition(&self) -> ServerEdition {
        self.edition
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    pub fn commands_named(&self, names: &[&str]) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| names.contains(&c.as_str()))
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        lock(&self.state).commands.iter().filter(|c| *c == name).count()
    }

    pub fn password(&self, port: u16) -> Option<String> {
        lock(&self.state).ports.get(&port).cloned()
    }

    pub fn insert_port(&self, port: u16, password: &str) {
        lock(&self.state).ports.insert(port, password.to_string());
    }

    pub fn has_port(&self, port: u16) -> bool {
        lock(&self.state).ports.contains_key(&port)
    }

    pub fn clear_ports(&self) {
        lock(&self.state).ports.clear();
    }

    /// A silent daemon drops every datagram unanswered and unrecorded.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    pub fn set_counter(&self, port: u16, bytes: u64) {
        lock(&self.state).counters.insert(port, bytes);
    }

    pub fn probe(&self) -> FakeProbe {
        FakeProbe {
            daemon: self.addr,
            state: self.state.clone(),
        }
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn server_port(body: &str) -> Option<(u16, Option<String>)> {
    let value: Value = serde_json::from_str(body.trim()).ok()?;
    let port = value.get("server_port")?.as_u64()?;
    let password = value
        .get("password")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((u16::try_from(port).ok()?, password))
}

fn handle(state: &Mutex<DaemonState>, edition: ServerEdition, raw: &str) -> Option<String> {
    let mut state = lock(state);
    if raw == FLUSH {
        return Some(FLUSH.to_string());
    }
    if state.silent {
        return None;
    }
    let (name, body) = match raw.split_once(':') {
        Some((name, body)) => (name.trim(), body),
        None => (raw.trim(), ""),
    };
    state.commands.push(name.to_string());
    match name {
        "add" => {
            if let Some((port, Some(password))) = server_port(body) {
                state.ports.insert(port, password);
            }
            None
        }
        "remove" => {
            if let Some((port, _)) = server_port(body) {
                state.ports.remove(&port);
            }
            None
        }
        "ping" => match edition {
            ServerEdition::Python => Some("pong".to_string()),
            ServerEdition::Libev => {
                let stats: BTreeMap<String, u64> = state
                    .ports
                    .keys()
                    .map(|port| (port.to_string(), state.counters.get(port).copied().unwrap_or(0)))
                    .collect();
                Some(format!("stat: {}", serde_json::to_string(&stats).ok()?))
            }
        },
        "list" => match edition {
            ServerEdition::Python => None,
            ServerEdition::Libev => {
                let entries: Vec<Value> = state
                    .ports
                    .iter()
                    .map(|(port, password)| {
                        serde_json::json!({"server_port": port.to_string(), "password": password})
                    })
                    .collect();
                serde_json::to_string(&entries).ok()
            }
        },
        _ => None,
    }
}

/// Sees a port as open exactly when the daemon serves it.
pub struct FakeProbe {
    daemon: SocketAddr,
    state: Arc<Mutex<DaemonState>>,
}

impl FakeProbe {
    async fn flush(&self) {
        let Ok(socket) = UdpSocket::bind("127.0.0.1:0").await else {
            return;
        };
        if socket.send_to(FLUSH.as_bytes(), self.daemon).await.is_err() {
            return;
        }
        let mut buf = [0u8; 16];
        let _ = tokio::time::timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await;
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn is_open(&self, _ip: IpAddr, port: u16, _timeout: Duration) -> bool {
        self.flush().await;
        lock(&self.state).ports.contains_key(&port)
    }
}

/// An in-memory name server that records every call.
#[derive(Default)]
pub struct RecordingDnsProvider {
    inner: Mutex<DnsState>,
}

#[derive(Default)]
struct DnsState {
    records: BTreeMap<String, BTreeSet<String>>,
    history: BTreeMap<String, Vec<BTreeSet<String>>>,
    calls: Vec<String>,
    failing: bool,
}

impl DnsState {
    fn call(&mut self, call: String) -> Result<(), DnsError> {
        self.calls.push(call);
        if self.failing {
            return Err(DnsError::RequestFailed("provider is down".to_string()));
        }
        Ok(())
    }

    fn snapshot(&mut self, name: &str) {
        let answers = self.records.get(name).cloned().unwrap_or_default();
        self.history.entry(name.to_string()).or_default().push(answers);
    }
}

impl RecordingDnsProvider {
    pub fn answers(&self, name: &str) -> BTreeSet<String> {
        lock(&self.inner).records.get(name).cloned().unwrap_or_default()
    }

    /// Answers after each change of `name`, oldest first.
    pub fn history(&self, name: &str) -> Vec<BTreeSet<String>> {
        lock(&self.inner).history.get(name).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.inner).calls.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        lock(&self.inner).failing = failing;
    }
}

#[async_trait]
impl DnsProvider for RecordingDnsProvider {
    async fn list_records(&self, record_type: &str, name: &str) -> Result<Vec<DnsRecordEntry>, DnsError> {
        let mut state = lock(&self.inner);
        state.call(format!("list {record_type} {name}"))?;
        Ok(state
            .records
            .get(name)
            .into_iter()
            .flatten()
            .map(|content| DnsRecordEntry {
                id: None,
                record_type: record_type.to_string(),
                name: name.to_string(),
                content: content.clone(),
            })
            .collect())
    }

    async fn create_record(&self, record_type: &str, name: &str, content: &str) -> Result<bool, DnsError> {
        let mut state = lock(&self.inner);
        state.call(format!("create {record_type} {name} {content}"))?;
        state
            .records
            .entry(name.to_string())
            .or_default()
            .insert(content.to_string());
        state.snapshot(name);
        Ok(true)
    }

    async fn update_record(&self, record_type: &str, name: &str, content: &str) -> Result<bool, DnsError> {
        let mut state = lock(&self.inner);
        state.call(format!("update {record_type} {name} {content}"))?;
        state
            .records
            .insert(name.to_string(), BTreeSet::from([content.to_string()]));
        state.snapshot(name);
        Ok(true)
    }

    async fn delete_record(
        &self,
        record_type: &str,
        name: &str,
        content: Option<&str>,
    ) -> Result<bool, DnsError> {
        let mut state = lock(&self.inner);
        state.call(format!("delete {record_type} {name} {}", content.unwrap_or("*")))?;
        match content {
            Some(content) => {
                if let Some(answers) = state.records.get_mut(name) {
                    answers.remove(content);
                }
            }
            None => {
                state.records.remove(name);
            }
        }
        state.snapshot(name);
        Ok(true)
    }
}

/// Remembers which nodes asked for a new address.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<String> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl IpChangePublisher for RecordingPublisher {
    async fn publish(&self, node: &NodeModel) -> Result<(), RotationError> {
        lock(&self.published).push(node.name.clone());
        Ok(())
    }
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        port_begin: 8000,
        port_end: 9000,
        timeout_local: 0.3,
        retry_delay: 0.0,
        reset_pause: 0.0,
        rotate_dns_wait: 0,
        rotate_capture_wait: 0,
        ssserver_bin: "/nonexistent/ssserver".to_string(),
        ..ServiceConfig::default()
    }
}

pub fn new_account(port: u16) -> NewAccount {
    NewAccount {
        port,
        password: "secret".to_string(),
        full_name: None,
        email: None,
        is_active: true,
    }
}

/// A wired fleet with one node, "a" at 1.2.3.4, whose manager is the fake
/// daemon on localhost.
pub struct Harness {
    pub daemon: FakeDaemon,
    pub config: ConfigHandle,
    pub store: Arc<FleetStore>,
    pub ctx: Arc<ManagerContext>,
    pub reconciler: Arc<Reconciler>,
    pub dns: Arc<DnsSynchronizer>,
    pub dns_provider: Arc<RecordingDnsProvider>,
    pub fleet: Arc<Fleet>,
    pub locks: Arc<LocalLockService>,
    pub statistics: Arc<StatisticsEngine>,
    pub publisher: Arc<RecordingPublisher>,
    pub rotator: IpRotator,
    pub node: NodeModel,
}

impl Harness {
    pub async fn new(edition: ServerEdition) -> Self {
        Self::with_config(edition, test_config()).await
    }

    pub async fn with_config(edition: ServerEdition, config: ServiceConfig) -> Self {
        Self::with_daemon(FakeDaemon::start(edition).await, config).await
    }

    pub async fn with_daemon(daemon: FakeDaemon, config: ServiceConfig) -> Self {
        let config = ConfigHandle::fixed(config);
        let store = Arc::new(FleetStore::new());
        let ctx = Arc::new(ManagerContext::new(config.clone(), Arc::new(daemon.probe())));
        let reconciler = Arc::new(Reconciler::new(store.clone(), ctx.clone()));
        let dns_provider = Arc::new(RecordingDnsProvider::default());
        let dns = Arc::new(DnsSynchronizer::new(store.clone(), Some(dns_provider.clone())));
        let fleet = Arc::new(Fleet::new(
            store.clone(),
            reconciler.clone(),
            dns.clone(),
            config.clone(),
        ));
        let locks = Arc::new(LocalLockService::new());
        let statistics = Arc::new(StatisticsEngine::new(
            store.clone(),
            reconciler.clone(),
            locks.clone(),
            config.clone(),
        ));
        let publisher = Arc::new(RecordingPublisher::default());
        let rotator = IpRotator::new(store.clone(), fleet.clone(), publisher.clone(), config.clone());

        let node = fleet
            .create_node(NewNode {
                name: "a".to_string(),
                public_ip: Some("1.2.3.4".parse().unwrap()),
                private_ip: None,
                location: None,
                is_active: true,
                record_id: None,
                ip_change_webhook: None,
            })
            .await
            .unwrap();
        fleet
            .set_manager(
                node.id,
                ManagerSettings {
                    interface: Interface::Localhost,
                    port: daemon.port(),
                    server_edition: daemon.edition(),
                    ..ManagerSettings::default()
                },
            )
            .await
            .unwrap();

        Self {
            daemon,
            config,
            store,
            ctx,
            reconciler,
            dns,
            dns_provider,
            fleet,
            locks,
            statistics,
            publisher,
            rotator,
            node,
        }
    }

    /// A client for node "a".
    pub async fn client(&self) -> ManagerClient {
        let manager = self.store.manager_for_node(self.node.id).await.unwrap();
        self.ctx.client(self.node.clone(), manager)
    }
}
