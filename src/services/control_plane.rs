use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ConfigHandle;
use crate::db::FleetStore;
use crate::dns::{DnsProvider, DnsSynchronizer, NameComProvider};
use crate::manager::{ManagerContext, PortProbe, TcpProbe};
use crate::reconciler::Reconciler;
use crate::rotation::{IpChangePublisher, IpRotator, WebhookPublisher};
use crate::services::Fleet;
use crate::statistics::{LocalLockService, LockService, StatisticsEngine};

/// Every long-lived component of the process, wired together.
pub struct ControlPlane {
    pub config: ConfigHandle,
    pub store: Arc<FleetStore>,
    pub context: Arc<ManagerContext>,
    pub reconciler: Arc<Reconciler>,
    pub dns: Arc<DnsSynchronizer>,
    pub fleet: Arc<Fleet>,
    pub statistics: Arc<StatisticsEngine>,
    pub rotator: Arc<IpRotator>,
}

impl ControlPlane {
    /// Production wiring: TCP probes, the configured name.com account,
    /// webhook publishing and in-process locks.
    pub fn new(config: ConfigHandle) -> Self {
        let dns_provider: Option<Arc<dyn DnsProvider>> = match config.get().dns.clone() {
            Some(dns) => {
                info!(zone = %dns.zone, "DNS provider configured.");
                Some(Arc::new(NameComProvider::new(dns)))
            }
            None => {
                warn!("No DNS provider configured, DNS records will not be updated.");
                None
            }
        };
        Self::with_parts(
            config,
            Arc::new(TcpProbe),
            dns_provider,
            Arc::new(WebhookPublisher::new()),
            Arc::new(LocalLockService::new()),
        )
    }

    pub fn with_parts(
        config: ConfigHandle,
        probe: Arc<dyn PortProbe>,
        dns_provider: Option<Arc<dyn DnsProvider>>,
        publisher: Arc<dyn IpChangePublisher>,
        locks: Arc<dyn LockService>,
    ) -> Self {
        let store = Arc::new(FleetStore::new());
        let context = Arc::new(ManagerContext::new(config.clone(), probe));
        let reconciler = Arc::new(Reconciler::new(store.clone(), context.clone()));
        let dns = Arc::new(DnsSynchronizer::new(store.clone(), dns_provider));
        let fleet = Arc::new(Fleet::new(
            store.clone(),
            reconciler.clone(),
            dns.clone(),
            config.clone(),
        ));
        let statistics = Arc::new(StatisticsEngine::new(
            store.clone(),
            reconciler.clone(),
            locks,
            config.clone(),
        ));
        let rotator = Arc::new(IpRotator::new(
            store.clone(),
            fleet.clone(),
            publisher,
            config.clone(),
        ));
        Self {
            config,
            store,
            context,
            reconciler,
            dns,
            fleet,
            statistics,
            rotator,
        }
    }
}
