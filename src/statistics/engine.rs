use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::consolidation::{self, Memberships};
use super::lock::{LockError, LockService};
use crate::config::ConfigHandle;
use crate::db::FleetStore;
use crate::db::entities::prelude::{Granularity, Period, StatTarget, StatisticModel};
use crate::manager::PingReply;
use crate::reconciler::{Reconciler, SyncOutcome};

pub const COLLECT_LOCK: &str = "statistic.collect";
pub const STATISTIC_LOCK: &str = "statistic.statistic";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    Collected { nodes: usize, rows: usize },
    /// Another collection holds the lock.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticOutcome {
    Done { collect: CollectOutcome, consolidated: usize },
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResetReport {
    pub removed: usize,
    pub restored: usize,
}

/// Folds a fresh counter reading into a leaf row.
///
/// A reading below the stored live value means the daemon counter restarted,
/// so the stored live value moves to `transferred_past` first.
pub fn apply_live_reading(row: &mut StatisticModel, reading: u64, ts: DateTime<Utc>) {
    if reading < row.transferred_live {
        // Counter reset
        row.transferred_past = row.transferred_past.saturating_add(row.transferred_live);
    }
    row.transferred_live = reading;
    row.dt_collected = Some(ts);
}

pub struct StatisticsEngine {
    store: Arc<FleetStore>,
    reconciler: Arc<Reconciler>,
    locks: Arc<dyn LockService>,
    config: ConfigHandle,
}

impl StatisticsEngine {
    pub fn new(
        store: Arc<FleetStore>,
        reconciler: Arc<Reconciler>,
        locks: Arc<dyn LockService>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            store,
            reconciler,
            locks,
            config,
        }
    }

    pub async fn collect(&self) -> CollectOutcome {
        self.collect_at(Utc::now()).await
    }

    /// Reads live counters of every active node into this month's
    /// assignment rows. Skips if a collection is already running.
    #[instrument(skip(self))]
    pub async fn collect_at(&self, ts: DateTime<Utc>) -> CollectOutcome {
        let Some(_guard) = self.locks.try_acquire(COLLECT_LOCK) else {
            info!("Collection already running, skipped.");
            return CollectOutcome::Skipped;
        };

        let period = Period::monthly_at(ts);
        let (mut nodes, mut rows) = (0, 0);
        for node in self.store.nodes().await.into_iter().filter(|n| n.is_active) {
            let Some(manager) = self.store.manager_for_node(node.id).await else {
                continue;
            };
            let client = self.reconciler.context().client(node.clone(), manager);
            let stats = match client.ping_cached(false).await {
                Some(reply @ PingReply::Stats(_)) => reply,
                Some(PingReply::Ack) => {
                    debug!(node = %node.name, "Manager reports no counters.");
                    continue;
                }
                None => {
                    warn!(node = %node.name, manager = %client, "No statistics, manager is not available.");
                    continue;
                }
            };
            nodes += 1;

            for view in self.store.views_for_node(node.id).await {
                if !view.desired() {
                    continue;
                }
                let target = StatTarget::NodeAccount(view.assignment.id);
                let mut row = self.store.statistic_or_default(period, target).await;
                let reading = stats.transferred(view.account.port).unwrap_or(0);
                apply_live_reading(&mut row, reading, ts);
                self.store.save_statistic(row).await;
                rows += 1;
            }
        }
        info!(nodes = nodes, rows = rows, period = %period, "Collection finished.");
        CollectOutcome::Collected { nodes, rows }
    }

    /// Rebuilds the current month, year and total rows from their children.
    ///
    /// Phases run Monthly, Yearly, then Total, each against a fresh snapshot
    /// so that parents only ever see children of the finished phase.
    pub async fn consolidate_at(&self, ts: DateTime<Utc>) -> usize {
        let memberships: Memberships = self.store.memberships().await;
        let node_ids: Vec<i32> = self
            .store
            .nodes()
            .await
            .into_iter()
            .filter(|n| n.is_active)
            .map(|n| n.id)
            .collect();
        let account_ids: Vec<i32> = self
            .store
            .accounts()
            .await
            .into_iter()
            .filter(|a| a.is_active)
            .map(|a| a.id)
            .collect();

        let mut written = 0;
        for granularity in [Granularity::Monthly, Granularity::Yearly, Granularity::Total] {
            let period = match granularity {
                Granularity::Monthly => Period::monthly_at(ts),
                Granularity::Yearly => Period::yearly(ts.year()),
                Granularity::Total => Period::total(),
            };

            let mut targets: Vec<StatTarget> = Vec::new();
            if granularity != Granularity::Monthly {
                targets.extend(memberships.keys().map(|id| StatTarget::NodeAccount(*id)));
            }
            targets.extend(node_ids.iter().map(|id| StatTarget::Node(*id)));
            targets.extend(account_ids.iter().map(|id| StatTarget::Account(*id)));
            targets.push(StatTarget::Fleet);

            let snapshot = self.store.statistics().await;
            for target in targets {
                if let Some(row) = consolidation::consolidate(period, target, &snapshot, &memberships) {
                    self.store.save_statistic(row).await;
                    written += 1;
                }
            }
        }
        debug!(rows = written, "Consolidation finished.");
        written
    }

    pub async fn statistic(&self) -> StatisticOutcome {
        self.statistic_at(Utc::now()).await
    }

    /// Collects, then consolidates. Skips if a run is already in progress.
    #[instrument(skip(self))]
    pub async fn statistic_at(&self, ts: DateTime<Utc>) -> StatisticOutcome {
        let Some(_guard) = self.locks.try_acquire(STATISTIC_LOCK) else {
            info!("Statistic already running, skipped.");
            return StatisticOutcome::Skipped;
        };
        let collect = self.collect_at(ts).await;
        let consolidated = self.consolidate_at(ts).await;
        StatisticOutcome::Done {
            collect,
            consolidated,
        }
    }

    /// Removes and re-adds every desired port so the daemons start counting
    /// from zero. Waits for a running collection, up to the configured bound.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<ResetReport, LockError> {
        let config = self.config.get();
        let _guard = self
            .locks
            .acquire(COLLECT_LOCK, config.reset_lock_timeout())
            .await?;

        let views: Vec<_> = self
            .store
            .all_views()
            .await
            .into_iter()
            .filter(|view| view.desired())
            .collect();

        let mut report = ResetReport::default();
        for view in &views {
            if self.reconciler.ensure_absent(view, view.account.port).await == SyncOutcome::Absent {
                report.removed += 1;
            }
        }
        // Let the removals take effect before recreating.
        let pause = config.reset_pause();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        for view in &views {
            if self.reconciler.apply(view).await == SyncOutcome::Present {
                report.restored += 1;
            }
        }
        info!(removed = report.removed, restored = report.restored, "Reset finished.");
        Ok(report)
    }

    /// The all-time row of `target`, zero if nothing was collected yet.
    pub async fn total_for(&self, target: StatTarget) -> StatisticModel {
        self.store.statistic_or_default(Period::total(), target).await
    }
}
