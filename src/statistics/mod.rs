pub mod consolidation;
pub mod engine;
pub mod lock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::AssignmentView;
use crate::db::entities::prelude::{AccountModel, NodeAccountModel, NodeModel, StatTarget};

pub use engine::{
    COLLECT_LOCK, CollectOutcome, ResetReport, STATISTIC_LOCK, StatisticOutcome, StatisticsEngine,
    apply_live_reading,
};
pub use lock::{LocalLockService, LockError, LockGuard, LockService};

/// All-time transfer figures of a node, an account or an assignment.
#[async_trait]
pub trait Statisticable: Sync {
    fn stat_target(&self) -> StatTarget;

    async fn transferred_past(&self, engine: &StatisticsEngine) -> u64 {
        engine.total_for(self.stat_target()).await.transferred_past
    }

    async fn transferred_live(&self, engine: &StatisticsEngine) -> u64 {
        engine.total_for(self.stat_target()).await.transferred_live
    }

    async fn transferred_total(&self, engine: &StatisticsEngine) -> u64 {
        engine.total_for(self.stat_target()).await.transferred()
    }

    async fn last_collected(&self, engine: &StatisticsEngine) -> Option<DateTime<Utc>> {
        engine.total_for(self.stat_target()).await.dt_collected
    }
}

impl Statisticable for NodeModel {
    fn stat_target(&self) -> StatTarget {
        StatTarget::Node(self.id)
    }
}

impl Statisticable for AccountModel {
    fn stat_target(&self) -> StatTarget {
        StatTarget::Account(self.id)
    }
}

impl Statisticable for NodeAccountModel {
    fn stat_target(&self) -> StatTarget {
        StatTarget::NodeAccount(self.id)
    }
}

impl Statisticable for AssignmentView {
    fn stat_target(&self) -> StatTarget {
        self.assignment.stat_target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::ServerEdition;
    use crate::test_support::{Harness, new_account};

    #[tokio::test]
    async fn test_entities_read_their_totals() {
        let h = Harness::new(ServerEdition::Libev).await;
        let account = h.fleet.create_account(new_account(8381)).await.unwrap();
        let view = h.fleet.create_assignment(h.node.id, account.id, true).await.unwrap();

        assert_eq!(account.transferred_total(&h.statistics).await, 0);
        assert_eq!(view.last_collected(&h.statistics).await, None);

        h.daemon.set_counter(8381, 4096);
        h.statistics.statistic().await;

        assert_eq!(view.transferred_live(&h.statistics).await, 4096);
        assert_eq!(view.assignment.transferred_past(&h.statistics).await, 0);
        assert_eq!(h.node.transferred_total(&h.statistics).await, 4096);
        assert_eq!(account.transferred_total(&h.statistics).await, 4096);
        assert!(account.last_collected(&h.statistics).await.is_some());
    }
}
