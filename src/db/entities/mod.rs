pub mod account;
pub mod dns_record;
pub mod node;
pub mod node_account;
pub mod period;
pub mod ss_manager;
pub mod statistic;

pub mod prelude {
    pub use super::account::Model as AccountModel;

    pub use super::dns_record::Model as DnsRecordModel;

    pub use super::node::Model as NodeModel;

    pub use super::node_account::Model as NodeAccountModel;

    pub use super::period::{Granularity, Period};

    pub use super::ss_manager::Model as SsManagerModel;

    pub use super::statistic::{Model as StatisticModel, StatTarget, TargetKind};
}
