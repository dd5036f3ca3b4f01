pub mod namecom;
pub mod provider;
pub mod sync;

pub use namecom::NameComProvider;
pub use provider::{DnsError, DnsProvider, DnsRecordEntry};
pub use sync::{DnsSyncOutcome, DnsSynchronizer};
