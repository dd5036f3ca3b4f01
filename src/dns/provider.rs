use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("DNS API request failed: {0}")]
    RequestFailed(String),
    #[error("DNS API rejected {action} of {name}: {reason}")]
    Rejected {
        action: &'static str,
        name: String,
        reason: String,
    },
    #[error("Record {name} is outside the zone {zone}")]
    OutsideZone { name: String, zone: String },
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// One answer of a DNS record as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordEntry {
    pub id: Option<i64>,
    pub record_type: String,
    pub name: String,
    pub content: String,
}

/// The record operations a name server API has to offer.
///
/// `name` is always the fully qualified record name. The boolean results
/// report whether the provider accepted the change.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn list_records(&self, record_type: &str, name: &str) -> Result<Vec<DnsRecordEntry>, DnsError>;

    async fn create_record(&self, record_type: &str, name: &str, content: &str) -> Result<bool, DnsError>;

    /// Replaces the single answer of the record.
    async fn update_record(&self, record_type: &str, name: &str, content: &str) -> Result<bool, DnsError>;

    /// Deletes one answer, or every answer when `content` is `None`.
    async fn delete_record(
        &self,
        record_type: &str,
        name: &str,
        content: Option<&str>,
    ) -> Result<bool, DnsError>;
}
