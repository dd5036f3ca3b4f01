use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use super::provider::{DnsError, DnsProvider, DnsRecordEntry};
use crate::config::DnsProviderConfig;

const DEFAULT_TTL: u32 = 300;

#[derive(Debug, Deserialize)]
struct NameComRecord {
    id: i64,
    #[serde(default)]
    host: String,
    #[serde(rename = "type")]
    record_type: String,
    answer: String,
}

#[derive(Debug, Default, Deserialize)]
struct RecordList {
    #[serde(default)]
    records: Vec<NameComRecord>,
}

#[derive(Serialize)]
struct RecordBody<'a> {
    host: &'a str,
    #[serde(rename = "type")]
    record_type: &'a str,
    answer: &'a str,
    ttl: u32,
}

/// name.com v4 REST API, one zone per provider.
pub struct NameComProvider {
    client: Client,
    config: DnsProviderConfig,
}

impl NameComProvider {
    pub fn new(config: DnsProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Host part of `name` relative to the zone, empty for the apex.
    fn host_for(&self, name: &str) -> Result<String, DnsError> {
        let name = name.trim_end_matches('.').to_lowercase();
        let zone = self.config.zone.trim_end_matches('.').to_lowercase();
        if name == zone {
            return Ok(String::new());
        }
        match name.strip_suffix(&format!(".{zone}")) {
            Some(host) => Ok(host.to_string()),
            None => Err(DnsError::OutsideZone {
                name: name.clone(),
                zone: self.config.zone.clone(),
            }),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/domains/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.zone,
            path
        );
        self.client
            .request(method, url)
            .basic_auth(&self.config.user, Some(&self.config.token))
    }

    async fn check(response: Response, action: &'static str, name: &str) -> Result<Response, DnsError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        Err(DnsError::Rejected {
            action,
            name: name.to_string(),
            reason: format!("non-success status: {status}. Body: {body}"),
        })
    }

    async fn fetch(&self, record_type: &str, name: &str) -> Result<Vec<NameComRecord>, DnsError> {
        let host = self.host_for(name)?;
        let response = self.request(Method::GET, "records").send().await?;
        let list: RecordList = Self::check(response, "list", name).await?.json().await?;
        Ok(list
            .records
            .into_iter()
            .filter(|r| r.record_type.eq_ignore_ascii_case(record_type) && r.host.eq_ignore_ascii_case(&host))
            .collect())
    }

    fn body<'a>(host: &'a str, record_type: &'a str, content: &'a str) -> RecordBody<'a> {
        RecordBody {
            host,
            record_type,
            answer: content,
            ttl: DEFAULT_TTL,
        }
    }
}

#[async_trait]
impl DnsProvider for NameComProvider {
    async fn list_records(&self, record_type: &str, name: &str) -> Result<Vec<DnsRecordEntry>, DnsError> {
        Ok(self
            .fetch(record_type, name)
            .await?
            .into_iter()
            .map(|r| DnsRecordEntry {
                id: Some(r.id),
                record_type: r.record_type,
                name: name.to_string(),
                content: r.answer,
            })
            .collect())
    }

    async fn create_record(&self, record_type: &str, name: &str, content: &str) -> Result<bool, DnsError> {
        let host = self.host_for(name)?;
        let response = self
            .request(Method::POST, "records")
            .json(&Self::body(&host, record_type, content))
            .send()
            .await?;
        Self::check(response, "create", name).await?;
        Ok(true)
    }

    async fn update_record(&self, record_type: &str, name: &str, content: &str) -> Result<bool, DnsError> {
        let existing = self.fetch(record_type, name).await?;
        let Some(record) = existing.first() else {
            return self.create_record(record_type, name, content).await;
        };
        let host = self.host_for(name)?;
        let response = self
            .request(Method::PUT, &format!("records/{}", record.id))
            .json(&Self::body(&host, record_type, content))
            .send()
            .await?;
        Self::check(response, "update", name).await?;
        Ok(true)
    }

    async fn delete_record(
        &self,
        record_type: &str,
        name: &str,
        content: Option<&str>,
    ) -> Result<bool, DnsError> {
        let targets: Vec<_> = self
            .fetch(record_type, name)
            .await?
            .into_iter()
            .filter(|r| content.map_or(true, |c| r.answer.eq_ignore_ascii_case(c)))
            .collect();
        for record in &targets {
            let response = self
                .request(Method::DELETE, &format!("records/{}", record.id))
                .send()
                .await?;
            Self::check(response, "delete", name).await?;
        }
        Ok(!targets.is_empty())
    }
}
