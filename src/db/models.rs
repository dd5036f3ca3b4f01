use serde::Deserialize;
use std::net::IpAddr;

use crate::db::enums::{Interface, ServerEdition};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewAccount {
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewNode {
    pub name: String,
    #[serde(default)]
    pub public_ip: Option<IpAddr>,
    #[serde(default)]
    pub private_ip: Option<IpAddr>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub record_id: Option<i32>,
    #[serde(default)]
    pub ip_change_webhook: Option<String>,
}

/// Settings of a node's manager endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub interface: Interface,
    pub port: u16,
    pub encrypt: String,
    pub timeout: u32,
    pub fastopen: bool,
    pub server_edition: ServerEdition,
    pub is_server_enabled: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            interface: Interface::Localhost,
            port: 6001,
            encrypt: "aes-256-cfb".to_string(),
            timeout: 30,
            fastopen: false,
            server_edition: ServerEdition::Libev,
            is_server_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewRecord {
    #[serde(default)]
    pub host: String,
    pub domain: String,
    #[serde(default = "default_record_type")]
    pub record_type: String,
    #[serde(default)]
    pub answer: Option<String>,
}

fn default_record_type() -> String {
    "A".to_string()
}
