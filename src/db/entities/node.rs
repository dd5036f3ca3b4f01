use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::db::enums::Interface;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i32,
    pub name: String,
    pub public_ip: Option<IpAddr>,
    pub private_ip: Option<IpAddr>,
    pub location: Option<String>,
    pub is_active: bool,
    pub record_id: Option<i32>, // DNS record shared with other nodes
    pub ip_change_webhook: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// The address this node exposes on the given interface.
    pub fn ip_for_interface(&self, interface: Interface) -> Option<IpAddr> {
        match interface {
            Interface::Localhost => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            Interface::Private => self.private_ip,
            Interface::Public => self.public_ip,
        }
    }
}
