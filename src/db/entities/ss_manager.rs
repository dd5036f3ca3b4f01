use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::enums::{Interface, ServerEdition};

/// Manager API endpoint of a node. A node has at most one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i32,
    pub node_id: i32,
    pub interface: Interface,
    pub port: u16,
    pub encrypt: String,
    pub timeout: u32,
    pub fastopen: bool,
    pub server_edition: ServerEdition,
    pub is_server_enabled: bool, // python edition only
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
