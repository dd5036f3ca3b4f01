use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assignment of one account to one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i32,
    pub node_id: i32,
    pub account_id: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
