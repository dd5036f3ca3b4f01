use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A proxy identity. The port doubles as the account's unique key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: i32,
    pub port: u16,
    pub password: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
