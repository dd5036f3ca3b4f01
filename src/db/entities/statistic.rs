use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::period::Period;

/// What a statistics row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatTarget {
    NodeAccount(i32),
    Node(i32),
    Account(i32),
    Fleet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKind {
    NodeAccount,
    Node,
    Account,
    Fleet,
}

impl StatTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            StatTarget::NodeAccount(_) => TargetKind::NodeAccount,
            StatTarget::Node(_) => TargetKind::Node,
            StatTarget::Account(_) => TargetKind::Account,
            StatTarget::Fleet => TargetKind::Fleet,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl fmt::Display for StatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatTarget::NodeAccount(id) | StatTarget::Node(id) | StatTarget::Account(id) => {
                write!(f, "{}#{id}", self.kind())
            }
            StatTarget::Fleet => write!(f, "Fleet"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub period: Period,
    pub target: StatTarget,
    pub transferred_past: u64, // accumulated before the last counter reset
    pub transferred_live: u64,
    pub dt_collected: Option<DateTime<Utc>>,
}

impl Model {
    pub fn empty(period: Period, target: StatTarget) -> Self {
        Self {
            period,
            target,
            transferred_past: 0,
            transferred_live: 0,
            dt_collected: None,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred_past.saturating_add(self.transferred_live)
    }
}
