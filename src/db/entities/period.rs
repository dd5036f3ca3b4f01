use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    Monthly,
    Yearly,
    Total,
}

/// A statistics time bucket.
///
/// Both parts empty is the all-time total, an empty month is a whole year and
/// both parts set is a single month. The fields are private so that a month
/// without a year cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    year: Option<i32>,
    month: Option<u32>,
}

impl Period {
    pub fn monthly(year: i32, month: u32) -> Self {
        Self {
            year: Some(year),
            month: Some(month.clamp(1, 12)),
        }
    }

    pub fn yearly(year: i32) -> Self {
        Self {
            year: Some(year),
            month: None,
        }
    }

    pub fn total() -> Self {
        Self {
            year: None,
            month: None,
        }
    }

    pub fn monthly_at(ts: DateTime<Utc>) -> Self {
        Self::monthly(ts.year(), ts.month())
    }

    pub fn year(&self) -> Option<i32> {
        self.year
    }

    pub fn month(&self) -> Option<u32> {
        self.month
    }

    pub fn granularity(&self) -> Granularity {
        match (self.year, self.month) {
            (Some(_), Some(_)) => Granularity::Monthly,
            (Some(_), None) => Granularity::Yearly,
            _ => Granularity::Total,
        }
    }

    /// Whether `child` is one of the buckets this period is summed from.
    pub fn is_parent_of(&self, child: &Period) -> bool {
        match (self.granularity(), child.granularity()) {
            (Granularity::Yearly, Granularity::Monthly) => self.year == child.year,
            (Granularity::Total, Granularity::Yearly) => true,
            _ => false,
        }
    }

    /// The parent bucket one level up, `None` for the total.
    pub fn parent(&self) -> Option<Period> {
        match self.granularity() {
            Granularity::Monthly => self.year.map(Period::yearly),
            Granularity::Yearly => Some(Period::total()),
            Granularity::Total => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.year, self.month) {
            (Some(year), Some(month)) => write!(f, "{year}-{month:02}"),
            (Some(year), None) => write!(f, "{year}"),
            _ => write!(f, "Total"),
        }
    }
}
