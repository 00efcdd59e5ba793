use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use infra::documents::{DocMeta, HasMeta};
use infra::ids::{Entity, Id};

use crate::error::ValidationError;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MonthlyReport {
    #[serde(flatten)]
    pub(crate) meta: DocMeta<MonthlyReport>,
    /// Start of the reporting window.
    pub month: DateTime<Utc>,
    pub total_served: u64,
    pub total_possible: u64,
    /// Percentage of the possible portions that went unserved.
    pub discrepancy: f64,
    pub created_at: DateTime<Utc>,
}

impl MonthlyReport {
    pub fn id(&self) -> Id<MonthlyReport> {
        self.meta.id
    }
}

/// Midnight on the first of the month containing `now`, as seen from
/// `offset`.
pub fn month_start(now: DateTime<Utc>, offset: FixedOffset) -> Result<DateTime<Utc>, ValidationError> {
    let local = now.with_timezone(&offset);
    offset
        .with_ymd_and_hms(local.year(), local.month(), 1, 0, 0, 0)
        .single()
        .map(|start| start.with_timezone(&Utc))
        .ok_or_else(|| ValidationError::new(format!("no month start for {}", local)))
}

/// Nothing possible counts as one possible portion, so an empty kitchen
/// reports rather than dividing by zero.
pub fn discrepancy_rate(total_served: u64, total_possible: u64) -> f64 {
    let possible = total_possible.max(1) as f64;
    (possible - total_served as f64) / possible * 100.0
}

impl Entity for MonthlyReport {
    const PREFIX: &'static str = "report";
}

impl HasMeta for MonthlyReport {
    fn meta(&self) -> &DocMeta<Self> {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut DocMeta<Self> {
        &mut self.meta
    }
}
