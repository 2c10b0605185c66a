use std::fmt::Display;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointStatus::NotStarted => "not_started",
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Durable progress of a migration run. Progress is only ever committed a whole day at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub status: CheckpointStatus,
    pub total_records: u64,
    pub oldest_timestamp: DateTime<Utc>,
    pub newest_timestamp: DateTime<Utc>,
    pub last_migrated_date: Option<NaiveDate>,
    pub records_migrated: u64,
    pub records_failed: u64,
    pub batches_sent: u64,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

impl CheckpointState {
    pub fn new(
        total_records: u64,
        oldest_timestamp: DateTime<Utc>,
        newest_timestamp: DateTime<Utc>,
        dry_run: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            last_updated: now,
            status: CheckpointStatus::NotStarted,
            total_records,
            oldest_timestamp,
            newest_timestamp,
            last_migrated_date: None,
            records_migrated: 0,
            records_failed: 0,
            batches_sent: 0,
            errors: Vec::new(),
            dry_run,
        }
    }

    /// First day that still needs migrating.
    pub fn resume_date(&self, start: NaiveDate) -> NaiveDate {
        match self.last_migrated_date {
            Some(last) => last
                .checked_add_days(Days::new(1))
                .unwrap_or(NaiveDate::MAX)
                .max(start),
            None => start,
        }
    }

    pub fn progress_percent(&self) -> Option<f64> {
        if self.total_records == 0 {
            return None;
        }
        Some(self.records_migrated as f64 / self.total_records as f64 * 100.0)
    }
}
