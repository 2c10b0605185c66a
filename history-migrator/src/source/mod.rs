use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use futures::stream::BoxStream;

use crate::error::SourceError;

pub mod fields;
pub mod flux;
pub mod influx;

pub use fields::FieldSelection;
pub use influx::InfluxSource;

/// Field holding a sensor's primary reading. Other fields are attributes.
pub const DEFAULT_FIELD: &str = "value";
pub const UNKNOWN_TAG: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub timestamp: DateTime<Utc>,
    pub domain: String,
    pub entity_id: String,
    pub display_name: Option<String>,
    pub unit: String,
    pub field: String,
    pub value: f64,
}

/// A string-valued point, used for enum-like attributes such as a thermostat's action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub timestamp: DateTime<Utc>,
    pub domain: String,
    pub entity_id: String,
    pub display_name: Option<String>,
    pub state: String,
}

pub type RecordStream<'a> = BoxStream<'a, Result<SourceRecord, SourceError>>;
pub type StateStream<'a> = BoxStream<'a, Result<StateRecord, SourceError>>;

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Oldest and newest timestamps over default-field records.
    async fn time_range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), SourceError>;

    async fn count_records(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<u64, SourceError>;

    /// Records in `[start, end)`, in delivery order. The stream is single pass.
    async fn query_range<'a>(
        &'a self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RecordStream<'a>, SourceError>;

    async fn query_states<'a>(
        &'a self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        domain: &str,
        field: &str,
    ) -> Result<StateStream<'a>, SourceError>;

    async fn query_day<'a>(&'a self, day: NaiveDate) -> Result<RecordStream<'a>, SourceError> {
        let (start, end) = day_window(day);
        self.query_range(start, end).await
    }
}

/// `[00:00, next day 00:00)` in UTC.
pub fn day_window(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
    let next = day.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX);
    (start, next.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Inclusive day iterator.
pub fn days_between(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |day| *day <= end)
}
