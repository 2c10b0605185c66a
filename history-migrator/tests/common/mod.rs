//! Shared fixtures for the pipeline tests: an in-memory source, a recording sink and a
//! small ruleset.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::{stream, StreamExt};
use history_migrator::{
    emit::{DestinationRecord, Sink, SinkStats},
    error::{SinkError, SourceError},
    mapping::{known::KnownMetricSet, ruleset::MappingRuleset, MappingEngine},
    source::{day_window, RecordSource, RecordStream, SourceRecord, StateRecord, StateStream},
};

pub const RULESET: &str = r#"
namespace: ha
labels:
  computed:
    entity:
      template: "{domain}.{entity_id}"
metric_mappings:
  sensor:
    "°C":
      metric: ha_sensor_temperature_celsius
    "rpm":
      metric: ha_sensor_fan_speed_rpm
  binary_sensor:
    units:
      ignore: true
field_mappings:
  climate:
    current_temperature:
      metric: ha_climate_current_temperature_celsius
special_mappings: {}
"#;

pub const KNOWN_METRICS: [&str; 2] = [
    "ha_sensor_temperature_celsius",
    "ha_climate_current_temperature_celsius",
];

pub fn engine() -> Arc<MappingEngine> {
    let ruleset = MappingRuleset::from_yaml_str(RULESET).unwrap();
    let known: KnownMetricSet = KNOWN_METRICS.into_iter().collect();
    Arc::new(MappingEngine::new(ruleset, known))
}

pub fn day(month: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, month, d).unwrap()
}

pub fn at(day: NaiveDate, hour: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_hms_opt(hour, 0, 0).unwrap())
}

pub fn record(
    timestamp: DateTime<Utc>,
    domain: &str,
    unit: &str,
    entity_id: &str,
    value: f64,
) -> SourceRecord {
    SourceRecord {
        timestamp,
        domain: domain.to_string(),
        entity_id: entity_id.to_string(),
        display_name: None,
        unit: unit.to_string(),
        field: "value".to_string(),
        value,
    }
}

pub fn temperature(timestamp: DateTime<Utc>, value: f64) -> SourceRecord {
    record(timestamp, "sensor", "°C", "temperature_living_room", value)
}

/// Serves records out of memory, filtered by time window. Remembers which windows were
/// asked for, and can be told to fail on one day.
#[derive(Default)]
pub struct VecSource {
    pub records: Vec<SourceRecord>,
    pub states: Vec<StateRecord>,
    pub fail_on: Option<NaiveDate>,
    pub queried: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl VecSource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, day: NaiveDate) -> Self {
        self.fail_on = Some(day);
        self
    }

    fn check_failure(&self, start: DateTime<Utc>) -> Result<(), SourceError> {
        match self.fail_on {
            Some(fail) if day_window(fail).0 == start => {
                Err(SourceError::Decode(format!("injected failure for {fail}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn time_range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), SourceError> {
        let first = self.records.iter().map(|r| r.timestamp).min();
        let last = self.records.iter().map(|r| r.timestamp).max();
        first.zip(last).ok_or(SourceError::Empty)
    }

    async fn count_records(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<u64, SourceError> {
        Ok(self
            .records
            .iter()
            .filter(|r| start.map_or(true, |s| r.timestamp >= s))
            .filter(|r| end.map_or(true, |e| r.timestamp < e))
            .count() as u64)
    }

    async fn query_range<'a>(
        &'a self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RecordStream<'a>, SourceError> {
        self.queried.lock().unwrap().push(start);
        self.check_failure(start)?;
        let records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .cloned()
            .map(Ok)
            .collect();
        Ok(stream::iter(records).boxed())
    }

    async fn query_states<'a>(
        &'a self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        domain: &str,
        _field: &str,
    ) -> Result<StateStream<'a>, SourceError> {
        self.check_failure(start)?;
        let states: Vec<_> = self
            .states
            .iter()
            .filter(|s| s.domain == domain && s.timestamp >= start && s.timestamp < end)
            .cloned()
            .map(Ok)
            .collect();
        Ok(stream::iter(states).boxed())
    }
}

/// Keeps every batch it is handed. Clones share the same buffer.
#[derive(Clone)]
pub struct RecordingSink {
    pub batches: Arc<Mutex<Vec<Vec<DestinationRecord>>>>,
    pub healthy: bool,
    stats: SinkStats,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            batches: Arc::default(),
            healthy: true,
            stats: SinkStats::default(),
        }
    }
}

impl RecordingSink {
    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Default::default()
        }
    }

    pub fn records(&self) -> Vec<DestinationRecord> {
        self.batches.lock().unwrap().concat()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write_batch(&mut self, records: &[DestinationRecord]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.batches.lock().unwrap().push(records.to_vec());
        self.stats.record_batch(records.len());
        Ok(records.len())
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }

    fn stats(&self) -> SinkStats {
        self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = SinkStats::default();
    }
}

/// Healthy on the health check, then every write fails as if the destination went away.
#[derive(Default)]
pub struct DroppedConnectionSink {
    stats: SinkStats,
}

pub const CLOSED_URL: &str = "http://127.0.0.1:9";

#[async_trait]
impl Sink for DroppedConnectionSink {
    async fn write_batch(&mut self, _records: &[DestinationRecord]) -> Result<usize, SinkError> {
        let source = reqwest::get(CLOSED_URL).await.unwrap_err();
        Err(SinkError::Connectivity {
            url: CLOSED_URL.to_string(),
            source,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn stats(&self) -> SinkStats {
        self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = SinkStats::default();
    }
}
