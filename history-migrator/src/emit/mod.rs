use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::SinkError;

pub mod encode;
pub mod import;

pub use encode::{decode_label_value, encode_batch, encode_line};
pub use import::ImportSink;

/// A fully mapped point, ready to be encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationRecord {
    pub metric_name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub points_written: u64,
    pub batches_sent: u64,
}

impl SinkStats {
    pub fn record_batch(&mut self, points: usize) {
        self.points_written += points as u64;
        self.batches_sent += 1;
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Returns the number of points accepted. An empty slice is a no-op.
    async fn write_batch(&mut self, records: &[DestinationRecord]) -> Result<usize, SinkError>;

    async fn health_check(&self) -> bool;

    fn stats(&self) -> SinkStats;

    fn reset_stats(&mut self);
}
