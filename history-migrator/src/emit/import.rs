use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::{encode::encode_line, DestinationRecord, Sink, SinkStats};
use crate::{
    error::{truncate_chars, SinkError},
    job::backoff::{is_retryable_status, RetryPolicy},
    mapping::KnownMetricSet,
    metrics_consts::{BATCHES_SENT, POINTS_WRITTEN, WRITE_FAILURES, WRITE_RETRIES},
};

pub const IMPORT_PATH: &str = "/api/v1/import/prometheus";
pub const HEALTH_PATH: &str = "/health";
pub const LABEL_VALUES_PATH: &str = "/api/v1/label/__name__/values";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_BODY_CHARS: usize = 500;
const DRY_RUN_SAMPLE_LINES: usize = 3;
const DRY_RUN_SAMPLE_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct LabelValuesResponse {
    status: String,
    #[serde(default)]
    data: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for a VictoriaMetrics-compatible destination. In dry-run mode
/// batches are encoded and counted but never sent.
pub struct ImportSink {
    base_url: String,
    client: Client,
    dry_run: bool,
    retry_policy: RetryPolicy,
    stats: SinkStats,
}

impl ImportSink {
    pub fn new(base_url: &str, request_timeout: Duration, dry_run: bool) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SinkError::Api(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            dry_run,
            retry_policy: RetryPolicy::default(),
            stats: SinkStats::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Names of every series under `<namespace>_` the destination currently holds.
    pub async fn fetch_known_metrics(&self, namespace: &str) -> Result<KnownMetricSet, SinkError> {
        let url = self.url(LABEL_VALUES_PATH);
        let selector = format!("{{__name__=~\"{namespace}_.*\"}}");

        let response = self
            .client
            .get(&url)
            .query(&[("match[]", selector.as_str())])
            .send()
            .await
            .map_err(|source| SinkError::Connectivity {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Api(format!(
                "label values request failed with status {status}: {}",
                truncate_chars(&body, MAX_ERROR_BODY_CHARS)
            )));
        }

        let body: LabelValuesResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Api(format!("invalid label values response: {e}")))?;

        if body.status != "success" {
            return Err(SinkError::Api(body.error.unwrap_or_else(|| {
                format!("label values request returned status '{}'", body.status)
            })));
        }

        info!(
            "Loaded {} known metrics with prefix {namespace}_",
            body.data.len()
        );
        Ok(body.data.into_iter().collect())
    }

    async fn post_with_retry(&self, payload: Bytes) -> Result<(), SinkError> {
        let url = self.url(IMPORT_PATH);
        let max_retries = self.retry_policy.max_retries;
        let mut attempt = 0;

        loop {
            let response = self
                .client
                .post(&url)
                .header(CONTENT_TYPE, "text/plain")
                .body(payload.clone())
                .send()
                .await
                .map_err(|source| SinkError::Connectivity {
                    url: url.clone(),
                    source,
                })?;

            let status = response.status();
            if status.as_u16() < 400 {
                return Ok(());
            }

            if is_retryable_status(status) && attempt < max_retries {
                let delay = self.retry_policy.delay_for(attempt);
                warn!(
                    "transient import error, retrying (attempt {attempt}/{max_retries}, delay {delay:?}): status {status}"
                );
                metrics::counter!(WRITE_RETRIES).increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            metrics::counter!(WRITE_FAILURES).increment(1);
            return Err(SinkError::Write {
                status: status.as_u16(),
                body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
            });
        }
    }
}

#[async_trait]
impl Sink for ImportSink {
    async fn write_batch(&mut self, records: &[DestinationRecord]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        let lines: Vec<String> = records.iter().map(encode_line).collect();

        if self.dry_run {
            for line in lines.iter().take(DRY_RUN_SAMPLE_LINES) {
                info!("[dry-run] {}", truncate_chars(line, DRY_RUN_SAMPLE_CHARS));
            }
            info!("[dry-run] would write {} points", records.len());
        } else {
            self.post_with_retry(Bytes::from(lines.join("\n"))).await?;
            debug!("Wrote {} points to {}", records.len(), self.base_url);
        }

        self.stats.record_batch(records.len());
        metrics::counter!(POINTS_WRITTEN).increment(records.len() as u64);
        metrics::counter!(BATCHES_SENT).increment(1);
        Ok(records.len())
    }

    async fn health_check(&self) -> bool {
        let url = self.url(HEALTH_PATH);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                info!("Destination at {} is healthy", self.base_url);
                true
            }
            Ok(response) => {
                warn!(
                    "Destination health check at {url} returned {}",
                    response.status()
                );
                false
            }
            Err(e) => {
                error!("Destination health check at {url} failed: {e}");
                false
            }
        }
    }

    fn stats(&self) -> SinkStats {
        self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = SinkStats::default();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use httpmock::{Method::GET, Method::POST, MockServer};

    use super::*;
    use crate::job::backoff::BackoffPolicy;

    // Nothing listens on the discard port in the test environment
    const CLOSED_URL: &str = "http://127.0.0.1:9";

    fn records(n: usize) -> Vec<DestinationRecord> {
        (0..n)
            .map(|i| {
                let mut labels = BTreeMap::new();
                labels.insert("entity".to_string(), format!("sensor.probe_{i}"));
                DestinationRecord {
                    metric_name: "homeassistant_sensor_temperature_celsius".to_string(),
                    labels,
                    value: 20.0 + i as f64,
                    timestamp_ms: 1_714_521_600_000 + i as i64,
                }
            })
            .collect()
    }

    fn fast_retries(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            BackoffPolicy::new(Duration::from_millis(10), 2.0, Duration::from_millis(50)),
        )
    }

    fn sink(server: &MockServer, dry_run: bool) -> ImportSink {
        ImportSink::new(&server.base_url(), Duration::from_secs(5), dry_run)
            .unwrap()
            .with_retry_policy(fast_retries(2))
    }

    #[tokio::test]
    async fn test_write_batch_posts_newline_joined_lines() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(IMPORT_PATH)
                    .header("content-type", "text/plain")
                    .body(
                        "homeassistant_sensor_temperature_celsius{entity=\"sensor.probe_0\"} 20 1714521600000\n\
                         homeassistant_sensor_temperature_celsius{entity=\"sensor.probe_1\"} 21 1714521600001",
                    );
                then.status(204);
            })
            .await;

        let mut sink = sink(&server, false);
        let written = sink.write_batch(&records(2)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(written, 2);
        assert_eq!(
            sink.stats(),
            SinkStats {
                points_written: 2,
                batches_sent: 1
            }
        );
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(IMPORT_PATH);
                then.status(204);
            })
            .await;

        let mut sink = sink(&server, false);
        assert_eq!(sink.write_batch(&[]).await.unwrap(), 0);

        mock.assert_hits_async(0).await;
        assert_eq!(sink.stats(), SinkStats::default());
    }

    #[tokio::test]
    async fn test_dry_run_counts_like_real_run_without_io() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(IMPORT_PATH);
                then.status(204);
            })
            .await;

        let mut dry = sink(&server, true);
        assert!(dry.is_dry_run());
        assert_eq!(dry.write_batch(&records(5)).await.unwrap(), 5);
        mock.assert_hits_async(0).await;

        let mut real = sink(&server, false);
        assert_eq!(real.write_batch(&records(5)).await.unwrap(), 5);
        mock.assert_hits_async(1).await;

        assert_eq!(dry.stats(), real.stats());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start_async().await;
        let long_body = "x".repeat(2000);
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(IMPORT_PATH);
                then.status(400).body(long_body.as_str());
            })
            .await;

        let mut sink = sink(&server, false);
        let err = sink.write_batch(&records(1)).await.unwrap_err();

        mock.assert_hits_async(1).await;
        match err {
            SinkError::Write { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body.len(), MAX_ERROR_BODY_CHARS);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sink.stats(), SinkStats::default());
    }

    #[tokio::test]
    async fn test_server_error_retries_until_exhausted() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(IMPORT_PATH);
                then.status(503).body("overloaded");
            })
            .await;

        let mut sink = sink(&server, false);
        let err = sink.write_batch(&records(3)).await.unwrap_err();

        // first attempt plus two retries
        mock.assert_hits_async(3).await;
        assert!(matches!(err, SinkError::Write { status: 503, ref body } if body == "overloaded"));
        assert_eq!(sink.stats().batches_sent, 0);
    }

    #[tokio::test]
    async fn test_server_error_then_success() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(POST).path(IMPORT_PATH);
                then.status(503);
            })
            .await;

        let mut sink = ImportSink::new(&server.base_url(), Duration::from_secs(5), false)
            .unwrap()
            .with_retry_policy(RetryPolicy::new(
                3,
                BackoffPolicy::new(Duration::from_millis(500), 1.0, Duration::from_millis(500)),
            ));
        let handle = tokio::spawn(async move {
            let result = sink.write_batch(&records(2)).await;
            (result, sink)
        });

        while failing.hits_async().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        failing.delete_async().await;
        let succeeding = server
            .mock_async(|when, then| {
                when.method(POST).path(IMPORT_PATH);
                then.status(204);
            })
            .await;

        let (result, sink) = handle.await.unwrap();
        assert_eq!(result.unwrap(), 2);
        succeeding.assert_hits_async(1).await;
        assert_eq!(sink.stats().batches_sent, 1);
    }

    #[tokio::test]
    async fn test_connection_refused_is_connectivity_error() {
        let mut sink = ImportSink::new(CLOSED_URL, Duration::from_secs(2), false)
            .unwrap()
            .with_retry_policy(RetryPolicy::none());
        let err = sink.write_batch(&records(1)).await.unwrap_err();
        assert!(matches!(err, SinkError::Connectivity { .. }));
        assert!(!sink.health_check().await);
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start_async().await;
        let mut health = server
            .mock_async(|when, then| {
                when.method(GET).path(HEALTH_PATH);
                then.status(200).body("OK");
            })
            .await;

        let sink = sink(&server, false);
        assert!(sink.health_check().await);

        health.delete_async().await;
        health = server
            .mock_async(|when, then| {
                when.method(GET).path(HEALTH_PATH);
                then.status(500);
            })
            .await;
        assert!(!sink.health_check().await);
        health.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_known_metrics() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(LABEL_VALUES_PATH)
                    .query_param("match[]", "{__name__=~\"homeassistant_.*\"}");
                then.status(200).json_body(serde_json::json!({
                    "status": "success",
                    "data": [
                        "homeassistant_sensor_temperature_celsius",
                        "homeassistant_sensor_battery_percent"
                    ]
                }));
            })
            .await;

        let sink = sink(&server, false);
        let known = sink.fetch_known_metrics("homeassistant").await.unwrap();

        mock.assert_async().await;
        assert_eq!(known.len(), 2);
        assert!(known.contains("homeassistant_sensor_battery_percent"));
    }

    #[tokio::test]
    async fn test_fetch_known_metrics_rejects_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(LABEL_VALUES_PATH);
                then.status(200).json_body(serde_json::json!({
                    "status": "error",
                    "error": "bad match[] selector"
                }));
            })
            .await;

        let sink = sink(&server, false);
        let err = sink.fetch_known_metrics("homeassistant").await.unwrap_err();
        assert!(matches!(err, SinkError::Api(msg) if msg == "bad match[] selector"));
    }
}
