use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use reqwest::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use serde_json::json;
use tracing::{debug, info};

use super::{
    flux::{FluxCsvDecoder, FluxQuery, FluxRow},
    RecordSource, RecordStream, SourceRecord, StateRecord, StateStream, UNKNOWN_TAG,
};
use crate::{
    error::{truncate_chars, SourceError},
    metrics_consts::SOURCE_ROWS_DECODED,
};

const QUERY_PATH: &str = "/api/v2/query";
const MAX_ERROR_BODY_CHARS: usize = 500;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type RowStream = BoxStream<'static, Result<FluxRow, SourceError>>;

pub struct InfluxSourceBuilder {
    base_url: String,
    token: String,
    org: String,
    bucket: String,

    // Optional with defaults
    fields: Vec<String>,
    domains: Option<Vec<String>>,
    timeout: Duration,
}

impl InfluxSourceBuilder {
    pub fn new(base_url: String, token: String, org: String, bucket: String) -> Self {
        Self {
            base_url,
            token,
            org,
            bucket,
            fields: vec![super::DEFAULT_FIELD.to_string()],
            domains: None,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_domains(mut self, domains: Option<Vec<String>>) -> Self {
        self.domains = domains.filter(|d| !d.is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<InfluxSource, SourceError> {
        // A day's body is read while batches are being written, so bound each read
        // rather than the whole response
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(self.timeout)
            .build()?;

        Ok(InfluxSource {
            query_url: format!("{}{}", self.base_url.trim_end_matches('/'), QUERY_PATH),
            token: self.token,
            org: self.org,
            queries: FluxQuery::new(self.bucket),
            fields: self.fields,
            domains: self.domains,
            client,
        })
    }
}

/*
 * Reads Home Assistant history out of an InfluxDB 2.x bucket over the Flux query API.
 *
 * Home Assistant writes one measurement per unit of measurement (or the entity id when there
 * is none), tags each point with `domain`, `entity_id` and usually `friendly_name`, and stores
 * the state in the `value` field next to one field per attribute. Responses are annotated CSV,
 * decoded as the body streams in so a full day never has to sit in memory.
 */
pub struct InfluxSource {
    query_url: String,
    token: String,
    org: String,
    queries: FluxQuery,
    fields: Vec<String>,
    domains: Option<Vec<String>>,
    client: Client,
}

impl InfluxSource {
    pub fn builder(base_url: String, token: String, org: String, bucket: String) -> InfluxSourceBuilder {
        InfluxSourceBuilder::new(base_url, token, org, bucket)
    }

    async fn execute(&self, flux: String) -> Result<RowStream, SourceError> {
        debug!("Running flux query:\n{flux}");
        let response = self
            .client
            .post(&self.query_url)
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(ACCEPT, "application/csv")
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": {
                    "header": true,
                    "delimiter": ",",
                    "annotations": ["datatype", "group", "default"],
                },
            }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Query {
                status: status.as_u16(),
                body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
            });
        }

        Ok(decode_rows(response.bytes_stream().boxed()))
    }

    async fn first_time(&self, selector: &str) -> Result<DateTime<Utc>, SourceError> {
        let mut rows = self.execute(self.queries.boundary(selector)).await?;
        match rows.try_next().await? {
            Some(row) => parse_time(&row),
            None => Err(SourceError::Empty),
        }
    }
}

struct DecodeState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: FluxCsvDecoder,
    ready: VecDeque<FluxRow>,
    finished: bool,
}

fn decode_rows(bytes: BoxStream<'static, reqwest::Result<Bytes>>) -> RowStream {
    let state = DecodeState {
        bytes,
        decoder: FluxCsvDecoder::default(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(row) = state.ready.pop_front() {
                return Some((Ok(row), state));
            }
            if state.finished {
                return None;
            }

            let decoded = match state.bytes.next().await {
                Some(Ok(chunk)) => state.decoder.feed(&chunk),
                Some(Err(e)) => Err(SourceError::Connectivity(e)),
                None => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };

            match decoded {
                Ok(rows) => state.ready.extend(rows),
                Err(e) => {
                    state.finished = true;
                    state.ready.clear();
                    return Some((Err(e), state));
                }
            }
        }
    })
    .boxed()
}

fn column<'r>(row: &'r FluxRow, name: &str) -> Result<&'r str, SourceError> {
    row.get(name)
        .map(String::as_str)
        .ok_or_else(|| SourceError::Decode(format!("missing column {name}")))
}

fn tag_or_unknown(row: &FluxRow, name: &str) -> String {
    match row.get(name) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => UNKNOWN_TAG.to_string(),
    }
}

fn display_name(row: &FluxRow) -> Option<String> {
    row.get("friendly_name").filter(|n| !n.is_empty()).cloned()
}

fn parse_time(row: &FluxRow) -> Result<DateTime<Utc>, SourceError> {
    let raw = column(row, "_time")?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SourceError::Decode(format!("invalid _time '{raw}': {e}")))
}

// Boolean fields come back as `true`/`false`
fn parse_value(raw: &str) -> Result<f64, SourceError> {
    match raw {
        "true" => Ok(1.0),
        "false" => Ok(0.0),
        _ => raw
            .parse()
            .map_err(|_| SourceError::Decode(format!("non-numeric _value '{raw}'"))),
    }
}

pub fn record_from_row(row: &FluxRow) -> Result<SourceRecord, SourceError> {
    let value = parse_value(column(row, "_value")?)?;

    Ok(SourceRecord {
        timestamp: parse_time(row)?,
        domain: tag_or_unknown(row, "domain"),
        entity_id: tag_or_unknown(row, "entity_id"),
        display_name: display_name(row),
        unit: column(row, "_measurement")?.to_string(),
        field: column(row, "_field")?.to_string(),
        value,
    })
}

pub fn state_from_row(row: &FluxRow) -> Result<StateRecord, SourceError> {
    Ok(StateRecord {
        timestamp: parse_time(row)?,
        domain: tag_or_unknown(row, "domain"),
        entity_id: tag_or_unknown(row, "entity_id"),
        display_name: display_name(row),
        state: column(row, "_value")?.to_string(),
    })
}

#[async_trait]
impl RecordSource for InfluxSource {
    async fn time_range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), SourceError> {
        let oldest = self.first_time("first").await?;
        let newest = self.first_time("last").await?;
        info!("Source holds records from {oldest} to {newest}");
        Ok((oldest, newest))
    }

    async fn count_records(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<u64, SourceError> {
        let rows: Vec<FluxRow> = self
            .execute(self.queries.count(start, end))
            .await?
            .try_collect()
            .await?;

        let mut total = 0;
        for row in &rows {
            let raw = column(row, "_value")?;
            total += raw
                .parse::<u64>()
                .map_err(|_| SourceError::Decode(format!("invalid count '{raw}'")))?;
        }
        Ok(total)
    }

    async fn query_range<'a>(
        &'a self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RecordStream<'a>, SourceError> {
        let flux = self
            .queries
            .records(start, end, &self.fields, self.domains.as_deref());
        let rows = self.execute(flux).await?;
        Ok(rows
            .and_then(|row| async move {
                metrics::counter!(SOURCE_ROWS_DECODED).increment(1);
                record_from_row(&row)
            })
            .boxed())
    }

    async fn query_states<'a>(
        &'a self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        domain: &str,
        field: &str,
    ) -> Result<StateStream<'a>, SourceError> {
        let rows = self
            .execute(self.queries.states(start, end, domain, field))
            .await?;
        Ok(rows
            .and_then(|row| async move { state_from_row(&row) })
            .boxed())
    }
}
