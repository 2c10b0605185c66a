use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::SourceError;

const FLUX_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One decoded CSV data row, keyed by column name.
pub type FluxRow = HashMap<String, String>;

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format(FLUX_TIME_FORMAT).to_string()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn any_of(column: &str, values: &[String]) -> String {
    let conditions: Vec<String> = values
        .iter()
        .map(|value| format!("r.{column} == {}", quote(value)))
        .collect();
    format!("  |> filter(fn: (r) => {})\n", conditions.join(" or "))
}

/// Builds Flux pipelines against one bucket.
#[derive(Debug, Clone)]
pub struct FluxQuery {
    bucket: String,
}

impl FluxQuery {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    fn from_range(&self, start: &str, stop: Option<&str>) -> String {
        let range = match stop {
            Some(stop) => format!("range(start: {start}, stop: {stop})"),
            None => format!("range(start: {start})"),
        };
        format!("from(bucket: {})\n  |> {range}\n", quote(&self.bucket))
    }

    pub fn records(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        fields: &[String],
        domains: Option<&[String]>,
    ) -> String {
        let mut query = self.from_range(&format_time(start), Some(&format_time(end)));
        if !fields.is_empty() {
            query.push_str(&any_of("_field", fields));
        }
        if let Some(domains) = domains.filter(|d| !d.is_empty()) {
            query.push_str(&any_of("domain", domains));
        }
        query
    }

    pub fn states(&self, start: DateTime<Utc>, end: DateTime<Utc>, domain: &str, field: &str) -> String {
        let mut query = self.from_range(&format_time(start), Some(&format_time(end)));
        query.push_str(&format!(
            "  |> filter(fn: (r) => r._field == {} and r.domain == {})\n",
            quote(field),
            quote(domain)
        ));
        query
    }

    /// `first` or `last` default-field record over the whole bucket.
    pub fn boundary(&self, selector: &str) -> String {
        let mut query = self.from_range("0", None);
        query.push_str("  |> filter(fn: (r) => r._field == \"value\")\n");
        query.push_str("  |> group()\n");
        query.push_str(&format!("  |> {selector}(column: \"_time\")\n"));
        query
    }

    pub fn count(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> String {
        let start = start.map(format_time).unwrap_or_else(|| "0".to_string());
        let end = end.map(format_time);
        let mut query = self.from_range(&start, end.as_deref());
        query.push_str("  |> filter(fn: (r) => r._field == \"value\")\n");
        query.push_str("  |> group()\n");
        query.push_str("  |> count()\n");
        query
    }
}

/// Incremental decoder for the annotated CSV the query API returns.
///
/// Each table starts with optional `#` annotation rows and a header row, and
/// tables are separated by a blank line. Quoted fields may contain commas,
/// doubled quotes and newlines, so bytes are only split into rows at a newline
/// that sits outside quotes.
#[derive(Debug, Default)]
pub struct FluxCsvDecoder {
    pending: Vec<u8>,
    // Byte offset into `pending` already scanned, and whether that prefix ends inside quotes
    scanned: usize,
    in_quotes: bool,
    header: Option<Vec<String>>,
}

impl FluxCsvDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<FluxRow>, SourceError> {
        self.pending.extend_from_slice(chunk);
        let mut rows = Vec::new();

        while let Some(end) = self.next_row_end() {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.scanned = 0;
            if let Some(row) = self.decode_line(&line[..end])? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Decodes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Result<Vec<FluxRow>, SourceError> {
        let line = std::mem::take(&mut self.pending);
        self.scanned = 0;
        if self.in_quotes {
            self.in_quotes = false;
            return Err(SourceError::Decode(
                "response ended inside a quoted field".to_string(),
            ));
        }
        Ok(self.decode_line(&line)?.into_iter().collect())
    }

    fn next_row_end(&mut self) -> Option<usize> {
        for idx in self.scanned..self.pending.len() {
            match self.pending[idx] {
                b'"' => self.in_quotes = !self.in_quotes,
                b'\n' if !self.in_quotes => return Some(idx),
                _ => {}
            }
        }
        self.scanned = self.pending.len();
        None
    }

    fn decode_line(&mut self, line: &[u8]) -> Result<Option<FluxRow>, SourceError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.iter().all(u8::is_ascii_whitespace) {
            self.header = None;
            return Ok(None);
        }
        if line.first() == Some(&b'#') {
            self.header = None;
            return Ok(None);
        }

        let fields = parse_fields(line)?;

        let header = match &self.header {
            Some(header) => header,
            None => {
                self.header = Some(fields);
                return Ok(None);
            }
        };

        let row: FluxRow = header
            .iter()
            .cloned()
            .zip(fields)
            .filter(|(column, _)| !column.is_empty())
            .collect();

        // The query API reports failures that happen mid-stream as an `error` table
        if header.iter().any(|c| c == "error") && header.iter().any(|c| c == "reference") {
            let message = row.get("error").cloned().unwrap_or_default();
            return Err(SourceError::Query {
                status: 200,
                body: message,
            });
        }

        Ok(Some(row))
    }
}

fn parse_fields(line: &[u8]) -> Result<Vec<String>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line);
    let mut record = csv::StringRecord::new();
    let found = reader
        .read_record(&mut record)
        .map_err(|e| SourceError::Decode(e.to_string()))?;
    if !found {
        return Ok(Vec::new());
    }
    Ok(record.iter().map(str::to_string).collect())
}
