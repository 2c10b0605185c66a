use std::time::Duration;

use anyhow::{bail, Context, Error};
use chrono::NaiveDate;
use envconfig::Envconfig;

use crate::{
    job::backoff::{BackoffPolicy, RetryPolicy},
    source::FieldSelection,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "INFLUX_URL", default = "http://localhost:8086")]
    pub influx_url: String,

    #[envconfig(from = "INFLUX_TOKEN", default = "")]
    pub influx_token: String,

    #[envconfig(from = "INFLUX_ORG", default = "home")]
    pub influx_org: String,

    #[envconfig(from = "INFLUX_BUCKET", default = "home-assistant")]
    pub influx_bucket: String,

    #[envconfig(from = "VM_URL", default = "http://localhost:8428")]
    pub vm_url: String,

    #[envconfig(from = "SCHEMA_PATH", default = "SCHEMA_MAPPING.yaml")]
    pub schema_path: String,

    #[envconfig(from = "STATE_DIR", default = "../state")]
    pub state_dir: String,

    #[envconfig(from = "BATCH_SIZE", default = "10000")]
    pub batch_size: usize,

    // Inclusive, YYYY-MM-DD, UTC days
    #[envconfig(from = "START_DATE", default = "2025-05-01")]
    pub start_date: String,

    #[envconfig(from = "END_DATE", default = "2025-11-28")]
    pub end_date: String,

    // Comma separated, empty means every domain
    #[envconfig(from = "DOMAINS", default = "")]
    pub domains: String,

    // Comma separated, empty means the default or extended field set
    #[envconfig(from = "FIELDS", default = "")]
    pub fields: String,

    #[envconfig(from = "EXTENDED_FIELDS", default = "false")]
    pub extended_fields: bool,

    #[envconfig(from = "DRY_RUN", default = "false")]
    pub dry_run: bool,

    #[envconfig(from = "RESET", default = "false")]
    pub reset: bool,

    // Used for progress percentages when COUNT_RECORDS is off
    #[envconfig(from = "TOTAL_RECORDS_ESTIMATE", default = "0")]
    pub total_records_estimate: u64,

    #[envconfig(from = "COUNT_RECORDS", default = "false")]
    pub count_records: bool,

    // Retries after the first attempt, for 5xx responses from the destination
    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "3")]
    pub retry_max_attempts: u32,

    #[envconfig(from = "RETRY_INITIAL_SECONDS", default = "2")]
    pub retry_initial_seconds: u64,

    #[envconfig(from = "RETRY_MAX_SECONDS", default = "30")]
    pub retry_max_seconds: u64,

    #[envconfig(from = "RETRY_MULTIPLIER", default = "2.0")]
    pub retry_multiplier: f64,

    #[envconfig(from = "REQUEST_TIMEOUT_SECONDS", default = "30")]
    pub request_timeout_seconds: u64,

    // Day-sized Flux queries can take a while on a large bucket
    #[envconfig(from = "SOURCE_TIMEOUT_SECONDS", default = "300")]
    pub source_timeout_seconds: u64,
}

/// Validated, typed parameters of a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub batch_size: usize,
    pub dry_run: bool,
    pub reset: bool,
    pub fields: FieldSelection,
    pub total_records_estimate: u64,
    pub count_records: bool,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            BackoffPolicy::new(
                Duration::from_secs(self.retry_initial_seconds),
                self.retry_multiplier,
                Duration::from_secs(self.retry_max_seconds),
            ),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_seconds)
    }

    pub fn domain_list(&self) -> Option<Vec<String>> {
        split_list(&self.domains)
    }

    pub fn field_list(&self) -> Option<Vec<String>> {
        split_list(&self.fields)
    }

    pub fn field_selection(&self) -> FieldSelection {
        FieldSelection::new(self.field_list(), self.extended_fields)
    }

    pub fn run_options(&self) -> Result<RunOptions, Error> {
        let start_date = parse_date("START_DATE", &self.start_date)?;
        let end_date = parse_date("END_DATE", &self.end_date)?;
        if start_date > end_date {
            bail!("START_DATE {start_date} is after END_DATE {end_date}");
        }
        if self.batch_size == 0 {
            bail!("BATCH_SIZE must be greater than zero");
        }

        Ok(RunOptions {
            start_date,
            end_date,
            batch_size: self.batch_size,
            dry_run: self.dry_run,
            reset: self.reset,
            fields: self.field_selection(),
            total_records_estimate: self.total_records_estimate,
            count_records: self.count_records,
        })
    }
}

fn split_list(raw: &str) -> Option<Vec<String>> {
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn parse_date(name: &str, raw: &str) -> Result<NaiveDate, Error> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .with_context(|| format!("{name} must be YYYY-MM-DD, got '{raw}'"))
}
