use std::sync::Arc;

use anyhow::{Context, Error};
use chrono::{NaiveDate, TimeDelta};
use futures::TryStreamExt;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::{CheckpointState, CheckpointStatus, CheckpointStore},
    config::RunOptions,
    emit::{DestinationRecord, Sink, SinkStats},
    error::{is_connectivity_error, MappingError, SinkError},
    mapping::{MappingEngine, Resolution},
    metrics_consts::{DAYS_COMMITTED, RECORDS_FILTERED, RECORDS_SKIPPED},
    source::{day_window, days_between, RecordSource, SourceRecord},
};

pub mod backoff;
pub mod state_expansion;
pub mod validation;

use validation::{UnmappedCombination, ValidationReport};

/// Counters for one day, or summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayStats {
    pub records: u64,
    pub batches: u64,
    pub skipped: u64,
    pub filtered: u64,
}

impl DayStats {
    fn add(&mut self, other: DayStats) {
        self.records += other.records;
        self.batches += other.batches;
        self.skipped += other.skipped;
        self.filtered += other.filtered;
    }
}

#[derive(Debug)]
pub enum MigrationOutcome {
    /// The checkpoint already says completed. Nothing was done.
    AlreadyCompleted,
    /// The checkpoint says failed. Nothing is done until it is reset.
    PreviouslyFailed { errors: Vec<String> },
    HealthCheckFailed,
    Completed { days: u64, totals: DayStats },
    Validated(ValidationReport),
}

impl MigrationOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrationOutcome::AlreadyCompleted | MigrationOutcome::Completed { .. } => 0,
            MigrationOutcome::Validated(report) if report.passed() => 0,
            _ => 1,
        }
    }
}

/// Drives source -> mapping -> sink one UTC day at a time, committing each day to the checkpoint.
pub struct Migration {
    engine: Arc<MappingEngine>,
    source: Box<dyn RecordSource>,
    sink: Box<dyn Sink>,
    checkpoints: CheckpointStore,
    options: RunOptions,
}

impl Migration {
    pub fn new(
        engine: Arc<MappingEngine>,
        source: Box<dyn RecordSource>,
        sink: Box<dyn Sink>,
        checkpoints: CheckpointStore,
        options: RunOptions,
    ) -> Self {
        Self {
            engine,
            source,
            sink,
            checkpoints,
            options,
        }
    }

    pub fn sink_stats(&self) -> SinkStats {
        self.sink.stats()
    }

    pub async fn run(&mut self) -> Result<MigrationOutcome, Error> {
        if self.options.reset {
            self.checkpoints
                .reset(true)
                .await
                .context("failed to reset checkpoint")?;
        }

        let existing = self.checkpoints.load().await;
        if let Some(state) = &existing {
            match state.status {
                CheckpointStatus::Completed => {
                    info!("Migration already completed, nothing to do");
                    return Ok(MigrationOutcome::AlreadyCompleted);
                }
                CheckpointStatus::Failed => {
                    error!("Previous migration failed, rerun with --reset to start over");
                    for message in &state.errors {
                        error!("  {message}");
                    }
                    return Ok(MigrationOutcome::PreviouslyFailed {
                        errors: state.errors.clone(),
                    });
                }
                CheckpointStatus::InProgress => info!(
                    "Resuming migration, {} records migrated so far, last day {:?}",
                    state.records_migrated, state.last_migrated_date
                ),
                CheckpointStatus::NotStarted => {}
            }
        }

        let start = self.options.start_date;
        let resume = existing
            .as_ref()
            .map(|state| state.resume_date(start))
            .unwrap_or(start);

        if self.options.dry_run {
            let report = self.validate(resume, self.options.end_date).await?;
            return Ok(MigrationOutcome::Validated(report));
        }

        if !self.sink.health_check().await {
            error!("Destination is not healthy, aborting before any work");
            return Ok(MigrationOutcome::HealthCheckFailed);
        }

        let mut state = match existing {
            Some(state) => state,
            None => self.new_checkpoint().await?,
        };

        self.migrate_days(&mut state, resume).await
    }

    async fn new_checkpoint(&self) -> Result<CheckpointState, Error> {
        let total = self.estimate_total().await;
        let oldest = day_window(self.options.start_date).0;
        let newest = day_window(self.options.end_date).1 - TimeDelta::seconds(1);

        let mut state = self.checkpoints.create_new(total, oldest, newest, false);
        self.checkpoints
            .save(&mut state)
            .await
            .context("failed to write initial checkpoint")?;
        Ok(state)
    }

    async fn estimate_total(&self) -> u64 {
        if !self.options.count_records {
            return self.options.total_records_estimate;
        }
        let start = day_window(self.options.start_date).0;
        let end = day_window(self.options.end_date).1;
        match self.source.count_records(Some(start), Some(end)).await {
            Ok(count) => {
                info!("Source holds {count} records in range");
                count
            }
            Err(e) => {
                warn!("Failed to count source records, using estimate: {e}");
                self.options.total_records_estimate
            }
        }
    }

    async fn migrate_days(
        &mut self,
        state: &mut CheckpointState,
        resume: NaiveDate,
    ) -> Result<MigrationOutcome, Error> {
        let mut totals = DayStats::default();
        let mut days = 0;

        for day in days_between(resume, self.options.end_date) {
            info!("Migrating {day}");
            let mut stats = DayStats::default();

            let committed = match self.migrate_day(day, &mut stats).await {
                Ok(()) => self.commit_day(state, day, stats).await,
                Err(e) => Err(e),
            };

            if let Err(e) = committed {
                // Without any committed day there is nothing to protect, and a network blip
                // should not force an operator reset
                if is_connectivity_error(&e) && state.last_migrated_date.is_none() {
                    error!("Connectivity failure on {day}: {e:#}");
                    return Err(e.context(format!("migration aborted on {day}")));
                }

                state.records_failed += stats.records;
                if let Err(save_err) = self
                    .checkpoints
                    .mark_failed(state, format!("Failed on {day}: {e:#}"))
                    .await
                {
                    error!("Failed to record failure in checkpoint: {save_err}");
                }
                return Err(e.context(format!("migration failed on {day}")));
            }
            metrics::counter!(DAYS_COMMITTED).increment(1);

            info!(
                "Finished {day}: {} records in {} batches, {} skipped, {} filtered",
                stats.records, stats.batches, stats.skipped, stats.filtered
            );
            totals.add(stats);
            days += 1;
        }

        self.checkpoints
            .mark_completed(state)
            .await
            .context("failed to mark checkpoint completed")?;

        Ok(MigrationOutcome::Completed { days, totals })
    }

    // On a failed save the in-memory state goes back to what is on disk, so the day
    // is not recorded as migrated by a later save
    async fn commit_day(
        &self,
        state: &mut CheckpointState,
        day: NaiveDate,
        stats: DayStats,
    ) -> Result<(), Error> {
        let before = state.clone();
        if let Err(e) = self
            .checkpoints
            .update(state, day, stats.records, stats.batches)
            .await
        {
            *state = before;
            return Err(Error::new(e).context(format!("failed to commit checkpoint for {day}")));
        }
        Ok(())
    }

    /// Streams one day through mapping into the sink. Nothing here touches the checkpoint;
    /// a failure partway leaves the day uncommitted and it is replayed in full next run.
    pub async fn migrate_day(&mut self, day: NaiveDate, stats: &mut DayStats) -> Result<(), Error> {
        let batch_size = self.options.batch_size;
        let engine = self.engine.clone();
        let sink = self.sink.as_mut();

        let mut records = self
            .source
            .query_day(day)
            .await
            .with_context(|| format!("failed to query source for {day}"))?;

        let mut batch = Vec::with_capacity(batch_size);

        while let Some(record) = records
            .try_next()
            .await
            .with_context(|| format!("failed to read source records for {day}"))?
        {
            if !self.options.fields.accepts(&record.domain, &record.field) {
                debug!(
                    "Dropping field {} for domain {}",
                    record.field, record.domain
                );
                stats.filtered += 1;
                metrics::counter!(RECORDS_FILTERED).increment(1);
                continue;
            }

            let metric_name = match engine.resolve_strict(
                &record.domain,
                &record.unit,
                &record.entity_id,
                &record.field,
            )? {
                Resolution::Metric(name) => name,
                Resolution::Ignored => {
                    stats.skipped += 1;
                    metrics::counter!(RECORDS_SKIPPED).increment(1);
                    continue;
                }
                Resolution::Unmapped => {
                    return Err(MappingError::Unmapped {
                        domain: record.domain,
                        unit: record.unit,
                        entity_id: record.entity_id,
                        field: record.field,
                    }
                    .into());
                }
            };

            batch.push(to_destination(&engine, record, metric_name));
            stats.records += 1;

            if batch.len() >= batch_size {
                flush(sink, &mut batch, stats).await?;
            }
        }

        flush(sink, &mut batch, stats).await?;
        Ok(())
    }

    /// Validation-only pass. Tallies mapping outcomes and never writes.
    pub async fn validate(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ValidationReport, Error> {
        info!("Dry run: validating {start} to {end}");
        let mut report = ValidationReport::default();

        for day in days_between(start, end) {
            let mut records = self
                .source
                .query_day(day)
                .await
                .with_context(|| format!("failed to query source for {day}"))?;

            while let Some(record) = records
                .try_next()
                .await
                .with_context(|| format!("failed to read source records for {day}"))?
            {
                if !self.options.fields.accepts(&record.domain, &record.field) {
                    report.record_filtered();
                    continue;
                }

                match self.engine.resolve_strict(
                    &record.domain,
                    &record.unit,
                    &record.entity_id,
                    &record.field,
                ) {
                    Ok(Resolution::Metric(_)) => report.record_mapped(),
                    Ok(Resolution::Ignored) => report.record_ignored(&record.domain, &record.unit),
                    Ok(Resolution::Unmapped) | Err(_) => {
                        let combination = UnmappedCombination {
                            domain: record.domain,
                            unit: record.unit,
                            entity_id: record.entity_id,
                            field: record.field,
                        };
                        let message = combination.to_string();
                        if report.record_unmapped(combination) {
                            warn!("Unmapped: {message}");
                        }
                    }
                }
            }

            debug!("Validated {day}, {} records so far", report.total);
        }

        report.log_summary();
        Ok(report)
    }
}

fn to_destination(
    engine: &MappingEngine,
    record: SourceRecord,
    metric_name: String,
) -> DestinationRecord {
    let display_name = record
        .display_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(&record.entity_id);

    DestinationRecord {
        labels: engine.build_labels(&record.domain, &record.entity_id, display_name),
        metric_name,
        value: record.value,
        timestamp_ms: record.timestamp.timestamp_millis(),
    }
}

async fn flush(
    sink: &mut dyn Sink,
    batch: &mut Vec<DestinationRecord>,
    stats: &mut DayStats,
) -> Result<(), SinkError> {
    if batch.is_empty() {
        return Ok(());
    }
    sink.write_batch(batch).await?;
    stats.batches += 1;
    batch.clear();
    Ok(())
}
