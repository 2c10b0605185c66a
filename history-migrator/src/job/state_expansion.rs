use anyhow::{Context, Error};
use chrono::NaiveDate;
use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::{
    emit::{DestinationRecord, Sink},
    mapping::ruleset::LabelRules,
    metrics_consts::RECORDS_SKIPPED,
    source::{day_window, days_between, RecordSource, StateRecord},
};

pub const ACTION_DOMAIN: &str = "climate";
pub const ACTION_FIELD: &str = "hvac_action_str";
pub const ACTION_LABEL: &str = "action";

pub const HVAC_ACTIONS: [&str; 8] = [
    "heating",
    "idle",
    "cooling",
    "off",
    "drying",
    "fan",
    "preheating",
    "defrosting",
];

/// One record per known action, 1.0 on the active one. `None` for an empty state.
/// An action outside the known set yields all zeros.
pub fn expand_action(
    state: &StateRecord,
    metric_name: &str,
    labels: &LabelRules,
) -> Option<Vec<DestinationRecord>> {
    let action = state.state.trim().to_lowercase();
    if action.is_empty() {
        return None;
    }

    let display_name = state
        .display_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(&state.entity_id);
    let base = labels.build(&state.domain, &state.entity_id, display_name);
    let timestamp_ms = state.timestamp.timestamp_millis();

    let records = HVAC_ACTIONS
        .iter()
        .map(|known| {
            let mut labels = base.clone();
            labels.insert(ACTION_LABEL.to_string(), known.to_string());
            DestinationRecord {
                metric_name: metric_name.to_string(),
                labels,
                value: if *known == action { 1.0 } else { 0.0 },
                timestamp_ms,
            }
        })
        .collect();
    Some(records)
}

pub fn is_known_action(action: &str) -> bool {
    HVAC_ACTIONS.contains(&action.trim().to_lowercase().as_str())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionSummary {
    pub states: u64,
    pub skipped: u64,
    pub unknown: u64,
    pub points: u64,
    pub batches: u64,
}

/// Rewrites climate action strings as one gauge series per action. Not checkpointed;
/// a rerun overwrites the same samples.
pub struct StateExpansion {
    source: Box<dyn RecordSource>,
    sink: Box<dyn Sink>,
    metric_name: String,
    labels: LabelRules,
    start: NaiveDate,
    end: NaiveDate,
    batch_size: usize,
    dry_run: bool,
}

impl StateExpansion {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn RecordSource>,
        sink: Box<dyn Sink>,
        namespace: &str,
        labels: LabelRules,
        start: NaiveDate,
        end: NaiveDate,
        batch_size: usize,
        dry_run: bool,
    ) -> Self {
        Self {
            source,
            sink,
            metric_name: format!("{namespace}_{ACTION_DOMAIN}_action"),
            labels,
            start,
            end,
            batch_size,
            dry_run,
        }
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub async fn run(&mut self) -> Result<ExpansionSummary, Error> {
        if !self.dry_run && !self.sink.health_check().await {
            anyhow::bail!("destination is not healthy");
        }

        info!(
            "Expanding {ACTION_DOMAIN}.{ACTION_FIELD} into {} from {} to {}",
            self.metric_name, self.start, self.end
        );

        let mut summary = ExpansionSummary::default();
        let sink = self.sink.as_mut();
        // Never flush mid-state, a state's records stay together
        let flush_at = self.batch_size.max(HVAC_ACTIONS.len());
        let mut batch: Vec<DestinationRecord> = Vec::with_capacity(flush_at);

        for day in days_between(self.start, self.end) {
            let (start, end) = day_window(day);
            let mut states = self
                .source
                .query_states(start, end, ACTION_DOMAIN, ACTION_FIELD)
                .await
                .with_context(|| format!("failed to query action states for {day}"))?;

            let mut day_states = 0;
            while let Some(state) = states
                .try_next()
                .await
                .with_context(|| format!("failed to read action states for {day}"))?
            {
                summary.states += 1;
                day_states += 1;

                let Some(records) = expand_action(&state, &self.metric_name, &self.labels) else {
                    summary.skipped += 1;
                    metrics::counter!(RECORDS_SKIPPED).increment(1);
                    continue;
                };
                if !is_known_action(&state.state) {
                    warn!(
                        "Unknown hvac action '{}' on {}",
                        state.state, state.entity_id
                    );
                    summary.unknown += 1;
                }

                batch.extend(records);
                if batch.len() + HVAC_ACTIONS.len() > flush_at {
                    summary.points += sink.write_batch(&batch).await? as u64;
                    summary.batches += 1;
                    batch.clear();
                }
            }
            debug!("Expanded {day_states} action states for {day}");
        }

        if !batch.is_empty() {
            summary.points += sink.write_batch(&batch).await? as u64;
            summary.batches += 1;
        }

        info!(
            "Expansion done: {} states, {} points in {} batches, {} skipped, {} unknown",
            summary.states, summary.points, summary.batches, summary.skipped, summary.unknown
        );
        Ok(summary)
    }
}
