use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::{error::MappingError, source::DEFAULT_FIELD};

pub mod known;
pub mod ruleset;

pub use known::KnownMetricSet;
pub use ruleset::MappingRuleset;

/// Outcome of looking a record's identity up in the ruleset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Metric(String),
    /// The ruleset explicitly drops this record. Never an error.
    Ignored,
    /// No rule covers a non-default field.
    Unmapped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub valid: usize,
    pub errors: Vec<String>,
}

impl ValidationSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Ruleset plus known-metric snapshot. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct MappingEngine {
    ruleset: MappingRuleset,
    known: KnownMetricSet,
}

impl MappingEngine {
    pub fn new(ruleset: MappingRuleset, known: KnownMetricSet) -> Self {
        Self { ruleset, known }
    }

    pub fn ruleset(&self) -> &MappingRuleset {
        &self.ruleset
    }

    pub fn known_metrics(&self) -> &KnownMetricSet {
        &self.known
    }

    /// Best-effort resolution. Metric names are not checked against the known set.
    pub fn resolve(&self, domain: &str, unit: &str, entity_id: &str, field: &str) -> Resolution {
        if field != DEFAULT_FIELD {
            return self.resolve_field(domain, field);
        }

        let Some(rule) = self.ruleset.metric_rule(domain, unit) else {
            let fallback = self.ruleset.fallback_metric(domain);
            warn!("No metric mapping for domain={domain}, unit={unit}, falling back to {fallback}");
            return Resolution::Metric(fallback);
        };

        if rule.ignore {
            return Resolution::Ignored;
        }

        if rule.special_mapping_required {
            if let Some(matched) = self.ruleset.disambiguate(unit, entity_id) {
                if matched.ignore {
                    return Resolution::Ignored;
                }
                if let Some(metric) = &matched.metric {
                    return Resolution::Metric(metric.clone());
                }
            }
        }

        match &rule.metric {
            Some(metric) => Resolution::Metric(metric.clone()),
            None => Resolution::Metric(self.ruleset.fallback_metric(domain)),
        }
    }

    fn resolve_field(&self, domain: &str, field: &str) -> Resolution {
        match self.ruleset.field_rule(domain, field) {
            None => {
                warn!("No field mapping for domain={domain}, field={field}");
                Resolution::Unmapped
            }
            Some(rule) if rule.ignore => Resolution::Ignored,
            Some(rule) => match &rule.metric {
                Some(metric) => Resolution::Metric(metric.clone()),
                None => Resolution::Unmapped,
            },
        }
    }

    /// Resolution plus validation against the known metric set. `Ignored` and
    /// `Unmapped` pass through untouched.
    pub fn resolve_strict(
        &self,
        domain: &str,
        unit: &str,
        entity_id: &str,
        field: &str,
    ) -> Result<Resolution, MappingError> {
        match self.resolve(domain, unit, entity_id, field) {
            Resolution::Metric(name) => self.validate_metric(domain, unit, entity_id, field, name),
            other => Ok(other),
        }
    }

    fn validate_metric(
        &self,
        domain: &str,
        unit: &str,
        entity_id: &str,
        field: &str,
        name: String,
    ) -> Result<Resolution, MappingError> {
        if self.known.contains(&name) {
            return Ok(Resolution::Metric(name));
        }
        if self.is_new_metric_allowed(domain, unit) {
            info!("Creating new metric {name} for domain={domain}, unit={unit}");
            return Ok(Resolution::Metric(name));
        }
        Err(MappingError::UnknownMetric {
            domain: domain.to_string(),
            unit: unit.to_string(),
            entity_id: entity_id.to_string(),
            field: field.to_string(),
            metric: name,
        })
    }

    pub fn is_ignored(&self, domain: &str, unit: &str) -> bool {
        self.ruleset
            .metric_rule(domain, unit)
            .is_some_and(|rule| rule.ignore)
    }

    pub fn is_new_metric_allowed(&self, domain: &str, unit: &str) -> bool {
        self.ruleset
            .metric_rule(domain, unit)
            .is_some_and(|rule| rule.allow_new)
    }

    pub fn is_known_metric(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    pub fn build_labels(
        &self,
        domain: &str,
        entity_id: &str,
        display_name: &str,
    ) -> BTreeMap<String, String> {
        self.ruleset.labels.build(domain, entity_id, display_name)
    }

    /// Preflight a set of `(domain, unit, entity_id)` triples on the default field. Never fails.
    pub fn dry_run_validate(&self, records: &[(&str, &str, &str)]) -> ValidationSummary {
        let mut summary = ValidationSummary::default();

        for (domain, unit, entity_id) in records {
            match self.resolve_strict(domain, unit, entity_id, DEFAULT_FIELD) {
                Ok(Resolution::Metric(_)) | Ok(Resolution::Ignored) => summary.valid += 1,
                Ok(Resolution::Unmapped) => summary.errors.push(
                    MappingError::Unmapped {
                        domain: domain.to_string(),
                        unit: unit.to_string(),
                        entity_id: entity_id.to_string(),
                        field: DEFAULT_FIELD.to_string(),
                    }
                    .to_string(),
                ),
                Err(e) => summary.errors.push(format!(
                    "Failed to map record: domain='{domain}', unit='{unit}', entity_id='{entity_id}' - {e}"
                )),
            }
        }

        summary
    }
}
