use std::{collections::HashSet, fmt::Display};

use tracing::{error, info};

/// How many distinct unmapped combinations a dry run lists.
pub const MAX_REPORTED_UNMAPPED: usize = 20;
pub const MAX_REPORTED_IGNORED: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnmappedCombination {
    pub domain: String,
    pub unit: String,
    pub entity_id: String,
    pub field: String,
}

impl Display for UnmappedCombination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "domain='{}', unit='{}', entity_id='{}', field='{}'",
            self.domain, self.unit, self.entity_id, self.field
        )
    }
}

/// A `(domain, unit)` pair the ruleset skips.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IgnoredCombination {
    pub domain: String,
    pub unit: String,
}

impl Display for IgnoredCombination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "domain='{}', unit='{}'", self.domain, self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
}

/// Tally of a validation-only pass over the source.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub total: u64,
    pub mapped: u64,
    pub ignored: u64,
    pub unmapped: u64,
    pub filtered: u64,
    unmapped_combinations: Vec<UnmappedCombination>,
    seen: HashSet<UnmappedCombination>,
    ignored_combinations: Vec<IgnoredCombination>,
    seen_ignored: HashSet<IgnoredCombination>,
}

impl ValidationReport {
    pub fn record_mapped(&mut self) {
        self.total += 1;
        self.mapped += 1;
    }

    pub fn record_ignored(&mut self, domain: &str, unit: &str) {
        self.total += 1;
        self.ignored += 1;
        let combination = IgnoredCombination {
            domain: domain.to_string(),
            unit: unit.to_string(),
        };
        if self.seen_ignored.insert(combination.clone()) {
            self.ignored_combinations.push(combination);
        }
    }

    pub fn record_filtered(&mut self) {
        self.total += 1;
        self.filtered += 1;
    }

    /// Returns true the first time a combination is seen.
    pub fn record_unmapped(&mut self, combination: UnmappedCombination) -> bool {
        self.total += 1;
        self.unmapped += 1;
        if self.seen.contains(&combination) {
            return false;
        }
        self.seen.insert(combination.clone());
        self.unmapped_combinations.push(combination);
        true
    }

    pub fn verdict(&self) -> Verdict {
        if self.unmapped == 0 {
            Verdict::Passed
        } else {
            Verdict::Failed
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict() == Verdict::Passed
    }

    pub fn distinct_unmapped(&self) -> usize {
        self.unmapped_combinations.len()
    }

    /// The first distinct combinations, in the order they were met.
    pub fn reported_unmapped(&self) -> &[UnmappedCombination] {
        let end = self.unmapped_combinations.len().min(MAX_REPORTED_UNMAPPED);
        &self.unmapped_combinations[..end]
    }

    pub fn distinct_ignored(&self) -> usize {
        self.ignored_combinations.len()
    }

    pub fn reported_ignored(&self) -> &[IgnoredCombination] {
        let end = self.ignored_combinations.len().min(MAX_REPORTED_IGNORED);
        &self.ignored_combinations[..end]
    }

    pub fn log_summary(&self) {
        info!(
            "Dry run: {} records, {} mapped, {} ignored, {} unmapped, {} filtered",
            self.total, self.mapped, self.ignored, self.unmapped, self.filtered
        );

        for combination in self.reported_ignored() {
            info!("Skipped: {combination}");
        }
        let hidden_ignored = self.distinct_ignored() - self.reported_ignored().len();
        if hidden_ignored > 0 {
            info!("... and {hidden_ignored} more skipped combinations");
        }

        if self.passed() {
            info!("Dry run passed, every record maps to a known metric");
            return;
        }

        for combination in self.reported_unmapped() {
            error!("UNMAPPED: {combination}");
        }
        let hidden = self.distinct_unmapped() - self.reported_unmapped().len();
        if hidden > 0 {
            error!("... and {hidden} more unmapped combinations");
        }
        error!("Dry run failed, fix the mapping ruleset before migrating");
    }
}
