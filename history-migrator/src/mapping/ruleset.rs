use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::RulesetError;

pub const DEFAULT_NAMESPACE: &str = "homeassistant";
pub const DEFAULT_PATTERN: &str = "default";

pub const ENTITY_LABEL: &str = "entity";
pub const DOMAIN_LABEL: &str = "domain";
pub const FRIENDLY_NAME_LABEL: &str = "friendly_name";

const DEFAULT_ENTITY_TEMPLATE: &str = "{domain}.{entity_id}";
const REQUIRED_SECTIONS: [&str; 3] = ["labels", "metric_mappings", "special_mappings"];
const OPTIONAL_SECTIONS: [&str; 1] = ["field_mappings"];

/// The declarative renaming rules, loaded once at startup from YAML.
///
/// `metric_mappings` is keyed by domain then unit (the source measurement),
/// `field_mappings` by domain then field name, and `special_mappings` by unit.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingRuleset {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub labels: LabelRules,
    pub metric_mappings: HashMap<String, HashMap<String, MetricRule>>,
    #[serde(default)]
    pub field_mappings: HashMap<String, HashMap<String, FieldRule>>,
    pub special_mappings: HashMap<String, DisambiguationRules>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetricRule {
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub allow_new: bool,
    #[serde(default, alias = "needs_disambiguation")]
    pub special_mapping_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FieldRule {
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub ignore: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DisambiguationRules {
    #[serde(default)]
    pub rules: Vec<DisambiguationRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DisambiguationRule {
    pub pattern: String,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub ignore: bool,
}

impl DisambiguationRule {
    pub fn is_default(&self) -> bool {
        self.pattern.eq_ignore_ascii_case(DEFAULT_PATTERN)
    }

    // Callers lowercase the entity id once per lookup
    fn matches(&self, entity_id_lower: &str) -> bool {
        entity_id_lower.contains(&self.pattern.to_lowercase())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelRules {
    #[serde(default, rename = "static")]
    pub static_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub computed: ComputedLabels,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComputedLabels {
    #[serde(default)]
    pub entity: Option<TemplateRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRule {
    pub template: String,
}

impl LabelRules {
    pub fn entity_label(&self, domain: &str, entity_id: &str) -> String {
        let template = self
            .computed
            .entity
            .as_ref()
            .map(|t| t.template.as_str())
            .unwrap_or(DEFAULT_ENTITY_TEMPLATE);
        template
            .replace("{domain}", domain)
            .replace("{entity_id}", entity_id)
    }

    /// Static labels are applied last, so they win over the computed ones on a key clash.
    pub fn build(
        &self,
        domain: &str,
        entity_id: &str,
        display_name: &str,
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            ENTITY_LABEL.to_string(),
            self.entity_label(domain, entity_id),
        );
        labels.insert(DOMAIN_LABEL.to_string(), domain.to_string());
        labels.insert(FRIENDLY_NAME_LABEL.to_string(), display_name.to_string());
        for (key, value) in &self.static_labels {
            labels.insert(key.clone(), value.clone());
        }
        labels
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl MappingRuleset {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RulesetError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RulesetError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| RulesetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, RulesetError> {
        let mut document: Value = serde_yaml::from_str(raw)?;

        let Some(sections) = document.as_mapping_mut() else {
            return Err(RulesetError::MissingSections(
                REQUIRED_SECTIONS.iter().map(|s| s.to_string()).collect(),
            ));
        };

        let missing: Vec<String> = REQUIRED_SECTIONS
            .iter()
            .filter(|section| !sections.contains_key(**section))
            .map(|section| section.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(RulesetError::MissingSections(missing));
        }

        // An empty section (`special_mappings:` with nothing under it) parses as null
        for section in REQUIRED_SECTIONS.iter().chain(OPTIONAL_SECTIONS.iter()) {
            if let Some(value) = sections.get_mut(*section) {
                if value.is_null() {
                    *value = Value::Mapping(Mapping::new());
                }
            }
        }

        let ruleset: MappingRuleset = serde_yaml::from_value(document)?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    fn validate(&self) -> Result<(), RulesetError> {
        let mut domains: Vec<_> = self.metric_mappings.iter().collect();
        domains.sort_by(|a, b| a.0.cmp(b.0));

        for (domain, units) in domains {
            let mut units: Vec<_> = units.iter().collect();
            units.sort_by(|a, b| a.0.cmp(b.0));

            for (unit, rule) in units {
                if !rule.special_mapping_required {
                    continue;
                }
                let has_default = self
                    .disambiguation_rules(unit)
                    .iter()
                    .any(DisambiguationRule::is_default);
                if !has_default {
                    return Err(RulesetError::MissingDisambiguation {
                        domain: domain.clone(),
                        unit: unit.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn metric_rule(&self, domain: &str, unit: &str) -> Option<&MetricRule> {
        self.metric_mappings.get(domain)?.get(unit)
    }

    pub fn field_rule(&self, domain: &str, field: &str) -> Option<&FieldRule> {
        self.field_mappings.get(domain)?.get(field)
    }

    pub fn disambiguation_rules(&self, unit: &str) -> &[DisambiguationRule] {
        self.special_mappings
            .get(unit)
            .map(|r| r.rules.as_slice())
            .unwrap_or(&[])
    }

    /// Non-default patterns in declared order, then the default rule.
    pub fn disambiguate(&self, unit: &str, entity_id: &str) -> Option<&DisambiguationRule> {
        let rules = self.disambiguation_rules(unit);
        let entity_id_lower = entity_id.to_lowercase();
        rules
            .iter()
            .filter(|rule| !rule.is_default())
            .find(|rule| rule.matches(&entity_id_lower))
            .or_else(|| rules.iter().find(|rule| rule.is_default()))
    }

    pub fn fallback_metric(&self, domain: &str) -> String {
        format!("{}_{}_state", self.namespace, domain)
    }

    pub fn metric_prefix(&self) -> String {
        format!("{}_", self.namespace)
    }
}
