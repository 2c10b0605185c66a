use std::collections::BTreeSet;

use super::DEFAULT_FIELD;

// Attribute fields worth migrating per domain, on top of the primary reading
const EXTENDED_FIELDS: &[(&str, &[&str])] = &[
    ("climate", &["value", "current_temperature", "temperature"]),
    ("cover", &["value", "current_position"]),
    ("light", &["value", "brightness"]),
];

/// Which source fields a run pulls, and which of them are valid for each domain.
///
/// An explicit list wins over everything and applies to every domain. Otherwise
/// extended mode pulls the per-domain attribute fields, and the default pulls only
/// the primary reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelection {
    explicit: Option<Vec<String>>,
    extended: bool,
}

impl FieldSelection {
    pub fn new(explicit: Option<Vec<String>>, extended: bool) -> Self {
        let explicit = explicit.filter(|fields| !fields.is_empty());
        Self { explicit, extended }
    }

    pub fn default_only() -> Self {
        Self::default()
    }

    pub fn is_extended(&self) -> bool {
        self.extended && self.explicit.is_none()
    }

    pub fn fields_for_domain(&self, domain: &str) -> Vec<String> {
        if let Some(explicit) = &self.explicit {
            return explicit.clone();
        }
        if self.extended {
            if let Some((_, fields)) = EXTENDED_FIELDS.iter().find(|(d, _)| *d == domain) {
                return fields.iter().map(|f| f.to_string()).collect();
            }
        }
        vec![DEFAULT_FIELD.to_string()]
    }

    /// Union of every field any domain may need, sorted, for the source query filter.
    pub fn query_fields(&self) -> Vec<String> {
        if let Some(explicit) = &self.explicit {
            return explicit.clone();
        }
        let mut fields = BTreeSet::new();
        fields.insert(DEFAULT_FIELD.to_string());
        if self.extended {
            for (_, domain_fields) in EXTENDED_FIELDS {
                fields.extend(domain_fields.iter().map(|f| f.to_string()));
            }
        }
        fields.into_iter().collect()
    }

    /// Whether a record with this field should be processed at all. Only extended
    /// mode filters, since the query union can return fields another domain asked for.
    pub fn accepts(&self, domain: &str, field: &str) -> bool {
        if !self.is_extended() {
            return true;
        }
        self.fields_for_domain(domain).iter().any(|f| f == field)
    }
}
