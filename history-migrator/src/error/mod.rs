use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RulesetError {
    #[error("mapping ruleset not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to read mapping ruleset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed mapping ruleset: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("mapping ruleset is missing required sections: {}", .0.join(", "))]
    MissingSections(Vec<String>),
    #[error(
        "metric_mappings.{domain}.{unit} requires disambiguation but special_mappings has no '{unit}' rules with a default"
    )]
    MissingDisambiguation { domain: String, unit: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error(
        "Unknown metric '{metric}' generated from domain='{domain}', unit='{unit}', entity_id='{entity_id}', field='{field}'. Not in known metrics list."
    )]
    UnknownMetric {
        domain: String,
        unit: String,
        entity_id: String,
        field: String,
        metric: String,
    },
    #[error("No mapping for domain='{domain}', unit='{unit}', entity_id='{entity_id}', field='{field}'")]
    Unmapped {
        domain: String,
        unit: String,
        entity_id: String,
        field: String,
    },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("write rejected with status {status}: {body}")]
    Write { status: u16, body: String },
    #[error("failed to reach {url}: {source}")]
    Connectivity {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("destination api error: {0}")]
    Api(String),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to reach source: {0}")]
    Connectivity(#[from] reqwest::Error),
    #[error("source query failed with status {status}: {body}")]
    Query { status: u16, body: String },
    #[error("failed to decode source response: {0}")]
    Decode(String),
    #[error("source returned no records for the time range query")]
    Empty,
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

// Walk the error chain looking for a transport-level failure on either side of the pipeline.
// Used to decide whether a failure says anything about the data or only about the network.
pub fn is_connectivity_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<SinkError>(),
            Some(SinkError::Connectivity { .. })
        ) || matches!(
            cause.downcast_ref::<SourceError>(),
            Some(SourceError::Connectivity(_))
        )
    })
}

pub fn truncate_chars(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}
