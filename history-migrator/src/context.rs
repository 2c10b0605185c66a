use std::sync::Arc;

use anyhow::{Context, Error};
use tracing::info;

use crate::{
    checkpoint::CheckpointStore,
    config::{Config, RunOptions},
    emit::ImportSink,
    job::{state_expansion::StateExpansion, Migration},
    mapping::{ruleset::MappingRuleset, MappingEngine},
    source::InfluxSource,
};

/// Everything a run needs that is derived once from the configuration.
pub struct AppContext {
    pub config: Config,
    pub options: RunOptions,
    pub ruleset: MappingRuleset,
}

impl AppContext {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let options = config.run_options()?;
        let ruleset = MappingRuleset::from_path(&config.schema_path)
            .with_context(|| format!("failed to load mapping ruleset {}", config.schema_path))?;

        Ok(Self {
            config: config.clone(),
            options,
            ruleset,
        })
    }

    pub fn source(&self) -> Result<InfluxSource, Error> {
        let fields = self.options.fields.query_fields();
        InfluxSource::builder(
            self.config.influx_url.clone(),
            self.config.influx_token.clone(),
            self.config.influx_org.clone(),
            self.config.influx_bucket.clone(),
        )
        .with_fields(fields)
        .with_domains(self.config.domain_list())
        .with_timeout(self.config.source_timeout())
        .build()
        .context("failed to build InfluxDB client")
    }

    pub fn sink(&self, dry_run: bool) -> Result<ImportSink, Error> {
        Ok(
            ImportSink::new(&self.config.vm_url, self.config.request_timeout(), dry_run)
                .context("failed to build VictoriaMetrics client")?
                .with_retry_policy(self.config.retry_policy()),
        )
    }

    /// Fetches the destination's metric names, which strict mapping validates against.
    pub async fn migration(&self) -> Result<Migration, Error> {
        let sink = self.sink(self.options.dry_run)?;
        let known = sink
            .fetch_known_metrics(&self.ruleset.namespace)
            .await
            .context("failed to fetch known metrics from VictoriaMetrics")?;
        info!("Loaded {} known metrics", known.len());

        let engine = Arc::new(MappingEngine::new(self.ruleset.clone(), known));
        let checkpoints = CheckpointStore::open(&self.config.state_dir)
            .await
            .with_context(|| format!("failed to open state dir {}", self.config.state_dir))?;

        Ok(Migration::new(
            engine,
            Box::new(self.source()?),
            Box::new(sink),
            checkpoints,
            self.options.clone(),
        ))
    }

    pub fn state_expansion(&self) -> Result<StateExpansion, Error> {
        Ok(StateExpansion::new(
            Box::new(self.source()?),
            Box::new(self.sink(self.options.dry_run)?),
            &self.ruleset.namespace,
            self.ruleset.labels.clone(),
            self.options.start_date,
            self.options.end_date,
            self.options.batch_size,
            self.options.dry_run,
        ))
    }
}
