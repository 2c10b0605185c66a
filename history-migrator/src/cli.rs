use clap::{Parser, Subcommand};

use crate::config::Config;

/// Command line flags. Anything given here overrides the environment.
#[derive(Parser, Debug, Default)]
#[command(
    name = "history-migrator",
    version,
    about = "Migrate Home Assistant history from InfluxDB to VictoriaMetrics"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Validate every record against the mapping ruleset without writing anything
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Back up and delete the checkpoint before starting
    #[arg(long, global = true)]
    pub reset: bool,

    /// First day to migrate (YYYY-MM-DD)
    #[arg(long, global = true)]
    pub start_date: Option<String>,

    /// Last day to migrate, inclusive (YYYY-MM-DD)
    #[arg(long, global = true)]
    pub end_date: Option<String>,

    /// Only migrate these domains
    #[arg(long, global = true, value_delimiter = ',')]
    pub domains: Option<Vec<String>>,

    /// Explicit source fields to migrate
    #[arg(long, global = true, value_delimiter = ',')]
    pub fields: Option<Vec<String>>,

    /// Also migrate known attribute fields (climate, cover and light)
    #[arg(long, global = true)]
    pub extended_fields: bool,

    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    #[arg(long, global = true)]
    pub schema_path: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Day-by-day resumable migration (the default)
    Migrate,
    /// Expand climate hvac_action strings into one series per action
    HvacAction,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Migrate)
    }

    pub fn apply(&self, config: &mut Config) {
        if self.dry_run {
            config.dry_run = true;
        }
        if self.reset {
            config.reset = true;
        }
        if self.extended_fields {
            config.extended_fields = true;
        }
        if let Some(start_date) = &self.start_date {
            config.start_date = start_date.clone();
        }
        if let Some(end_date) = &self.end_date {
            config.end_date = end_date.clone();
        }
        if let Some(domains) = &self.domains {
            config.domains = domains.join(",");
        }
        if let Some(fields) = &self.fields {
            config.fields = fields.join(",");
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if let Some(schema_path) = &self.schema_path {
            config.schema_path = schema_path.clone();
        }
    }
}
