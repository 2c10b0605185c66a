use std::process::ExitCode;

use anyhow::Error;
use clap::Parser;
use envconfig::Envconfig;
use history_migrator::{
    cli::{Cli, Command},
    config::Config,
    context::AppContext,
    job::MigrationOutcome,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

async fn run(cli: Cli) -> Result<u8, Error> {
    let mut config = Config::init_from_env()?;
    cli.apply(&mut config);
    let context = AppContext::new(&config)?;

    match cli.command() {
        Command::Migrate => {
            let mut migration = context.migration().await?;
            let outcome = migration.run().await?;
            let stats = migration.sink_stats();
            match &outcome {
                MigrationOutcome::Completed { days, totals } => info!(
                    "Migration complete: {days} days, {} records in {} batches, {} skipped, {} filtered",
                    totals.records, totals.batches, totals.skipped, totals.filtered
                ),
                MigrationOutcome::Validated(report) => info!(
                    "Dry run finished, {} of {} records mapped",
                    report.mapped, report.total
                ),
                other => info!("Migration did not run: {other:?}"),
            }
            info!(
                "Sink totals: {} points in {} batches",
                stats.points_written, stats.batches_sent
            );
            Ok(outcome.exit_code())
        }
        Command::HvacAction => {
            let mut expansion = context.state_expansion()?;
            let summary = expansion.run().await?;
            info!("Expanded {} action states", summary.states);
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_tracing();
    let cli = Cli::parse();
    info!("Starting up...");

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Migration aborted: {e:?}");
            ExitCode::FAILURE
        }
    }
}
