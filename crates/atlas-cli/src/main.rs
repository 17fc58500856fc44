use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "atlas-cli")]
#[command(about = "Paper Atlas rolling-window sync")]
struct Cli {
    /// Print summaries as JSON instead of one line of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch-merge-persist cycle.
    Sync,
    /// Re-score every stored record with the current rules.
    Rescan,
    /// Run cycles on ATLAS_SYNC_CRON until interrupted.
    Schedule,
    /// Print row count, date range and reputation counts of a table.
    Inspect {
        /// Defaults to the configured store path.
        path: Option<PathBuf>,
    },
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,h2=warn,hyper=warn,reqwest=warn"))
        .context("building log filter")?;
    let json = std::env::var("ATLAS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    installed.context("initializing logging")
}

fn emit<T: serde::Serialize>(json: bool, value: &T, line: String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = atlas_sync::run_sync_once_from_env().await?;
            let line = format!(
                "sync complete: run_id={} fetched={} added={} known={} rejected={} pruned={} written={} sha256={}",
                summary.run_id,
                summary.fetched,
                summary.records_added,
                summary.already_known,
                summary.rejected,
                summary.pruned,
                summary.records_written,
                summary.table_sha256
            );
            emit(cli.json, &summary, line)?;
        }
        Commands::Rescan => {
            let summary = atlas_sync::run_rescan_from_env().await?;
            let line = format!(
                "rescan complete: run_id={} written={} reclassified={} enhanced={} pruned={}",
                summary.run_id,
                summary.records_written,
                summary.reclassified,
                summary.enhanced,
                summary.pruned
            );
            emit(cli.json, &summary, line)?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(atlas_sync::pipeline_from_env()?);
            let cron = pipeline.config().sync_cron.clone();
            let mut sched = atlas_sync::maybe_build_scheduler(pipeline)
                .await?
                .context("scheduler disabled; set ATLAS_SCHEDULER_ENABLED=1")?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Inspect { path } => {
            let path = match path {
                Some(path) => path,
                None => atlas_sync::SyncConfig::from_env()?.store_path,
            };
            let stats = atlas_sync::inspect_store(&path)?;
            let range = match (stats.earliest, stats.latest) {
                (Some(first), Some(last)) => format!("{first}..={last}"),
                _ => "empty".to_string(),
            };
            let line = format!(
                "{}: rows={} dates={} standard={} enhanced={}",
                stats.table_path, stats.rows, range, stats.standard, stats.enhanced
            );
            emit(cli.json, &stats, line)?;
        }
    }

    Ok(())
}
