use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobharvest_storage::CsvMasterStore;
use jobharvest_sync::{
    build_scheduler, master_status, RunOutcome, RunSummary, SyncConfig, SyncPipeline,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobharvest")]
#[command(about = "Incremental job listing harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync against the job board.
    Sync {
        /// Read listing pages and detail payloads from a fixture directory instead of the network.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show where the master dataset lives and how many rows it holds.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run sync on the configured cron schedule until interrupted.
    Schedule,
}

fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("run_{}.log", now.format("%Y-%m-%d_%H-%M"))
}

fn init_tracing(log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let log_path = log_dir.join(log_file_name(chrono::Local::now()));
    let file = File::options()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(log_path)
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    let outcome = match &summary.outcome {
        RunOutcome::NoNewJobs => "no new jobs".to_string(),
        RunOutcome::Completed { report } => format!("merged, master rows={}", report.total_rows()),
        RunOutcome::MergeDegraded { backup_path, .. } => {
            format!("merge failed, backup={}", backup_path.display())
        }
    };
    println!(
        "sync complete: run_id={} ids={} new={} fetched={} unavailable={} outcome={}",
        summary.run_id,
        summary.ids.unique,
        summary.ids.new,
        summary.records_fetched,
        summary.records_unavailable,
        outcome
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let log_path = init_tracing(&config.log_dir)?;
    info!(log = %log_path.display(), "logging initialised");

    match cli
        .command
        .unwrap_or(Commands::Sync { fixtures: None, json: false })
    {
        Commands::Sync { fixtures, json } => {
            let pipeline = match fixtures {
                Some(dir) => SyncPipeline::from_fixtures(config, dir)?,
                None => SyncPipeline::from_config(config)?,
            };
            let summary = pipeline.run_reporting_crash().await?;
            print_summary(&summary, json)?;
        }
        Commands::Status { json } => {
            let status = master_status(&CsvMasterStore::new(config.storage_path.clone()));
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("master: {}", status.path.display());
                match (status.exists, status.rows, status.error) {
                    (false, _, _) => println!("status: not created yet"),
                    (true, Some(rows), _) => println!(
                        "rows: {rows} (unique ids: {})",
                        status.unique_ids.unwrap_or_default()
                    ),
                    (true, None, error) => {
                        println!("unreadable: {}", error.unwrap_or_default())
                    }
                }
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set JOBHARVEST_SCHEDULER_ENABLED=true");
            }
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::from_config(config)?);
            let mut sched = build_scheduler(pipeline, &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
