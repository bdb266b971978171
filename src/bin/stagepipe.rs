//! stagepipe CLI: run configured stages, inspect queues, clear slot locks.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use stagepipe::config::{Config, PipelineConfig};
use stagepipe::engine::Pipeline;
use stagepipe::hook::CommandStage;
use stagepipe::lock::{FileLockProvider, LeaseExpiry};
use stagepipe::model::QueueRoot;
use stagepipe::pool::ResourcePool;
use stagepipe::telemetry::{TelemetryConfig, init_telemetry};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "stagepipe", about = "Move items through directory-backed stages")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process queued items
    Run {
        /// Which queue roots to drain
        #[arg(long, value_enum, default_value_t = Which::Both)]
        pipeline: Which,
        /// Run only this stage
        #[arg(long)]
        stage: Option<String>,
    },
    /// Show queued, in-flight and rejected counts per stage
    Status,
    /// Remove slot lock files left behind by dead processes
    Unlock,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Which {
    Main,
    Priority,
    Both,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "stagepipe".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let pipeline_config = PipelineConfig::load(&config.pipeline_file)?;

    match cli.command {
        Command::Run { pipeline, stage } => cmd_run(pipeline_config, pipeline, stage).await,
        Command::Status => cmd_status(pipeline_config),
        Command::Unlock => cmd_unlock(pipeline_config),
    }
}

fn build_pipeline(
    config: &PipelineConfig,
    pool: Option<&ResourcePool>,
) -> Pipeline<CommandStage> {
    config.stages.iter().fold(
        Pipeline::new(config.pipeline.clone()),
        |pipeline, settings| {
            let stage = CommandStage::from_settings(settings, pool.cloned());
            pipeline.stage(settings.spec(), stage)
        },
    )
}

async fn cmd_run(config: PipelineConfig, which: Which, only: Option<String>) -> anyhow::Result<ExitCode> {
    if let Some(name) = &only {
        if config.stage(name).is_none() {
            anyhow::bail!("no stage named {name:?} in the pipeline file");
        }
    }

    let pool = config.pool.clone().map(ResourcePool::from_settings).transpose()?;
    let pipeline = build_pipeline(&config, pool.as_ref());
    pipeline.ensure_layout()?;

    if let Some(pool) = pool.clone() {
        tokio::spawn(async move {
            wait_for_signal().await;
            warn!("signal received, releasing endpoint slots");
            pool.shutdown();
            pool.cleanup_all();
            std::process::exit(1);
        });
    }

    let [priority, main] = config.pipeline.roots();
    let roots: Vec<QueueRoot> = match which {
        Which::Priority => vec![priority],
        Which::Main => vec![main],
        Which::Both => vec![priority, main],
    };

    let report = pipeline.run(&roots, only.as_deref()).await;

    if let Some(pool) = &pool {
        pool.cleanup_all();
    }

    info!(
        advanced = report.advanced,
        rejected = report.rejected,
        stopped = report.stopped,
        "run complete"
    );
    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            claim_failures = report.claim_failures,
            relocation_failures = report.relocation_failures,
            "some items were left in place"
        );
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_status(config: PipelineConfig) -> anyhow::Result<ExitCode> {
    let pipeline = build_pipeline(&config, None);
    let rows = pipeline.status()?;

    println!(
        "{:<6}  {:<20}  {:>7}  {:>9}  {:>8}  PROCESSING",
        "ROOT", "STAGE", "QUEUED", "IN-FLIGHT", "REJECTED"
    );
    println!("{}", "-".repeat(72));
    for row in &rows {
        println!(
            "{:<6}  {:<20}  {:>7}  {:>9}  {:>8}  {}",
            row.root,
            row.stage,
            row.queued,
            row.in_flight,
            row.rejected,
            row.processing.as_deref().unwrap_or("-")
        );
    }

    if config.pipeline.stop_flag.exists() {
        println!("\nstop flag present: {}", config.pipeline.stop_flag.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_unlock(config: PipelineConfig) -> anyhow::Result<ExitCode> {
    let Some(pool) = config.pool else {
        println!("No [pool] configured.");
        return Ok(ExitCode::SUCCESS);
    };
    let mut provider = FileLockProvider::new(&pool.lock_dir)?;
    if let Some(secs) = pool.lease_max_age_secs {
        provider = provider.with_liveness(Arc::new(LeaseExpiry::new(Duration::from_secs(secs))));
    }
    let reclaimed = provider.reclaim_stale()?;
    println!("Removed {reclaimed} stale slot lock(s) from {}", provider.lock_dir().display());
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
