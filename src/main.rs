//! # Tasklane, an in-process task orchestrator
//!
//! Usage:
//!   tasklane                              # Run with ~/.tasklane/config.toml
//!   tasklane run --workers 8              # Override the worker pool size
//!   tasklane --config ./tasklane.toml run # Explicit config file
//!   tasklane check-config                 # Print the effective configuration

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tasklane_core::TasklaneConfig;
use tasklane_scheduler::{Orchestrator, builtin};

#[derive(Parser)]
#[command(
    name = "tasklane",
    version,
    about = "⏰ Tasklane — priority task orchestrator with dependencies and retries"
)]
struct Cli {
    /// Config file (default: ~/.tasklane/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestrator, submit configured seed tasks, run until Ctrl-C
    Run {
        /// Worker pool size
        #[arg(short, long)]
        workers: Option<usize>,

        /// Coordinating loop interval in milliseconds
        #[arg(long)]
        tick_ms: Option<u64>,

        /// Seconds between metrics reports
        #[arg(long, default_value = "30")]
        report_secs: u64,
    },
    /// Load the configuration, validate it, and print it
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<TasklaneConfig> {
    let config = match path {
        Some(p) => {
            let path = TasklaneConfig::expand_path(p);
            TasklaneConfig::load_from(&path)
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => TasklaneConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tasklane=debug,tasklane_scheduler=debug"
    } else {
        "tasklane=info,tasklane_scheduler=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run {
        workers: None,
        tick_ms: None,
        report_secs: 30,
    }) {
        Command::CheckConfig => {
            println!("{}", config.to_toml()?);
            println!("✅ Config OK ({} seed task(s))", config.tasks.len());
        }
        Command::Run {
            workers,
            tick_ms,
            report_secs,
        } => {
            if let Some(workers) = workers {
                config.scheduler.max_workers = workers;
            }
            if let Some(tick_ms) = tick_ms {
                config.scheduler.tick_interval_ms = tick_ms;
            }
            config.validate()?;
            run(config, Duration::from_secs(report_secs.max(1))).await?;
        }
    }
    Ok(())
}

async fn run(config: TasklaneConfig, report_every: Duration) -> Result<()> {
    let orchestrator = Orchestrator::new(&config);
    builtin::register_defaults(&orchestrator).await?;

    let seeds = orchestrator
        .submit_seeds(&config.tasks)
        .await
        .context("submitting seed tasks")?;
    if !seeds.is_empty() {
        tracing::info!("🌱 Submitted {} seed task(s)", seeds.len());
    }

    orchestrator.start().await;

    let mut report = tokio::time::interval(report_every);
    report.tick().await;
    loop {
        tokio::select! {
            _ = report.tick() => {
                let m = orchestrator.get_metrics().await;
                tracing::info!(
                    "📊 {} created, {} completed, {} failed, {} cancelled | {} running, {} queued | {:.1}% success, {:.2}/min",
                    m.total_tasks_created,
                    m.total_tasks_completed,
                    m.total_tasks_failed,
                    m.total_tasks_cancelled,
                    m.active_tasks,
                    m.queued_tasks,
                    m.success_rate,
                    m.tasks_per_minute
                );
                for stuck in orchestrator.stuck_tasks().await {
                    tracing::warn!(
                        "🧱 Task {} can never run: missing {:?}, unsuccessful {:?}",
                        stuck.id,
                        stuck.missing,
                        stuck.unsuccessful
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!("⚠️ Ctrl-C handler failed: {e}");
                }
                break;
            }
        }
    }

    tracing::info!("👋 Shutting down...");
    if !orchestrator.stop().await {
        tracing::warn!("⚠️ Some workers were aborted at shutdown");
    }
    let summary = orchestrator.get_metrics().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
