mod crontab;
mod daemon;
mod dispatch;
mod wiring;

use std::path::PathBuf;

use anyhow::bail;
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

use cronjob_config::CronJobConfig;
use cronjob_types::TriggerResponse;
use wiring::Engine;

#[derive(Parser)]
#[command(name = "cronjob", version, about = "Per-minute cron trigger coordinator")]
struct Cli {
    /// Config file (defaults to $CRONJOB_CONFIG or ~/.cronjob/config.json5)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the current minute once and dispatch due tasks
    Run,
    /// Start the scheduler loop (in the background unless --blocking)
    Start {
        /// Stay in the foreground
        #[arg(long)]
        blocking: bool,

        /// Stop once this marker file is removed
        #[arg(long, hide = true)]
        pid_file: Option<PathBuf>,
    },
    /// Stop a background scheduler by removing its marker file
    Stop,
    /// Serve the HTTP trigger endpoint
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Install a crontab entry that runs `cronjob run` every minute
    AddCrontab,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => cronjob_config::load_config_from(path)?,
        None => cronjob_config::load_config()?,
    };

    match cli.command {
        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_once(&config))?;
        }
        Commands::Start {
            blocking: true,
            pid_file,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_foreground(&config, pid_file))?;
        }
        Commands::Start {
            blocking: false, ..
        } => {
            let pid_file = config.scheduler.pid_file_path();
            if pid_file.exists() {
                bail!(
                    "marker file {} exists; a scheduler may already be running (use `cronjob stop`)",
                    pid_file.display()
                );
            }
            let pid = daemon::spawn_background(&pid_file, cli.config.as_deref(), cli.verbose)?;
            println!("Cron scheduler started in background (pid {pid})");
            println!("  marker file: {}", pid_file.display());
        }
        Commands::Stop => {
            let pid_file = config.scheduler.pid_file_path();
            let pid = daemon::read_pid(&pid_file);
            if daemon::remove_pid_file(&pid_file)? {
                match pid {
                    Some(pid) => println!("Stop requested for scheduler pid {pid}; it exits at the next minute"),
                    None => println!("Stop requested; the scheduler exits at the next minute"),
                }
            } else {
                println!("No background scheduler marker at {}", pid_file.display());
            }
        }
        Commands::Serve { port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let engine = Engine::build(&config)?;
                cronjob_gateway::start_gateway(&config.gateway, engine.coordinator, port).await
            })?;
        }
        Commands::AddCrontab => {
            let dir = std::env::current_dir()?;
            let exe = std::env::current_exe()?;
            let line = crontab::crontab_line(&dir, &exe, cli.config.as_deref());
            if crontab::install(&line)? {
                println!("Crontab entry added:\n  {line}");
            } else {
                println!("Crontab entry already present:\n  {line}");
            }
        }
    }

    Ok(())
}

/// A pass that finds nothing to do is not a failure.
async fn run_once(config: &CronJobConfig) -> anyhow::Result<()> {
    let engine = Engine::build(config)?;
    let triggered = engine.coordinator.trigger_scheduled_tasks().await;
    println!(
        "{}",
        if triggered {
            TriggerResponse::TRIGGERED
        } else {
            TriggerResponse::SKIPPED
        }
    );
    Ok(())
}

async fn run_foreground(config: &CronJobConfig, pid_file: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = Engine::build(config)?;
    let mut scheduler = engine.scheduler(&config.scheduler);
    if let Some(path) = pid_file {
        scheduler = scheduler.with_marker_file(path);
    }

    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping scheduler");
            cancel.cancel();
        }
    });

    scheduler.run().await?;
    Ok(())
}
