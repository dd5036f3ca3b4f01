use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use sscontrol::config::ConfigHandle;
use sscontrol::logging::init_logging;
use sscontrol::services::{ControlPlane, Inventory};
use sscontrol::tasks::{Job, JobRunner};
use sscontrol::version::VERSION;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Inventory to seed the fleet from, overrides the configured one
    #[arg(short, long)]
    inventory: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the periodic jobs until interrupted (default)
    Serve,
    /// Apply the desired state of every assignment once
    Heartbeat,
    /// Read the daemons' counters once
    Collect,
    /// Collect, then consolidate the statistics
    Statistic,
    /// Recreate every port so the daemons count from zero
    Reset,
    /// Ask every node for a new address at once
    RotateIps,
    /// Replace node addresses one at a time
    RotateIpsSoftly,
}

impl Command {
    fn job(self) -> Option<Job> {
        match self {
            Command::Serve => None,
            Command::Heartbeat => Some(Job::Heartbeat),
            Command::Collect => Some(Job::Collect),
            Command::Statistic => Some(Job::Statistic),
            Command::Reset => Some(Job::Reset),
            Command::RotateIps => Some(Job::RotateIps),
            Command::RotateIpsSoftly => Some(Job::RotateIpsSoftly),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Manually check for --version before full parsing to keep the output simple.
    if std::env::args().any(|arg| arg == "--version") {
        println!("sscontrol version: {VERSION}");
        return Ok(());
    }

    let args = Args::parse();

    let config = match ConfigHandle::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };
    init_logging(&config.get().log_dir);
    info!("Starting sscontrol, version: {}", VERSION);

    let plane = Arc::new(ControlPlane::new(config.clone()));

    if let Some(path) = args.inventory.or_else(|| config.get().inventory.clone()) {
        let inventory = Inventory::load(Path::new(&path)).map_err(|e| {
            error!(path = %path, error = %e, "Failed to load inventory.");
            e
        })?;
        inventory.apply(&plane.fleet).await.map_err(|e| {
            error!(path = %path, error = %e, "Failed to apply inventory.");
            e
        })?;
    }

    let runner = Arc::new(JobRunner::new(plane));
    match args.command.unwrap_or(Command::Serve).job() {
        Some(job) => {
            runner.run_job(job).await;
        }
        None => {
            let handles = runner.run_periodic_tasks();
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, stopping jobs.");
            for handle in handles {
                handle.abort();
            }
        }
    }
    Ok(())
}
