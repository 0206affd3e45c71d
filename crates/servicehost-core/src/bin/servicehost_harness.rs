//! servicehost-harness - runs one service for a controller.
//!
//! Spawned by `Controller::run`, never by hand. Exits non-zero when the
//! service cannot be loaded or the controller is unreachable.

use anyhow::{Context, Result};
use clap::Parser;
use servicehost_core::config::AppConfig;
use servicehost_core::harness::{Harness, HarnessOptions};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "servicehost-harness")]
#[command(about = "Runs a single service out of process")]
struct Args {
    /// Service directory containing manifest.json
    #[arg(long)]
    run_service: PathBuf,

    /// Rendezvous address of the spawning controller
    #[arg(long)]
    ipc_name: String,

    /// Provider service directory, for dependent services
    #[arg(long)]
    provider_path: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = args.log_level.as_deref().unwrap_or(AppConfig::DEFAULT_LOG_LEVEL);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(AppConfig::DEFAULT_LOG_LEVEL));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let options = HarnessOptions {
        service_dir: args.run_service.clone(),
        ipc_name: args.ipc_name.clone(),
        provider_path: args.provider_path.clone(),
    };
    let harness = Harness::load(&options)
        .with_context(|| format!("cannot load service at {}", options.service_dir.display()))?;
    harness
        .run(&options.ipc_name)
        .await
        .with_context(|| format!("cannot reach controller at {}", options.ipc_name))?;

    info!("service harness exiting");
    Ok(())
}
