//! servicehostd - hosts out-of-process services for local clients.
//!
//! Binds the install's well-known daemon address, scans the install's
//! services directory and serves client sessions until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use servicehost_core::client::{killswitch_exit_code, InstallLayout};
use servicehost_core::config::{AppConfig, PathsConfig};
use servicehost_core::ipc::ChannelServer;
use servicehost_core::{Daemon, DynamicServiceManager, ManagerOptions, ServiceRegistry};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "servicehostd")]
#[command(about = "Service host daemon")]
struct Args {
    /// Product directory holding one subdirectory per installed version
    #[arg(long)]
    product_dir: Option<PathBuf>,

    /// Installed version to run
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    version: String,

    /// Service harness executable (defaults to the one next to this binary)
    #[arg(long)]
    harness: Option<PathBuf>,

    /// Log level for the daemon and the services it spawns
    #[arg(long, default_value = AppConfig::DEFAULT_LOG_LEVEL)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new(AppConfig::DEFAULT_LOG_LEVEL));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn default_product_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|d| d.join(AppConfig::APP_NAME))
        .context("cannot determine the local data directory")
}

fn default_harness() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the daemon executable")?;
    let dir = exe.parent().context("daemon executable has no parent directory")?;
    Ok(dir.join(format!("servicehost-harness{}", std::env::consts::EXE_SUFFIX)))
}

#[cfg(unix)]
async fn terminated() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminated() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let product_dir = match &args.product_dir {
        Some(dir) => dir.clone(),
        None => default_product_dir()?,
    };
    let layout = InstallLayout::new(product_dir, &args.version);
    if let Some(code) = killswitch_exit_code(&layout) {
        warn!("platform {} carries a killswitch, refusing to run", layout.version);
        std::process::exit(code);
    }

    let harness = match &args.harness {
        Some(path) => path.clone(),
        None => default_harness()?,
    };
    info!("starting daemon {} in {}", layout.version, layout.version_dir().display());

    let options = ManagerOptions::new(layout.services_dir(), harness)
        .with_log_level(&args.log_level)
        .with_interface_cache(layout.version_dir().join(PathsConfig::INTERFACE_CACHE_DIR_NAME));
    let manager = DynamicServiceManager::start(options).await;
    let daemon = Daemon::new(ServiceRegistry::new().with_dynamic(manager));

    let address = layout.daemon_address();
    let mut server =
        ChannelServer::start(&address).with_context(|| format!("cannot listen on {}", address))?;

    tokio::select! {
        _ = daemon.serve(&mut server) => warn!("listener stopped"),
        result = tokio::signal::ctrl_c() => {
            result.context("cannot listen for ctrl-c")?;
            info!("interrupted, shutting down");
        }
        _ = terminated() => info!("terminated, shutting down"),
    }
    server.stop().await;
    Ok(())
}
