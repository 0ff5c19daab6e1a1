//! Graph-driver daemon: bootstraps the device set, serves until signalled,
//! then runs the best-effort shutdown sweep.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use libblockgraph::{
    DRIVER_NAME, DeviceSet, DeviceSetConfig, GraphDriver, LinuxHost, RbdBackend,
};

#[derive(Parser, Debug)]
#[command(name = "blockgraphd", about = "Block-store graph driver daemon")]
struct Cli {
    /// Driver home directory holding per-layer mount points.
    #[arg(short = 'g', long, default_value = "/var/lib/docker")]
    graph: String,

    /// Storage option, `key=value`, repeatable.
    #[arg(long = "storage-opt", value_name = "KEY=VALUE")]
    storage_opts: Vec<String>,

    /// Log filter when RUST_LOG is unset.
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Shortcut for `--log-level debug`.
    #[arg(short = 'D', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { &cli.log_level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DeviceSetConfig::from_options(&cli.storage_opts)
        .context("invalid storage options")?;
    info!(
        pool = %config.data_pool,
        fs = %config.filesystem,
        "starting {DRIVER_NAME} driver"
    );

    let backend = Arc::new(RbdBackend::new(&config));
    let host = Arc::new(LinuxHost);
    let devices = DeviceSet::new(backend, host.clone(), config, true)
        .await
        .context("device set initialization failed")?;
    let home = format!("{}/{DRIVER_NAME}", cli.graph);
    let driver = GraphDriver::new(&home, devices, host)
        .await
        .context("graph driver initialization failed")?;

    for (key, value) in driver.status() {
        info!("{key}: {value}");
    }
    info!(home = %home, "driver ready");

    wait_for_shutdown_signal().await?;

    info!("shutting down");
    if let Err(e) = driver.cleanup().await {
        error!(error = %e, "cleanup failed");
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for ctrl-c")?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
    }
    Ok(())
}
