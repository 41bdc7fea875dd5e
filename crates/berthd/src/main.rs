//! berthd - Berth network daemon.
//!
//! Restores persisted networks at startup, registers the bridge driver and
//! configured plugins, and tears host networking down on exit.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use berth_common::{BerthPaths, short_id};
use berth_network::{
    BridgeDriver, DriverRegistry, HttpTransport, NetworkManager, NetworkStore, RemoteDriver,
};
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::DaemonConfig;

const DEFAULT_FILTER: &str = "berthd=info,berth_network=info";
const DEBUG_FILTER: &str = "berthd=debug,berth_network=debug";

#[derive(Parser, Debug)]
#[command(name = "berthd", author, version, about, long_about = None)]
struct Args {
    /// Root directory for berth data
    #[arg(long, env = "BERTH_ROOT", default_value = "/var/lib/berth")]
    root: PathBuf,

    /// Daemon configuration file (TOML)
    #[arg(long, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if args.debug {
        EnvFilter::try_new(DEBUG_FILTER)
    } else {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
    }
    .into_diagnostic()?;

    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
    Ok(())
}

fn build_drivers(config: &DaemonConfig) -> Result<DriverRegistry> {
    let drivers = DriverRegistry::new();

    drivers.register(
        config.bridge.driver_name.clone(),
        Arc::new(BridgeDriver::with_system_defaults(&config.bridge.iptables)),
    );

    for plugin in &config.plugins {
        let transport = HttpTransport::new(plugin.url.clone())?;
        drivers.register(
            plugin.name.clone(),
            Arc::new(RemoteDriver::new(plugin.name.clone(), plugin.protocol, transport)),
        );
        tracing::info!(
            plugin = %plugin.name,
            url = %plugin.url,
            protocol = ?plugin.protocol,
            "Registered plugin driver"
        );
    }

    Ok(drivers)
}

async fn wait_for_shutdown() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).into_diagnostic()?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.into_diagnostic()?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::load(args.config.as_deref())?;
    init_tracing(&args)?;

    let paths = BerthPaths::with_root(&args.root);
    paths.create_dirs().into_diagnostic()?;

    let drivers = Arc::new(build_drivers(&config)?);
    let manager = NetworkManager::new(drivers, NetworkStore::open(paths.networks())?);

    let restored = manager.restore().await?;
    for network in manager.list().await {
        tracing::info!(
            network_id = short_id(&network.id),
            name = %network.name,
            driver = %network.driver,
            "Network ready"
        );
    }

    let pid_file = paths.daemon_pid();
    std::fs::write(&pid_file, std::process::id().to_string()).into_diagnostic()?;

    tracing::info!(
        root = %paths.root.display(),
        restored,
        drivers = ?manager.drivers().names(),
        "berthd started"
    );

    wait_for_shutdown().await?;

    tracing::info!("Shutting down");
    manager.shutdown().await;

    if let Err(e) = std::fs::remove_file(&pid_file) {
        tracing::warn!(path = %pid_file.display(), error = %e, "Failed to remove pid file");
    }
    Ok(())
}
