//! extnetd entry point.
//!
//! Loads the configuration, builds the control plane over the in-memory
//! store and runs periodic usage collection until interrupted.

use anyhow::{bail, Context, Result};
use clap::Parser;
use extnet_common::{InProcessLocks, LockProvider};
use extnet_orch::config::{Config, LockBackendKind, DEFAULT_CONFIG_PATH};
use extnet_orch::sim::{SimulatedDriver, SimulatedHostRegistry};
use extnet_orch::store::{MemoryStore, Stores};
use extnet_orch::transport::DriverSet;
use extnet_orch::{ControlPlane, ExtnetDaemon};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// External network appliance control plane
#[derive(Parser, Debug)]
#[command(name = "extnetd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter (trace, debug, info, warn, error, or a full directive)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = Config::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;
    if args.check_config {
        info!(path = %args.config.display(), "Configuration is valid");
        return Ok(());
    }

    info!(
        path = %args.config.display(),
        usage_interval = ?config.usage_interval(),
        lock_backend = ?config.lock_backend.kind,
        "Starting extnetd"
    );

    match run(config).await {
        Ok(()) => {
            info!("extnetd exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "extnetd exiting with error");
            Err(e)
        }
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true);
    let installed = if args.json_logs {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    if let Err(e) = installed {
        bail!("failed to install logger: {}", e);
    }
    Ok(())
}

async fn lock_provider(config: &Config) -> Result<Arc<dyn LockProvider>> {
    match config.lock_backend.kind {
        LockBackendKind::InProcess => Ok(Arc::new(InProcessLocks::new())),
        #[cfg(feature = "redis")]
        LockBackendKind::Redis => {
            let provider = extnet_common::RedisLockProvider::connect(extnet_common::RedisLockConfig {
                url: config.lock_backend.redis_url.clone(),
                lease_ttl: config.lease_ttl(),
                ..Default::default()
            })
            .await
            .context("connecting lock backend")?;
            Ok(Arc::new(provider))
        }
        #[cfg(not(feature = "redis"))]
        LockBackendKind::Redis => {
            bail!("lock_backend.kind = \"redis\" requires building with the redis feature")
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let locks = lock_provider(&config).await?;
    let drivers = Arc::new(
        DriverSet::new(config.command_timeout()).with_driver(Arc::new(SimulatedDriver::new())),
    );
    let stores = Stores::memory(Arc::new(MemoryStore::new()));
    let control_plane = ControlPlane::new(
        &config,
        stores,
        drivers,
        Arc::new(SimulatedHostRegistry::new()),
        locks,
    );

    let mut daemon = ExtnetDaemon::new();
    daemon.register_task(control_plane.usage_collector());
    let handle = daemon.handle();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        handle.stop();
    });

    daemon.run().await;
    Ok(())
}
