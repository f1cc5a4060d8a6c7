//! pppxy
//!
//! TCP relay that prepends a PROXY protocol header to every forwarded
//! connection.
//!
//! This binary:
//! - Loads the relay list from a YAML config file
//! - Binds every configured listen address
//! - Relays each client to its backend behind a PROXY v1/v2 header
//! - Closes all listeners on SIGINT/SIGTERM

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use pppxy::{logging, Config, InstanceGroup};

/// TCP relay that prepends PROXY protocol headers.
#[derive(Parser, Debug)]
#[command(name = "pppxy", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "PPPXY_CONFIG", default_value = "/etc/pppxy/config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    #[arg(long, env = "PPPXY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

enum Stop {
    Signal(&'static str),
    Failed(pppxy::PppxyError),
    Drained,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    info!("Starting pppxy");

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    info!(
        config = %cli.config.display(),
        instance_count = config.pppxy_group.len(),
        "Configuration loaded"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    let mut group = InstanceGroup::new(config.pppxy_group);
    let bind_failures = group.start().await;
    if !bind_failures.is_empty() {
        group.shutdown().await;
        let addrs: Vec<_> = bind_failures.iter().map(|(addr, _)| addr.as_str()).collect();
        bail!("failed to start listeners: {}", addrs.join(", "));
    }

    let stop = tokio::select! {
        _ = sigterm.recv() => Stop::Signal("SIGTERM"),
        _ = sigint.recv() => Stop::Signal("SIGINT"),
        failure = group.next_failure() => match failure {
            Some(e) => Stop::Failed(e),
            None => Stop::Drained,
        },
    };

    match &stop {
        Stop::Signal(name) => info!(signal = %name, "Received shutdown signal"),
        Stop::Failed(e) => error!(error = %e, "Listener failed, shutting down"),
        Stop::Drained => error!("All listeners stopped unexpectedly"),
    }

    let close_failures = group.shutdown().await;
    info!(close_failures = close_failures.len(), "pppxy shutdown complete");

    match stop {
        Stop::Signal(_) => Ok(()),
        Stop::Failed(e) => Err(e.into()),
        Stop::Drained => bail!("all listeners stopped"),
    }
}
