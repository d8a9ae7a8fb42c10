//! cinder-server binary: CLI, logging, signals, and process lifecycle.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use cinder_core::Clock;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cinder_server::config::{normalize_addr, Config};
use cinder_server::metrics;
use cinder_server::server::Server;

/// How often the stats poller refreshes keyspace gauges.
const STATS_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    name = "cinder-server",
    version,
    about = "Redis-compatible in-memory key-value server"
)]
struct Cli {
    /// Path to the YAML configuration file. A missing file runs with
    /// all defaults.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the listen address from the configuration file.
    #[arg(long)]
    addr: Option<String>,

    /// Elevate the log level to debug.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            process::exit(1);
        }
    };
    if let Some(addr) = cli.addr {
        config.server.listen_addr = addr;
    }

    let level = if cli.debug {
        "debug".to_owned()
    } else {
        config.observability.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        addr = %config.server.listen_addr,
        "starting cinder server"
    );
    config.log_unsupported_options();

    let metrics_handle = if config.observability.prometheus_listen.is_empty() {
        None
    } else {
        match metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("metrics disabled: {e}");
                None
            }
        }
    };

    let server = match Server::bind(&config, Clock::system()).await {
        Ok(server) => server,
        Err(e) => {
            error!(
                addr = %config.server.listen_addr,
                "failed to start server: {e}"
            );
            process::exit(1);
        }
    };

    if let Some(handle) = metrics_handle {
        let addr = normalize_addr(&config.observability.prometheus_listen);
        match addr.parse() {
            Ok(addr) => {
                metrics::spawn_http_server(addr, handle);
                metrics::spawn_stats_poller(server.engine(), server.context(), STATS_POLL_INTERVAL);
            }
            Err(e) => warn!("invalid prometheus listen address '{addr}': {e}"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal, draining connections");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await;
    info!("server shutdown complete");
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
