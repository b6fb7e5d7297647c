//! JSON exporter daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use json_exporter::config::ExporterConfig;
use json_exporter::fleet::Fleet;
use json_exporter::http::HttpServer;
use json_exporter::registry::Registry;
use json_exporter_common::{ConfigWatcher, LogFormat, init_tracing};

/// Export values extracted from polled JSON endpoints as Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "json-exporter")]
#[command(about = "Export JSON endpoint values as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Address to serve the metrics endpoint on.
    #[arg(short, long, default_value = "0.0.0.0:9421")]
    listen: SocketAddr,

    /// Path of the metrics endpoint.
    #[arg(long, default_value = "/metrics")]
    metrics_path: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format (text, json).
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    anyhow::ensure!(
        args.metrics_path.starts_with('/'),
        "metrics path must start with /"
    );

    init_tracing(&args.log_level, args.log_format)?;

    info!(
        config = %args.config.display(),
        listen = %args.listen,
        "starting json-exporter"
    );

    let registry = Arc::new(Registry::new());

    // A broken configuration is fatal here and fail-open on every reload
    // after this point.
    let watcher = ConfigWatcher::<ExporterConfig>::new(&args.config);
    watcher
        .load()
        .with_context(|| format!("error reading config at {:?}", args.config))?;
    if let Some(config) = watcher.current() {
        config.validate().context("invalid configuration")?;
    }

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("json-exporter/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("error building HTTP client")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Fleet task: follows configuration snapshots, owns all targets.
    let fleet = Fleet::new(Arc::clone(&registry), http_client);
    let fleet_configs = watcher.subscribe();
    let fleet_shutdown = shutdown_rx.clone();
    let fleet_task = tokio::spawn(async move {
        fleet.run(fleet_configs, fleet_shutdown).await;
    });

    // HTTP server task.
    let http_server = HttpServer::new(
        Arc::clone(&registry),
        watcher.subscribe(),
        args.listen,
        args.metrics_path.clone(),
    );
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).unwrap();
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    let _ = shutdown_tx.send(true);
    watcher.close();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = fleet_task.await;
        let _ = http_task.await;
    })
    .await;

    info!(series = registry.series_count(), "exporter stopped");
    Ok(())
}
