use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xds_core::{
    ConsulRegistry, ControlPlaneMetrics, ReconciliationLoop, RegistryClient, Shutdown,
    SnapshotBuilder, SnapshotStore,
};
use xds_server::{DiscoveryServer, ProbeServer};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting xds-control-plane...");

    let config = Config::load().context("Failed to load configuration")?;
    info!(
        "Registry {} service {} for nodes {:?}",
        config.consul_addr, config.service_name, config.node_ids
    );

    let metrics = ControlPlaneMetrics::new().context("Failed to create metrics registry")?;
    let store = Arc::new(SnapshotStore::new());

    let registry: Arc<dyn RegistryClient> =
        Arc::new(ConsulRegistry::new(&config.consul_addr, config.registry_timeout())?);
    let reconciler = ReconciliationLoop::new(
        registry,
        SnapshotBuilder::new(config.builder()),
        store.clone(),
        config.reconcile(),
        metrics.clone(),
    );
    info!("Reconciliation loop initialized");

    let discovery = DiscoveryServer::new(store.clone(), config.server(), metrics.clone());
    let probe = ProbeServer::new(config.probe_addr(), store.clone(), metrics.clone());

    // Bind up front so a taken port fails startup instead of a background task
    let discovery_listener = discovery
        .bind()
        .await
        .context("Failed to bind discovery listener")?;
    let probe_listener = probe.bind().await.context("Failed to bind probe listener")?;

    let shutdown = Shutdown::new();
    let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    let signal_rx = shutdown.signal();
    tasks.push((
        "reconciler",
        tokio::spawn(async move {
            reconciler.run(signal_rx).await;
            Ok::<_, anyhow::Error>(())
        }),
    ));

    let signal_rx = shutdown.signal();
    tasks.push((
        "discovery-server",
        tokio::spawn(async move {
            discovery
                .serve(discovery_listener, signal_rx)
                .await
                .map_err(anyhow::Error::from)
        }),
    ));

    let signal_rx = shutdown.signal();
    tasks.push((
        "probe-server",
        tokio::spawn(async move {
            probe
                .serve(probe_listener, signal_rx)
                .await
                .map_err(anyhow::Error::from)
        }),
    ));

    wait_for_shutdown_signal().await?;
    shutdown.trigger();

    let grace = config.shutdown_grace();
    let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
    match tokio::time::timeout(grace, join_all(handles)).await {
        Ok(results) => {
            for (name, result) in names.into_iter().zip(results) {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Task {} failed: {:#}", name, e),
                    Err(e) => error!("Task {} panicked: {}", name, e),
                }
            }
        }
        Err(_) => warn!("Tasks still running after {:?}, exiting anyway", grace),
    }

    info!("xds-control-plane stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` filters, `LOG_FORMAT=json`
/// switches to structured output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
    }

    Ok(())
}
