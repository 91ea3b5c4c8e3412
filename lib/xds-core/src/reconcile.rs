//! Fixed-interval reconciliation from registry to snapshot store

use crate::{
    BuildOutput, ControlPlaneMetrics, CoreError, RegistryClient, Result, ShutdownSignal,
    SnapshotBuilder, SnapshotStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use xds_api::{ResourceType, Version};

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// Registry service whose instances are mapped to proxy config
    pub service_name: String,
    /// Node keys that all receive the same snapshot
    pub node_ids: Vec<String>,
    pub interval: Duration,
    /// Upper bound for one registry query
    pub query_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            service_name: "game-server".to_string(),
            node_ids: vec!["proxy-1".to_string()],
            interval: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// Summary of one successful tick
#[derive(Clone, Debug)]
pub struct TickReport {
    pub version: Version,
    pub instances: usize,
    pub clusters: usize,
    pub listeners: usize,
    pub skipped: usize,
    /// Digest of the resource content, equal across ticks with equal input
    pub digest: String,
}

pub struct ReconciliationLoop {
    registry: Arc<dyn RegistryClient>,
    builder: SnapshotBuilder,
    store: Arc<SnapshotStore>,
    config: ReconcileConfig,
    metrics: ControlPlaneMetrics,
}

impl ReconciliationLoop {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        builder: SnapshotBuilder,
        store: Arc<SnapshotStore>,
        config: ReconcileConfig,
        metrics: ControlPlaneMetrics,
    ) -> Self {
        Self {
            registry,
            builder,
            store,
            config,
            metrics,
        }
    }

    /// Query, build and store once. Any error abandons the tick and leaves the
    /// stored snapshots untouched.
    pub async fn tick(&self) -> Result<TickReport> {
        let query = self.registry.healthy_instances(&self.config.service_name);
        let instances = match time::timeout(self.config.query_timeout, query).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CoreError::RegistryUnavailable(format!(
                    "query for {} timed out after {:?}",
                    self.config.service_name, self.config.query_timeout
                )))
            }
        };
        debug!(
            "Registry returned {} healthy instances of {}",
            instances.len(),
            self.config.service_name
        );

        let BuildOutput { snapshot, skipped } = self.builder.build(&instances);
        for skip in &skipped {
            warn!(instance = %skip.instance_id, reason = %skip.reason, "Skipping instance");
            self.metrics
                .skipped_instances_total
                .with_label_values(&[skip.reason.label()])
                .inc();
        }

        let snapshot = self.store.replace_all(&self.config.node_ids, snapshot).await?;
        self.metrics.snapshot_replacements_total.inc();
        for resource_type in ResourceType::ALL {
            self.metrics
                .snapshot_resources
                .with_label_values(&[resource_type.as_str()])
                .set(snapshot.resource_count(resource_type) as i64);
        }

        Ok(TickReport {
            version: snapshot.version().clone(),
            instances: instances.len(),
            clusters: snapshot.clusters().len(),
            listeners: snapshot.listeners().len(),
            skipped: skipped.len(),
            digest: snapshot.content_digest(),
        })
    }

    /// Run ticks until shutdown. The first tick fires immediately; a tick that
    /// is still running when shutdown arrives is abandoned.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(
            "Reconciling {} every {:?} for nodes {:?}",
            self.config.service_name, self.config.interval, self.config.node_ids
        );

        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown during reconciliation tick, abandoning it");
                    break;
                }
                result = self.tick() => self.record(result),
            }
        }

        info!("Reconciliation loop stopped");
    }

    fn record(&self, result: Result<TickReport>) {
        match result {
            Ok(report) => {
                self.metrics
                    .reconcile_ticks_total
                    .with_label_values(&["applied"])
                    .inc();
                info!(
                    version = %report.version,
                    instances = report.instances,
                    clusters = report.clusters,
                    listeners = report.listeners,
                    skipped = report.skipped,
                    digest = %report.digest,
                    "Proxy configuration updated"
                );
            }
            Err(e) => {
                self.metrics
                    .reconcile_ticks_total
                    .with_label_values(&[e.kind()])
                    .inc();
                if e.is_transient() {
                    warn!("Reconciliation tick abandoned, retrying next interval: {}", e);
                } else {
                    error!("Reconciliation tick rejected, keeping previous snapshot: {}", e);
                }
            }
        }
    }
}
