//! Prometheus metrics for the reconciliation loop and discovery server

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Shared metric handles. Clones refer to the same underlying registry.
#[derive(Clone)]
pub struct ControlPlaneMetrics {
    /// Reconciliation ticks by outcome
    pub reconcile_ticks_total: IntCounterVec,
    /// Instances left out of a snapshot, by reason
    pub skipped_instances_total: IntCounterVec,
    /// Resources in the most recently stored snapshot, by type
    pub snapshot_resources: IntGaugeVec,
    /// Open discovery streams
    pub discovery_streams_active: IntGauge,
    /// Responses written to subscribers, by type
    pub discovery_pushes_total: IntCounterVec,
    /// Responses rejected by subscribers, by type
    pub discovery_rejections_total: IntCounterVec,
    /// Subscriptions abandoned after repeated rejection, by type
    pub discovery_subscription_failures_total: IntCounterVec,
    /// Streams closed for protocol violations or failed deliveries
    pub discovery_stream_errors_total: IntCounterVec,
    pub snapshot_replacements_total: IntCounter,
    pub registry: Arc<Registry>,
}

impl ControlPlaneMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let reconcile_ticks_total = IntCounterVec::new(
            Opts::new("reconcile_ticks_total", "Reconciliation ticks by outcome"),
            &["outcome"],
        )?;
        let skipped_instances_total = IntCounterVec::new(
            Opts::new("skipped_instances_total", "Registry instances skipped by reason"),
            &["reason"],
        )?;
        let snapshot_resources = IntGaugeVec::new(
            Opts::new("snapshot_resources", "Resources in the latest stored snapshot"),
            &["type"],
        )?;
        let discovery_streams_active =
            IntGauge::new("discovery_streams_active", "Open discovery streams")?;
        let discovery_pushes_total = IntCounterVec::new(
            Opts::new("discovery_pushes_total", "Discovery responses sent"),
            &["type"],
        )?;
        let discovery_rejections_total = IntCounterVec::new(
            Opts::new("discovery_rejections_total", "Discovery responses rejected by subscribers"),
            &["type"],
        )?;
        let discovery_subscription_failures_total = IntCounterVec::new(
            Opts::new(
                "discovery_subscription_failures_total",
                "Subscriptions abandoned after repeated rejection",
            ),
            &["type"],
        )?;
        let discovery_stream_errors_total = IntCounterVec::new(
            Opts::new("discovery_stream_errors_total", "Discovery streams closed on error"),
            &["kind"],
        )?;
        let snapshot_replacements_total = IntCounter::new(
            "snapshot_replacements_total",
            "Snapshots accepted by the store",
        )?;

        registry.register(Box::new(reconcile_ticks_total.clone()))?;
        registry.register(Box::new(skipped_instances_total.clone()))?;
        registry.register(Box::new(snapshot_resources.clone()))?;
        registry.register(Box::new(discovery_streams_active.clone()))?;
        registry.register(Box::new(discovery_pushes_total.clone()))?;
        registry.register(Box::new(discovery_rejections_total.clone()))?;
        registry.register(Box::new(discovery_subscription_failures_total.clone()))?;
        registry.register(Box::new(discovery_stream_errors_total.clone()))?;
        registry.register(Box::new(snapshot_replacements_total.clone()))?;

        Ok(Self {
            reconcile_ticks_total,
            skipped_instances_total,
            snapshot_resources,
            discovery_streams_active,
            discovery_pushes_total,
            discovery_rejections_total,
            discovery_subscription_failures_total,
            discovery_stream_errors_total,
            snapshot_replacements_total,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not valid UTF-8: {}", e)))
    }
}
