//! Mapping from registry instances to a versioned proxy snapshot
//!
//! Every surviving instance yields exactly one cluster (single endpoint) and
//! one UDP listener bound to the instance's declared external port. Instances
//! are processed independently and in order; a malformed one is reported and
//! skipped without affecting its siblings.

use crate::SkipReason;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use xds_api::{
    ClusterResource, DiscoveryMode, Endpoint, LbPolicy, ListenerResource, ServiceInstance,
    Snapshot, TransportProtocol, Version,
};

/// Static knobs applied to every generated resource
#[derive(Clone, Debug)]
pub struct BuilderConfig {
    /// Address listeners bind on the proxy
    pub bind_address: String,
    /// Idle time after which the proxy drops a UDP session
    pub idle_timeout: Duration,
    /// Upstream connect timeout for clusters
    pub connect_timeout: Duration,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// An instance left out of the snapshot, and why
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedInstance {
    pub instance_id: String,
    pub reason: SkipReason,
}

#[derive(Debug)]
pub struct BuildOutput {
    pub snapshot: Snapshot,
    pub skipped: Vec<SkippedInstance>,
}

pub fn cluster_name(instance_id: &str, external_port: u16) -> String {
    format!("cluster_{}_{}", instance_id, external_port)
}

pub fn listener_name(external_port: u16) -> String {
    format!("listener_{}", external_port)
}

/// Builds snapshots with strictly increasing versions
pub struct SnapshotBuilder {
    config: BuilderConfig,
    sequence: AtomicU64,
}

impl SnapshotBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn next_version(&self) -> Version {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Version::new(sequence, Utc::now())
    }

    /// Build a snapshot from the current instance list.
    ///
    /// Two instances declaring the same external port map onto one listener:
    /// the one processed last wins the listener, while the earlier instance's
    /// cluster stays in the snapshot unreferenced.
    pub fn build(&self, instances: &[ServiceInstance]) -> BuildOutput {
        let mut clusters = Vec::with_capacity(instances.len());
        let mut listeners: Vec<ListenerResource> = Vec::with_capacity(instances.len());
        let mut listener_by_port: HashMap<u16, usize> = HashMap::new();
        let mut skipped = Vec::new();

        for instance in instances {
            let external_port = match validate_instance(instance) {
                Ok(port) => port,
                Err(reason) => {
                    skipped.push(SkippedInstance {
                        instance_id: instance.id.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let cluster = self.cluster_for(instance, external_port);
            let listener = self.listener_for(external_port, &cluster.name);

            match listener_by_port.get(&external_port) {
                Some(&index) => {
                    warn!(
                        port = external_port,
                        previous = %listeners[index].target_cluster,
                        winner = %cluster.name,
                        "External port declared twice, last instance wins the listener"
                    );
                    listeners[index] = listener;
                }
                None => {
                    listener_by_port.insert(external_port, listeners.len());
                    listeners.push(listener);
                }
            }

            debug!(
                "Mapped instance {}: external port {} -> {}:{}",
                instance.id, external_port, instance.address, instance.port
            );
            clusters.push(cluster);
        }

        BuildOutput {
            snapshot: Snapshot::new(self.next_version(), clusters, listeners),
            skipped,
        }
    }

    fn cluster_for(&self, instance: &ServiceInstance, external_port: u16) -> ClusterResource {
        ClusterResource {
            name: cluster_name(&instance.id, external_port),
            discovery_mode: DiscoveryMode::for_address(&instance.address),
            lb_policy: LbPolicy::RoundRobin,
            connect_timeout_ms: self.config.connect_timeout.as_millis() as u64,
            endpoints: vec![Endpoint {
                address: instance.address.clone(),
                port: instance.port,
                protocol: TransportProtocol::Udp,
            }],
        }
    }

    fn listener_for(&self, external_port: u16, cluster: &str) -> ListenerResource {
        ListenerResource {
            name: listener_name(external_port),
            bind_address: self.config.bind_address.clone(),
            bind_port: external_port,
            protocol: TransportProtocol::Udp,
            target_cluster: cluster.to_string(),
            idle_timeout_secs: self.config.idle_timeout.as_secs(),
            stat_prefix: format!("udp_stats_{}", external_port),
        }
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new(BuilderConfig::default())
    }
}

/// Check the metadata contract and return the declared external port
fn validate_instance(instance: &ServiceInstance) -> Result<u16, SkipReason> {
    let raw = instance
        .external_port()
        .ok_or(SkipReason::MissingExternalPort)?;

    let port = match raw.parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => return Err(SkipReason::InvalidPort(raw.to_string())),
    };

    match instance.protocol() {
        Some(protocol) if protocol.eq_ignore_ascii_case("udp") => Ok(port),
        other => Err(SkipReason::UnsupportedProtocol(other.map(str::to_string))),
    }
}
