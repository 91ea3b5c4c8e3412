//! Immutable, versioned resource sets

use crate::resource::{ClusterResource, ListenerResource, Resource, ResourceType};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Version token of a snapshot.
///
/// Ordering follows the sequence number, which a builder increments on every
/// build. The token string is what travels on the wire.
#[derive(Clone, Debug)]
pub struct Version {
    sequence: u64,
    issued_at: DateTime<Utc>,
    token: String,
}

impl Version {
    pub fn new(sequence: u64, issued_at: DateTime<Utc>) -> Self {
        let token = format!("{}-{}", sequence, issued_at.format("%Y%m%dT%H%M%S%.3fZ"));
        Self {
            sequence,
            issued_at,
            token,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Whether a subscriber-declared token names this exact version
    pub fn matches(&self, token: Option<&str>) -> bool {
        token == Some(self.token.as_str())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence && self.issued_at == other.issued_at
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.issued_at.cmp(&other.issued_at))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// A listener that routes to a cluster missing from its snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("listener {listener} targets unknown cluster {cluster}")]
pub struct DanglingListener {
    pub listener: String,
    pub cluster: String,
}

/// Configuration valid at one point in time.
///
/// Snapshots are never mutated after construction; stores replace them whole.
#[derive(Clone, Debug)]
pub struct Snapshot {
    version: Version,
    clusters: Vec<ClusterResource>,
    listeners: Vec<ListenerResource>,
}

impl Snapshot {
    pub fn new(
        version: Version,
        clusters: Vec<ClusterResource>,
        listeners: Vec<ListenerResource>,
    ) -> Self {
        Self {
            version,
            clusters,
            listeners,
        }
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn clusters(&self) -> &[ClusterResource] {
        &self.clusters
    }

    pub fn listeners(&self) -> &[ListenerResource] {
        &self.listeners
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.listeners.is_empty()
    }

    /// Resources of one type, in snapshot order, ready to be put on the wire
    pub fn resources(&self, resource_type: ResourceType) -> Vec<Resource> {
        match resource_type {
            ResourceType::Cluster => self.clusters.iter().cloned().map(Resource::Cluster).collect(),
            ResourceType::Listener => self
                .listeners
                .iter()
                .cloned()
                .map(Resource::Listener)
                .collect(),
        }
    }

    pub fn resource_count(&self, resource_type: ResourceType) -> usize {
        match resource_type {
            ResourceType::Cluster => self.clusters.len(),
            ResourceType::Listener => self.listeners.len(),
        }
    }

    /// Check that every listener routes to a cluster of this snapshot
    pub fn check_consistency(&self) -> Result<(), DanglingListener> {
        let names: HashSet<&str> = self.clusters.iter().map(|c| c.name.as_str()).collect();

        match self
            .listeners
            .iter()
            .find(|l| !names.contains(l.target_cluster.as_str()))
        {
            Some(listener) => Err(DanglingListener {
                listener: listener.name.clone(),
                cluster: listener.target_cluster.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Hex SHA-256 over the resource content, independent of the version token
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for cluster in &self.clusters {
            hasher.update(format!("{:?}\n", cluster).as_bytes());
        }
        for listener in &self.listeners {
            hasher.update(format!("{:?}\n", listener).as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{DiscoveryMode, Endpoint, LbPolicy, TransportProtocol};

    fn cluster(name: &str) -> ClusterResource {
        ClusterResource {
            name: name.to_string(),
            discovery_mode: DiscoveryMode::Static,
            lb_policy: LbPolicy::RoundRobin,
            connect_timeout_ms: 5_000,
            endpoints: vec![Endpoint {
                address: "10.0.0.5".to_string(),
                port: 9000,
                protocol: TransportProtocol::Udp,
            }],
        }
    }

    fn listener(port: u16, target: &str) -> ListenerResource {
        ListenerResource {
            name: format!("listener_{}", port),
            bind_address: "0.0.0.0".to_string(),
            bind_port: port,
            protocol: TransportProtocol::Udp,
            target_cluster: target.to_string(),
            idle_timeout_secs: 60,
            stat_prefix: format!("udp_stats_{}", port),
        }
    }

    #[test]
    fn test_version_token_and_order() {
        let now = Utc::now();
        let v1 = Version::new(1, now);
        let v2 = Version::new(2, now);
        assert!(v2 > v1);
        assert!(v1.as_str().starts_with("1-"));
        assert!(v1.matches(Some(v1.as_str())));
        assert!(!v1.matches(Some(v2.as_str())));
        assert!(!v1.matches(None));
    }

    #[test]
    fn test_consistency_detects_dangling_listener() {
        let snapshot = Snapshot::new(
            Version::new(1, Utc::now()),
            vec![cluster("cluster_a_10000")],
            vec![listener(10000, "cluster_a_10000"), listener(10001, "cluster_missing")],
        );

        let err = snapshot.check_consistency().unwrap_err();
        assert_eq!(err.listener, "listener_10001");
        assert_eq!(err.cluster, "cluster_missing");
    }

    #[test]
    fn test_empty_snapshot_is_consistent() {
        let snapshot = Snapshot::new(Version::new(1, Utc::now()), vec![], vec![]);
        assert!(snapshot.check_consistency().is_ok());
        assert!(snapshot.is_empty());
        assert!(snapshot.resources(ResourceType::Listener).is_empty());
    }

    #[test]
    fn test_content_digest_ignores_version() {
        let a = Snapshot::new(
            Version::new(1, Utc::now()),
            vec![cluster("c")],
            vec![listener(10000, "c")],
        );
        let b = Snapshot::new(
            Version::new(2, Utc::now()),
            vec![cluster("c")],
            vec![listener(10000, "c")],
        );
        let c = Snapshot::new(Version::new(3, Utc::now()), vec![cluster("c")], vec![]);

        assert_eq!(a.content_digest(), b.content_digest());
        assert_ne!(a.content_digest(), c.content_digest());
    }
}
