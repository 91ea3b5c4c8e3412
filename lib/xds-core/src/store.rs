//! Per-node snapshot store

use crate::{CoreError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::debug;
use xds_api::Snapshot;

/// Receiver half handed to discovery sessions. It only ever yields the latest
/// snapshot for its node; intermediate versions are never queued.
pub type SnapshotWatch = watch::Receiver<Option<Arc<Snapshot>>>;

struct NodeSlot {
    tx: watch::Sender<Option<Arc<Snapshot>>>,
}

impl NodeSlot {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }
}

/// SnapshotStore holds the latest valid snapshot per node identity.
///
/// Each node key owns its own watch slot: replacing it is atomic for readers,
/// serialized against other writers of the same key, and independent of
/// every other key. The outer map lock is only held to look up or create a slot.
pub struct SnapshotStore {
    slots: RwLock<HashMap<String, Arc<NodeSlot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, node_id: &str) -> Arc<NodeSlot> {
        if let Some(slot) = self.slots.read().await.get(node_id) {
            return slot.clone();
        }

        let mut slots = self.slots.write().await;
        slots
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(NodeSlot::new()))
            .clone()
    }

    /// Replace the snapshot for one node.
    ///
    /// Rejects snapshots with dangling listener references and snapshots whose
    /// version does not increase; in both cases the previous snapshot stays.
    pub async fn replace(&self, node_id: &str, snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        let snapshot = Arc::new(snapshot);
        self.replace_shared(node_id, snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Fan identical content out to several node keys.
    ///
    /// Consistency is checked once up front so an invalid snapshot leaves every
    /// node untouched.
    pub async fn replace_all(&self, node_ids: &[String], snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        let snapshot = Arc::new(snapshot);
        if let (Some(node), Err(source)) = (node_ids.first(), snapshot.check_consistency()) {
            return Err(CoreError::InconsistentSnapshot {
                node: node.clone(),
                source,
            });
        }

        for node_id in node_ids {
            self.replace_shared(node_id, snapshot.clone()).await?;
        }
        Ok(snapshot)
    }

    async fn replace_shared(&self, node_id: &str, snapshot: Arc<Snapshot>) -> Result<()> {
        snapshot
            .check_consistency()
            .map_err(|source| CoreError::InconsistentSnapshot {
                node: node_id.to_string(),
                source,
            })?;

        let slot = self.slot(node_id).await;
        let mut stale_against = None;

        // The closure runs under the slot's write lock
        slot.tx.send_if_modified(|current| {
            if let Some(existing) = current {
                if snapshot.version() <= existing.version() {
                    stale_against = Some(existing.version().to_string());
                    return false;
                }
            }
            *current = Some(snapshot.clone());
            true
        });

        if let Some(current) = stale_against {
            return Err(CoreError::StaleVersion {
                node: node_id.to_string(),
                offered: snapshot.version().to_string(),
                current,
            });
        }

        debug!(
            "Stored snapshot {} for node {} ({} clusters, {} listeners)",
            snapshot.version(),
            node_id,
            snapshot.clusters().len(),
            snapshot.listeners().len()
        );
        Ok(())
    }

    /// Current snapshot for a node, if one was ever stored
    pub async fn snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        let slots = self.slots.read().await;
        slots.get(node_id).and_then(|slot| slot.tx.borrow().clone())
    }

    /// Watch a node key. Unknown keys are created empty so a proxy may
    /// subscribe before the first snapshot for it exists.
    pub async fn watch(&self, node_id: &str) -> SnapshotWatch {
        self.slot(node_id).await.tx.subscribe()
    }

    pub async fn node_ids(&self) -> Vec<String> {
        let slots = self.slots.read().await;
        let mut ids: Vec<String> = slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether any node has a snapshot yet
    pub async fn has_snapshot(&self) -> bool {
        let slots = self.slots.read().await;
        slots.values().any(|slot| slot.tx.borrow().is_some())
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnapshotBuilder;
    use chrono::Utc;
    use std::time::Duration;
    use xds_api::{ListenerResource, ServiceInstance, TransportProtocol, Version};

    fn instance(id: &str, external_port: &str) -> ServiceInstance {
        ServiceInstance::new(id, "10.0.0.5", 9000)
            .with_meta("external_port", external_port)
            .with_meta("protocol", "udp")
    }

    fn dangling_snapshot(sequence: u64) -> Snapshot {
        Snapshot::new(
            Version::new(sequence, Utc::now()),
            vec![],
            vec![ListenerResource {
                name: "listener_10000".to_string(),
                bind_address: "0.0.0.0".to_string(),
                bind_port: 10000,
                protocol: TransportProtocol::Udp,
                target_cluster: "cluster_gone_10000".to_string(),
                idle_timeout_secs: 60,
                stat_prefix: "udp_stats_10000".to_string(),
            }],
        )
    }

    #[tokio::test]
    async fn test_replace_and_read_back() {
        let store = SnapshotStore::new();
        let builder = SnapshotBuilder::default();
        assert!(store.snapshot("proxy-1").await.is_none());
        assert!(!store.has_snapshot().await);

        let stored = store
            .replace("proxy-1", builder.build(&[instance("gs-1", "10000")]).snapshot)
            .await
            .unwrap();

        let current = store.snapshot("proxy-1").await.unwrap();
        assert_eq!(current.version(), stored.version());
        assert!(store.has_snapshot().await);
        assert!(store.snapshot("proxy-2").await.is_none());
    }

    #[tokio::test]
    async fn test_inconsistent_snapshot_keeps_previous() {
        let store = SnapshotStore::new();
        let builder = SnapshotBuilder::default();
        let good = store
            .replace("proxy-1", builder.build(&[instance("gs-1", "10000")]).snapshot)
            .await
            .unwrap();

        let err = store.replace("proxy-1", dangling_snapshot(100)).await.unwrap_err();
        assert!(matches!(err, CoreError::InconsistentSnapshot { .. }));

        let current = store.snapshot("proxy-1").await.unwrap();
        assert_eq!(current.version(), good.version());
        assert_eq!(current.listeners().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = SnapshotStore::new();
        let builder = SnapshotBuilder::default();
        let older = builder.build(&[]).snapshot;
        let newer = builder.build(&[instance("gs-1", "10000")]).snapshot;

        store.replace("proxy-1", newer).await.unwrap();
        let err = store.replace("proxy-1", older).await.unwrap_err();
        assert!(matches!(err, CoreError::StaleVersion { .. }));
        assert_eq!(store.snapshot("proxy-1").await.unwrap().clusters().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_all_shares_content() {
        let store = SnapshotStore::new();
        let builder = SnapshotBuilder::default();
        let nodes = vec!["proxy-1".to_string(), "proxy-2".to_string()];

        store
            .replace_all(&nodes, builder.build(&[instance("gs-1", "10000")]).snapshot)
            .await
            .unwrap();

        let a = store.snapshot("proxy-1").await.unwrap();
        let b = store.snapshot("proxy-2").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.node_ids().await, nodes);
    }

    #[tokio::test]
    async fn test_replace_all_rejects_before_touching_any_node() {
        let store = SnapshotStore::new();
        let nodes = vec!["proxy-1".to_string(), "proxy-2".to_string()];

        let err = store.replace_all(&nodes, dangling_snapshot(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::InconsistentSnapshot { .. }));
        assert!(!store.has_snapshot().await);
    }

    #[tokio::test]
    async fn test_watch_sees_only_latest() {
        let store = SnapshotStore::new();
        let builder = SnapshotBuilder::default();
        let mut watch = store.watch("proxy-1").await;
        assert!(watch.borrow_and_update().is_none());

        store.replace("proxy-1", builder.build(&[]).snapshot).await.unwrap();
        let latest = store
            .replace("proxy-1", builder.build(&[instance("gs-1", "10000")]).snapshot)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), watch.changed())
            .await
            .expect("watch notified")
            .unwrap();
        let seen = watch.borrow_and_update().clone().unwrap();
        assert_eq!(seen.version(), latest.version());
        assert!(!watch.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_distinct_nodes() {
        let store = Arc::new(SnapshotStore::new());
        let builder = Arc::new(SnapshotBuilder::default());

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            let builder = builder.clone();
            handles.push(tokio::spawn(async move {
                let node = format!("proxy-{}", n);
                for _ in 0..10 {
                    let snapshot = builder.build(&[instance("gs-1", "10000")]).snapshot;
                    store.replace(&node, snapshot).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.node_ids().await.len(), 8);
    }
}
