//! One discovery stream, driven by socket readiness, store changes and resend timers

use crate::codec::{write_frame, FrameReader};
use crate::subscription::{AnswerOutcome, Subscription};
use crate::{Result, ServerConfig, ServerError};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use xds_api::{
    DiscoveryRequest, DiscoveryResponse, ResourceType, ServerMessage, Snapshot, SubscriptionFailure,
};
use xds_core::{ControlPlaneMetrics, ShutdownSignal, SnapshotStore, SnapshotWatch};

pub(crate) struct Session {
    peer: SocketAddr,
    store: Arc<SnapshotStore>,
    config: Arc<ServerConfig>,
    metrics: ControlPlaneMetrics,
    node_id: Option<String>,
    subscriptions: BTreeMap<ResourceType, Subscription>,
}

impl Session {
    pub(crate) fn new(
        peer: SocketAddr,
        store: Arc<SnapshotStore>,
        config: Arc<ServerConfig>,
        metrics: ControlPlaneMetrics,
    ) -> Self {
        Self {
            peer,
            store,
            config,
            metrics,
            node_id: None,
            subscriptions: BTreeMap::new(),
        }
    }

    /// Serve the stream until the peer leaves, an error isolates it, or
    /// shutdown is signalled. Subscription state dies with the session.
    pub(crate) async fn run(mut self, stream: TcpStream, shutdown: ShutdownSignal) {
        self.metrics.discovery_streams_active.inc();
        debug!("Discovery stream opened from {}", self.peer);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, self.config.max_frame_bytes);

        match self.serve(&mut reader, &mut write_half, shutdown).await {
            Ok(()) => {}
            Err(e) => {
                self.metrics
                    .discovery_stream_errors_total
                    .with_label_values(&[e.kind()])
                    .inc();
                warn!(
                    peer = %self.peer,
                    node = self.node_id.as_deref().unwrap_or("-"),
                    "Closing discovery stream: {}",
                    e
                );
            }
        }

        if let Err(e) = write_half.shutdown().await {
            debug!("Error closing discovery stream to {}: {}", self.peer, e);
        }
        self.metrics.discovery_streams_active.dec();
        info!(
            peer = %self.peer,
            node = self.node_id.as_deref().unwrap_or("-"),
            "Discovery stream closed"
        );
    }

    async fn serve(
        &mut self,
        reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        mut shutdown: ShutdownSignal,
    ) -> Result<()> {
        let mut watch: Option<SnapshotWatch> = None;

        loop {
            let retry_at = self.next_retry();

            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Shutdown, closing discovery stream to {}", self.peer);
                    return Ok(());
                }
                frame = reader.next_frame::<DiscoveryRequest>() => {
                    let Some(request) = frame? else {
                        debug!("Discovery stream closed by {}", self.peer);
                        return Ok(());
                    };
                    if let Some(failure) = self.on_request(request)? {
                        write_frame(writer, &failure, self.config.push_timeout).await?;
                    }
                    if watch.is_none() {
                        if let Some(node_id) = &self.node_id {
                            watch = Some(self.store.watch(node_id).await);
                        }
                    }
                }
                changed = snapshot_changed(&mut watch) => {
                    if !changed {
                        // The store is gone; nothing more will be published
                        watch = None;
                        continue;
                    }
                }
                _ = sleep_until(retry_at) => {}
            }

            let current = watch.as_mut().and_then(|w| w.borrow_and_update().clone());
            if let Some(snapshot) = current {
                self.push_due(&snapshot, writer).await?;
            }
        }
    }

    fn next_retry(&self) -> Option<Instant> {
        self.subscriptions.values().filter_map(Subscription::retry_at).min()
    }

    /// Apply one request. Returns a message to send when a subscription failed.
    fn on_request(&mut self, request: DiscoveryRequest) -> Result<Option<ServerMessage>> {
        if request.node_id.is_empty() {
            return Err(ServerError::ProtocolViolation("request without node id".to_string()));
        }
        match &self.node_id {
            Some(node_id) if *node_id != request.node_id => {
                return Err(ServerError::ProtocolViolation(format!(
                    "stream bound to node {} received request for node {}",
                    node_id, request.node_id
                )));
            }
            Some(_) => {}
            None => {
                info!(peer = %self.peer, node = %request.node_id, "Discovery stream subscribed");
                self.node_id = Some(request.node_id.clone());
            }
        }

        let resource_type = request.resource_type;

        // A request without a nonce (re)opens the subscription
        if request.response_nonce.is_none() {
            debug!(
                node = %request.node_id,
                "Subscribing to {} with last version {:?}",
                resource_type,
                request.version_info
            );
            self.subscriptions.insert(
                resource_type,
                Subscription::new(resource_type, request.version_info),
            );
            return Ok(None);
        }

        let Some(subscription) = self.subscriptions.get_mut(&resource_type) else {
            debug!("Answer for unsubscribed type {} ignored", resource_type);
            return Ok(None);
        };

        match subscription.on_answer(&request, &self.config.resend, Instant::now()) {
            AnswerOutcome::Acked { version } => {
                debug!(node = %request.node_id, "{} version {} acknowledged", resource_type, version);
                Ok(None)
            }
            AnswerOutcome::Rejected {
                version,
                attempt,
                detail,
            } => {
                self.metrics
                    .discovery_rejections_total
                    .with_label_values(&[resource_type.as_str()])
                    .inc();
                warn!(
                    node = %request.node_id,
                    attempt,
                    "{} version {} rejected: {}",
                    resource_type,
                    version,
                    detail
                );
                Ok(None)
            }
            AnswerOutcome::Failed { version, reason } => {
                self.metrics
                    .discovery_rejections_total
                    .with_label_values(&[resource_type.as_str()])
                    .inc();
                self.metrics
                    .discovery_subscription_failures_total
                    .with_label_values(&[resource_type.as_str()])
                    .inc();
                error!(node = %request.node_id, "{} subscription failed: {}", resource_type, reason);
                self.subscriptions.remove(&resource_type);
                Ok(Some(ServerMessage::SubscriptionFailed(SubscriptionFailure {
                    resource_type,
                    version,
                    reason,
                })))
            }
            AnswerOutcome::StaleNonce => {
                debug!("Answer with outdated nonce for {} ignored", resource_type);
                Ok(None)
            }
        }
    }

    /// Push `snapshot` to every subscription that wants it
    async fn push_due(&mut self, snapshot: &Snapshot, writer: &mut OwnedWriteHalf) -> Result<()> {
        let now = Instant::now();

        for (resource_type, subscription) in self.subscriptions.iter_mut() {
            if !subscription.wants(snapshot.version(), now) {
                continue;
            }

            let response = DiscoveryResponse {
                resource_type: *resource_type,
                version: snapshot.version().to_string(),
                nonce: Uuid::new_v4().to_string(),
                resources: snapshot.resources(*resource_type),
            };
            let nonce = response.nonce.clone();

            write_frame(writer, &ServerMessage::Response(response), self.config.push_timeout).await?;
            subscription.mark_sent(snapshot.version(), nonce);

            self.metrics
                .discovery_pushes_total
                .with_label_values(&[resource_type.as_str()])
                .inc();
            debug!(
                node = self.node_id.as_deref().unwrap_or("-"),
                "Pushed {} version {} ({} resources)",
                resource_type,
                snapshot.version(),
                snapshot.resource_count(*resource_type)
            );
        }

        Ok(())
    }
}

/// Resolves with `true` on a store update, `false` once the store is dropped.
/// Never resolves while no node is bound yet.
async fn snapshot_changed(watch: &mut Option<SnapshotWatch>) -> bool {
    match watch {
        Some(watch) => watch.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
