//! TCP accept loop for discovery streams

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::policy::ResendPolicy;
use crate::session::Session;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};
use xds_core::{ControlPlaneMetrics, ShutdownSignal, SnapshotStore};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Upper bound for writing one message to a subscriber
    pub push_timeout: Duration,
    pub resend: ResendPolicy,
    pub max_frame_bytes: usize,
    /// How long open streams get to close after shutdown
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 18000).into(),
            push_timeout: Duration::from_secs(5),
            resend: ResendPolicy::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Serves every node's snapshot to subscribers over long-lived streams
pub struct DiscoveryServer {
    store: Arc<SnapshotStore>,
    config: Arc<ServerConfig>,
    metrics: ControlPlaneMetrics,
}

impl DiscoveryServer {
    pub fn new(store: Arc<SnapshotStore>, config: ServerConfig, metrics: ControlPlaneMetrics) -> Self {
        Self {
            store,
            config: Arc::new(config),
            metrics,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Discovery server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept streams until shutdown, then give open streams
    /// `drain_timeout` to close before aborting them.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                        }
                        let session = Session::new(
                            peer_addr,
                            self.store.clone(),
                            self.config.clone(),
                            self.metrics.clone(),
                        );
                        sessions.spawn(session.run(stream, shutdown.clone()));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        warn!("Error accepting discovery connection: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Discovery session task failed: {}", e);
                    }
                }
            }
        }

        info!("Discovery server shutting down, draining {} streams", sessions.len());
        let drain = async { while sessions.join_next().await.is_some() {} };
        if time::timeout(self.config.drain_timeout, drain).await.is_err() {
            warn!(
                "{} discovery streams still open after {:?}, aborting",
                sessions.len(),
                self.config.drain_timeout
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        info!("Discovery server stopped");
        Ok(())
    }
}
