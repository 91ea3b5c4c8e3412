//! HTTP liveness, readiness and metrics endpoints

use crate::Result;
use chrono::Utc;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use xds_core::{ControlPlaneMetrics, ShutdownSignal, SnapshotStore};

const COMPONENT: &str = "control-plane";

pub struct ProbeServer {
    listen_addr: SocketAddr,
    store: Arc<SnapshotStore>,
    metrics: ControlPlaneMetrics,
}

impl ProbeServer {
    pub fn new(listen_addr: SocketAddr, store: Arc<SnapshotStore>, metrics: ControlPlaneMetrics) -> Self {
        Self {
            listen_addr,
            store,
            metrics,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("Probe server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn serve(&self, listener: TcpListener, mut shutdown: ShutdownSignal) -> Result<()> {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Error accepting probe connection: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let store = self.store.clone();
            let metrics = self.metrics.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let store = store.clone();
                    let metrics = metrics.clone();
                    handle_request(req, store, metrics)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving probe connection from {}: {}", peer_addr, e);
                }
            });
        }

        info!("Probe server stopped");
        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    store: Arc<SnapshotStore>,
    metrics: ControlPlaneMetrics,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") | (&Method::GET, "/health") => {
            status_response(StatusCode::OK, "healthy")
        }
        (&Method::GET, "/readyz") | (&Method::GET, "/ready") => {
            if store.has_snapshot().await {
                status_response(StatusCode::OK, "ready")
            } else {
                status_response(StatusCode::SERVICE_UNAVAILABLE, "not_ready")
            }
        }
        (&Method::GET, "/metrics") => match metrics.gather() {
            Ok(body) => text_response(StatusCode::OK, body),
            Err(e) => {
                warn!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        _ => text_response(StatusCode::NOT_FOUND, "Not Found".to_string()),
    };

    Ok(response)
}

fn status_response(status: StatusCode, state: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "status": state,
        "component": COMPONENT,
        "timestamp": Utc::now().to_rfc3339(),
    });
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
    response
}
