//! Consul health API client

use crate::registry::RegistryClient;
use crate::{CoreError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use xds_api::ServiceInstance;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(default)]
    node: Option<NodeInfo>,
    service: AgentService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
}

impl From<ServiceEntry> for ServiceInstance {
    fn from(entry: ServiceEntry) -> Self {
        let ServiceEntry { node, service } = entry;

        // Services registered without an address inherit the node's
        let address = if service.address.is_empty() {
            node.map(|n| n.address).unwrap_or_default()
        } else {
            service.address
        };

        ServiceInstance {
            id: service.id,
            address,
            port: service.port,
            metadata: service.meta.unwrap_or_default(),
        }
    }
}

/// Queries `/v1/health/service/<name>?passing=true` on a Consul agent
pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl ConsulRegistry {
    /// Create a client for the agent at `address` (`host:port` or a full URL).
    /// Every request is bounded by `timeout`.
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: normalize_base_url(address),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn health_url(&self, service: &str) -> String {
        format!("{}/v1/health/service/{}", self.base_url, service)
    }
}

#[async_trait]
impl RegistryClient for ConsulRegistry {
    async fn healthy_instances(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        let url = self.health_url(service);
        debug!("Querying registry: {}", url);

        let response = self
            .client
            .get(&url)
            .query(&[("passing", "true")])
            .send()
            .await
            .map_err(|e| CoreError::RegistryUnavailable(format!("query {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::RegistryUnavailable(format!(
                "query {} returned {}",
                url, status
            )));
        }

        let entries: Vec<ServiceEntry> = response.json().await.map_err(|e| {
            CoreError::RegistryUnavailable(format!("undecodable response from {}: {}", url, e))
        })?;

        Ok(entries.into_iter().map(ServiceInstance::from).collect())
    }
}

fn normalize_base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    const HEALTH_BODY: &str = r#"[
        {
            "Node": {"Node": "agent-1", "Address": "172.18.0.2"},
            "Service": {
                "ID": "gs-1", "Service": "game-server", "Address": "10.0.0.5", "Port": 9000,
                "Meta": {"external_port": "10000", "protocol": "udp"}
            },
            "Checks": []
        },
        {
            "Node": {"Node": "agent-2", "Address": "172.18.0.3"},
            "Service": {"ID": "gs-2", "Service": "game-server", "Address": "", "Port": 9001, "Meta": null},
            "Checks": []
        }
    ]"#;

    /// Serves `body` with `status` for the health endpoint of `game-server`, 404 otherwise
    async fn spawn_registry_stub(status: StatusCode, body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| async move {
                        let matches = req.uri().path() == "/v1/health/service/game-server"
                            && req.uri().query() == Some("passing=true");
                        let response = if matches {
                            Response::builder().status(status).body(Full::new(Bytes::from(body)))
                        } else {
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Full::new(Bytes::new()))
                        };
                        Ok::<_, Infallible>(response.unwrap())
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        addr
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("consul-server:8500"), "http://consul-server:8500");
        assert_eq!(normalize_base_url("http://consul:8500/"), "http://consul:8500");
        assert_eq!(normalize_base_url("https://consul"), "https://consul");
    }

    #[tokio::test]
    async fn test_healthy_instances_decodes_entries() {
        let addr = spawn_registry_stub(StatusCode::OK, HEALTH_BODY).await;
        let registry = ConsulRegistry::new(&addr.to_string(), Duration::from_secs(2)).unwrap();

        let instances = registry.healthy_instances("game-server").await.unwrap();
        assert_eq!(instances.len(), 2);

        assert_eq!(instances[0].id, "gs-1");
        assert_eq!(instances[0].address, "10.0.0.5");
        assert_eq!(instances[0].port, 9000);
        assert_eq!(instances[0].external_port(), Some("10000"));

        // Empty service address falls back to the node address
        assert_eq!(instances[1].address, "172.18.0.3");
        assert!(instances[1].metadata.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_unavailable() {
        let addr = spawn_registry_stub(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
        let registry = ConsulRegistry::new(&addr.to_string(), Duration::from_secs(2)).unwrap();

        let err = registry.healthy_instances("game-server").await.unwrap_err();
        assert!(matches!(err, CoreError::RegistryUnavailable(_)));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_unavailable() {
        let addr = spawn_registry_stub(StatusCode::OK, "not json").await;
        let registry = ConsulRegistry::new(&addr.to_string(), Duration::from_secs(2)).unwrap();

        let err = registry.healthy_instances("game-server").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_unavailable() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = ConsulRegistry::new(&addr.to_string(), Duration::from_secs(2)).unwrap();
        let err = registry.healthy_instances("game-server").await.unwrap_err();
        assert!(matches!(err, CoreError::RegistryUnavailable(_)));
    }
}
