//! Proxy configuration resources distributed by the control plane

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Category of configuration object. Each type is subscribed and acknowledged
/// independently by a proxy node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Cluster,
    Listener,
}

impl ResourceType {
    pub const ALL: [ResourceType; 2] = [ResourceType::Cluster, ResourceType::Listener];

    /// Fully qualified type name, as proxies know it
    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            ResourceType::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "CLUSTER",
            ResourceType::Listener => "LISTENER",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the proxy resolves a cluster's endpoints
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryMode {
    /// Endpoint address is a literal IP
    Static,
    /// Endpoint address is a hostname the proxy resolves itself
    Dns,
}

impl DiscoveryMode {
    pub fn for_address(address: &str) -> Self {
        if address.parse::<IpAddr>().is_ok() {
            DiscoveryMode::Static
        } else {
            DiscoveryMode::Dns
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
}

/// Only UDP is forwarded; the type exists so the wire format is explicit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportProtocol {
    #[default]
    Udp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: TransportProtocol,
}

/// Upstream group a listener forwards to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResource {
    /// Unique within a snapshot
    pub name: String,
    pub discovery_mode: DiscoveryMode,
    #[serde(default)]
    pub lb_policy: LbPolicy,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    pub endpoints: Vec<Endpoint>,
}

/// A UDP socket the proxy binds and routes to a single cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerResource {
    pub name: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub bind_port: u16,
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Must name a cluster present in the same snapshot
    pub target_cluster: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    pub stat_prefix: String,
}

/// A resource as carried on the wire, tagged by its type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resource {
    Cluster(ClusterResource),
    Listener(ListenerResource),
}

impl Resource {
    pub fn name(&self) -> &str {
        match self {
            Resource::Cluster(c) => &c.name,
            Resource::Listener(l) => &l.name,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Cluster(_) => ResourceType::Cluster,
            Resource::Listener(_) => ResourceType::Listener,
        }
    }
}

// Default values
fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    60
}
