//! Registry-side view of a running backend

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key declaring the public UDP port a proxy should bind for the instance
pub const EXTERNAL_PORT_KEY: &str = "external_port";

/// Older registrations used this key for the same purpose
pub const LEGACY_EXTERNAL_PORT_KEY: &str = "envoy_external_port";

/// Metadata key declaring the transport protocol
pub const PROTOCOL_KEY: &str = "protocol";

/// A healthy service instance as returned by the registry.
///
/// Instances are point-in-time facts: they are rebuilt from scratch on every
/// registry query and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry, builder style
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Raw external port declaration, preferring the current key over the legacy one
    pub fn external_port(&self) -> Option<&str> {
        self.metadata
            .get(EXTERNAL_PORT_KEY)
            .or_else(|| self.metadata.get(LEGACY_EXTERNAL_PORT_KEY))
            .map(String::as_str)
    }

    pub fn protocol(&self) -> Option<&str> {
        self.metadata.get(PROTOCOL_KEY).map(String::as_str)
    }
}
