//! Data model and wire types for the UDP proxy control plane
//!
//! This library defines:
//! - ServiceInstance: a healthy backend as reported by the registry
//! - ClusterResource / ListenerResource: proxy configuration resources
//! - Snapshot: an immutable, versioned set of resources for one node
//! - DiscoveryRequest / ServerMessage: the subscriber-facing stream protocol

pub mod instance;
pub mod protocol;
pub mod resource;
pub mod snapshot;

pub use instance::ServiceInstance;
pub use protocol::{DiscoveryRequest, DiscoveryResponse, ServerMessage, SubscriptionFailure};
pub use resource::{
    ClusterResource, DiscoveryMode, Endpoint, LbPolicy, ListenerResource, Resource, ResourceType,
    TransportProtocol,
};
pub use snapshot::{DanglingListener, Snapshot, Version};
