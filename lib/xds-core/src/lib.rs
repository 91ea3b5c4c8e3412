//! Core reconciliation functionality
//!
//! This library provides:
//! - Registry clients for discovering healthy service instances
//! - The snapshot builder mapping instances to proxy resources
//! - The per-node snapshot store with integrity checks and change notification
//! - The fixed-interval reconciliation loop tying them together

pub mod builder;
pub mod consul;
pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod registry;
pub mod shutdown;
pub mod store;

pub use builder::{BuildOutput, BuilderConfig, SkippedInstance, SnapshotBuilder};
pub use consul::ConsulRegistry;
pub use error::{CoreError, Result, SkipReason};
pub use metrics::ControlPlaneMetrics;
pub use reconcile::{ReconcileConfig, ReconciliationLoop, TickReport};
pub use registry::{RegistryClient, StaticRegistry};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use store::{SnapshotStore, SnapshotWatch};
