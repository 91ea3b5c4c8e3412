//! Registry clients for discovering healthy service instances

use crate::{CoreError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use xds_api::ServiceInstance;

/// Source of healthy instances for a named service.
///
/// Implementations return only instances passing the registry's own health
/// criterion. Failures are reported as [`CoreError::RegistryUnavailable`] and
/// are expected to be transient.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn healthy_instances(&self, service: &str) -> Result<Vec<ServiceInstance>>;
}

#[derive(Clone, Debug)]
struct RegisteredInstance {
    instance: ServiceInstance,
    healthy: bool,
}

/// StaticRegistry keeps instances in memory, in registration order
pub struct StaticRegistry {
    // Map of service name to its instances
    services: Arc<RwLock<HashMap<String, Vec<RegisteredInstance>>>>,
    available: AtomicBool,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            available: AtomicBool::new(true),
        }
    }

    /// Register or update an instance; updates keep the original position
    pub async fn register(&self, service: &str, instance: ServiceInstance) {
        let mut services = self.services.write().await;
        let instances = services.entry(service.to_string()).or_default();

        match instances.iter_mut().find(|r| r.instance.id == instance.id) {
            Some(existing) => {
                existing.instance = instance;
                existing.healthy = true;
            }
            None => {
                debug!("Registered instance {} of {}", instance.id, service);
                instances.push(RegisteredInstance {
                    instance,
                    healthy: true,
                });
            }
        }
    }

    pub async fn deregister(&self, service: &str, instance_id: &str) -> Result<()> {
        let mut services = self.services.write().await;
        let instances = services
            .get_mut(service)
            .ok_or_else(|| CoreError::InstanceNotFound(instance_id.to_string()))?;

        let before = instances.len();
        instances.retain(|r| r.instance.id != instance_id);
        if instances.len() == before {
            return Err(CoreError::InstanceNotFound(instance_id.to_string()));
        }

        debug!("Deregistered instance {} of {}", instance_id, service);
        Ok(())
    }

    /// Mark an instance as passing or failing its health check
    pub async fn set_health(&self, service: &str, instance_id: &str, healthy: bool) -> Result<()> {
        let mut services = self.services.write().await;
        let entry = services
            .get_mut(service)
            .and_then(|instances| instances.iter_mut().find(|r| r.instance.id == instance_id))
            .ok_or_else(|| CoreError::InstanceNotFound(instance_id.to_string()))?;
        entry.healthy = healthy;
        Ok(())
    }

    /// Simulate the registry going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn instance_count(&self, service: &str) -> usize {
        let services = self.services.read().await;
        services.get(service).map(Vec::len).unwrap_or(0)
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for StaticRegistry {
    async fn healthy_instances(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoreError::RegistryUnavailable(
                "static registry marked unavailable".to_string(),
            ));
        }

        let services = self.services.read().await;
        Ok(services
            .get(service)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|r| r.healthy)
                    .map(|r| r.instance.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_preserves_order_and_updates_in_place() {
        let registry = StaticRegistry::new();
        registry.register("game-server", ServiceInstance::new("a", "10.0.0.1", 1)).await;
        registry.register("game-server", ServiceInstance::new("b", "10.0.0.2", 2)).await;
        registry.register("game-server", ServiceInstance::new("a", "10.0.0.9", 9)).await;

        let instances = registry.healthy_instances("game-server").await.unwrap();
        let ids: Vec<_> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(instances[0].address, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_unhealthy_instances_are_filtered() {
        let registry = StaticRegistry::new();
        registry.register("game-server", ServiceInstance::new("a", "10.0.0.1", 1)).await;
        registry.register("game-server", ServiceInstance::new("b", "10.0.0.2", 2)).await;
        registry.set_health("game-server", "a", false).await.unwrap();

        let instances = registry.healthy_instances("game-server").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "b");
        assert_eq!(registry.instance_count("game-server").await, 2);
    }

    #[tokio::test]
    async fn test_deregister_unknown_instance() {
        let registry = StaticRegistry::new();
        registry.register("game-server", ServiceInstance::new("a", "10.0.0.1", 1)).await;

        assert!(registry.deregister("game-server", "a").await.is_ok());
        assert!(matches!(
            registry.deregister("game-server", "a").await,
            Err(CoreError::InstanceNotFound(_))
        ));
        assert!(registry.healthy_instances("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_registry() {
        let registry = StaticRegistry::new();
        registry.set_available(false);
        let err = registry.healthy_instances("game-server").await.unwrap_err();
        assert!(err.is_transient());
    }
}
