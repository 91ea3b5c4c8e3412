use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use xds_core::{BuilderConfig, ReconcileConfig};
use xds_server::{ResendPolicy, ServerConfig};

/// Process configuration: YAML file first, environment on top
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub consul_addr: String,
    pub service_name: String,
    pub xds_port: u16,
    pub health_port: u16,
    pub node_ids: Vec<String>,
    pub reconcile_interval_secs: u64,
    pub registry_timeout_secs: u64,
    pub push_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub max_rejections: u32,
    pub listener_bind_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consul_addr: "http://consul-server:8500".to_string(),
            service_name: "game-server".to_string(),
            xds_port: 18000,
            health_port: 8080,
            node_ids: vec!["proxy-1".to_string()],
            reconcile_interval_secs: 10,
            registry_timeout_secs: 5,
            push_timeout_secs: 5,
            shutdown_grace_secs: 10,
            max_rejections: ResendPolicy::default().max_rejections,
            listener_bind_address: "0.0.0.0".to_string(),
        }
    }
}

impl Config {
    /// Load from `CONTROL_PLANE_CONFIG` (if set) and the process environment
    pub fn load() -> Result<Self> {
        let yaml = match std::env::var("CONTROL_PLANE_CONFIG") {
            Ok(path) => Some(read_file(Path::new(&path))?),
            Err(_) => None,
        };
        Self::from_sources(yaml.as_deref(), |key| std::env::var(key).ok())
    }

    pub fn from_sources<F>(yaml: Option<&str>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match yaml {
            Some(yaml) => serde_yaml::from_str(yaml).context("Invalid configuration file")?,
            None => Config::default(),
        };

        if let Some(addr) = env("CONSUL_ADDR") {
            config.consul_addr = addr;
        }
        if let Some(name) = env("SERVICE_NAME") {
            config.service_name = name;
        }
        override_parsed(&env, "XDS_PORT", &mut config.xds_port)?;
        override_parsed(&env, "HEALTH_PORT", &mut config.health_port)?;
        override_parsed(&env, "RECONCILE_INTERVAL_SECS", &mut config.reconcile_interval_secs)?;
        override_parsed(&env, "REGISTRY_TIMEOUT_SECS", &mut config.registry_timeout_secs)?;
        override_parsed(&env, "PUSH_TIMEOUT_SECS", &mut config.push_timeout_secs)?;
        override_parsed(&env, "SHUTDOWN_GRACE_SECS", &mut config.shutdown_grace_secs)?;
        override_parsed(&env, "MAX_REJECTIONS", &mut config.max_rejections)?;

        if let Some(ids) = env("NODE_IDS") {
            config.node_ids = split_list(&ids);
        }
        // Single-node override kept for existing deployments
        if let Some(id) = env("ENVOY_NODE_ID").filter(|id| !id.trim().is_empty()) {
            config.node_ids = vec![id.trim().to_string()];
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node_ids.is_empty() {
            bail!("At least one node id is required");
        }
        if self.service_name.is_empty() {
            bail!("Service name must not be empty");
        }
        if self.reconcile_interval_secs == 0 {
            bail!("Reconcile interval must be at least one second");
        }
        if self.max_rejections == 0 {
            bail!("max_rejections must be at least 1");
        }
        Ok(())
    }

    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            service_name: self.service_name.clone(),
            node_ids: self.node_ids.clone(),
            interval: Duration::from_secs(self.reconcile_interval_secs),
            query_timeout: Duration::from_secs(self.registry_timeout_secs),
        }
    }

    pub fn builder(&self) -> BuilderConfig {
        BuilderConfig {
            bind_address: self.listener_bind_address.clone(),
            ..BuilderConfig::default()
        }
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], self.xds_port)),
            push_timeout: Duration::from_secs(self.push_timeout_secs),
            resend: ResendPolicy {
                max_rejections: self.max_rejections,
                ..ResendPolicy::default()
            },
            drain_timeout: self.shutdown_grace(),
            ..ServerConfig::default()
        }
    }

    pub fn probe_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.health_port))
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))
}

fn override_parsed<F, T>(env: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value {:?} for {}: {}", raw, key, e))?;
    }
    Ok(())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
