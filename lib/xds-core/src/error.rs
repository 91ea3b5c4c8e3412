use thiserror::Error;
use xds_api::DanglingListener;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Inconsistent snapshot for node {node}: {source}")]
    InconsistentSnapshot {
        node: String,
        #[source]
        source: DanglingListener,
    },

    #[error("Stale snapshot version {offered} for node {node} (current {current})")]
    StaleVersion {
        node: String,
        offered: String,
        current: String,
    },

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::RegistryUnavailable(_) => "registry_unavailable",
            CoreError::InconsistentSnapshot { .. } => "inconsistent_snapshot",
            CoreError::StaleVersion { .. } => "stale_version",
            CoreError::InstanceNotFound(_) => "instance_not_found",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Transient errors are retried on the next tick without operator attention
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::RegistryUnavailable(_))
    }
}

/// Why an instance was left out of a snapshot. Only the instance is affected;
/// the rest of the batch is still built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    #[error("no external port declared in metadata")]
    MissingExternalPort,

    #[error("invalid external port {0:?}")]
    InvalidPort(String),

    #[error("unsupported protocol {0:?}, only udp is forwarded")]
    UnsupportedProtocol(Option<String>),
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::MissingExternalPort => "missing_external_port",
            SkipReason::InvalidPort(_) => "invalid_port",
            SkipReason::UnsupportedProtocol(_) => "unsupported_protocol",
        }
    }
}
