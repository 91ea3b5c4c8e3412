use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// A malformed or contradictory subscriber request; closes that stream only
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A response could not be written to one subscriber
    #[error("Push delivery failed: {0}")]
    PushDeliveryFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServerError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::ProtocolViolation(_) => "protocol_violation",
            ServerError::PushDeliveryFailure(_) => "push_delivery_failure",
            ServerError::Io(_) => "io",
            ServerError::Serialization(_) => "serialization",
        }
    }
}
