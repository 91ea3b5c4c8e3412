//! Discovery protocol server and operational endpoints
pub mod client;
pub mod codec;
pub mod error;
pub mod policy;
pub mod probe;
pub mod server;
mod session;
pub mod subscription;

pub use client::DiscoveryClient;
pub use error::{Result, ServerError};
pub use policy::ResendPolicy;
pub use probe::ProbeServer;
pub use server::{DiscoveryServer, ServerConfig};
pub use subscription::{AnswerOutcome, Subscription, SubscriptionState};
