//! Discovery stream messages
//!
//! Both directions are newline-delimited JSON objects on one TCP connection.
//! A subscriber opens a subscription by sending a request with no nonce,
//! acknowledges a response by echoing its nonce and version, and rejects it by
//! echoing the nonce together with an `error_detail`.

use crate::resource::{Resource, ResourceType};
use serde::{Deserialize, Serialize};

/// Subscriber to server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub node_id: String,
    pub resource_type: ResourceType,
    /// Last version the subscriber applied, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_info: Option<String>,
    /// Nonce of the response this request answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_nonce: Option<String>,
    /// Set when the subscriber rejects the response named by `response_nonce`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl DiscoveryRequest {
    pub fn subscribe(
        node_id: impl Into<String>,
        resource_type: ResourceType,
        last_version: Option<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            resource_type,
            version_info: last_version,
            response_nonce: None,
            error_detail: None,
        }
    }

    pub fn ack(node_id: impl Into<String>, response: &DiscoveryResponse) -> Self {
        Self {
            node_id: node_id.into(),
            resource_type: response.resource_type,
            version_info: Some(response.version.clone()),
            response_nonce: Some(response.nonce.clone()),
            error_detail: None,
        }
    }

    pub fn nack(
        node_id: impl Into<String>,
        response: &DiscoveryResponse,
        applied_version: Option<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            resource_type: response.resource_type,
            version_info: applied_version,
            response_nonce: Some(response.nonce.clone()),
            error_detail: Some(detail.into()),
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.error_detail.is_some()
    }
}

/// A version-tagged push of every resource of one type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub resource_type: ResourceType,
    pub version: String,
    pub nonce: String,
    pub resources: Vec<Resource>,
}

/// Sent once when a subscription is abandoned after repeated rejections
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFailure {
    pub resource_type: ResourceType,
    pub version: String,
    pub reason: String,
}

/// Server to subscriber
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(DiscoveryResponse),
    SubscriptionFailed(SubscriptionFailure),
}
