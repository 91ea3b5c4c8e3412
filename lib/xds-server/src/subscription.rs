//! Per (node, resource type) subscription state
//!
//! A subscription moves `AwaitingInitial -> Pending(v) -> UpToDate(v) ->
//! Pending(v') -> ...`. A rejected push parks it in `BackingOff(v)` until the
//! resend delay elapses or a newer version supersedes `v`.

use crate::policy::ResendPolicy;
use tokio::time::Instant;
use xds_api::{DiscoveryRequest, ResourceType, Version};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribed, nothing acknowledged yet
    AwaitingInitial,
    /// A response is on the wire, waiting for its ack or rejection
    Pending { version: String },
    /// The subscriber applied `version`
    UpToDate { version: String },
    /// `version` was rejected and will be resent after a delay
    BackingOff { version: String },
}

/// What a subscriber's answer did to the subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnswerOutcome {
    Acked { version: String },
    Rejected { version: String, attempt: u32, detail: String },
    /// Rejected too many times; the subscription must be dropped
    Failed { version: String, reason: String },
    /// The answer names a nonce that is no longer in flight
    StaleNonce,
}

#[derive(Clone, Debug)]
struct InFlight {
    version: String,
    nonce: String,
}

#[derive(Clone, Debug)]
struct Rejection {
    version: String,
    count: u32,
    retry_at: Instant,
}

#[derive(Clone, Debug)]
pub struct Subscription {
    resource_type: ResourceType,
    acked_version: Option<String>,
    in_flight: Option<InFlight>,
    rejection: Option<Rejection>,
}

impl Subscription {
    /// Open a subscription, optionally with the version the subscriber
    /// already has from a previous stream
    pub fn new(resource_type: ResourceType, declared_version: Option<String>) -> Self {
        Self {
            resource_type,
            acked_version: declared_version.filter(|v| !v.is_empty()),
            in_flight: None,
            rejection: None,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn acked_version(&self) -> Option<&str> {
        self.acked_version.as_deref()
    }

    pub fn state(&self) -> SubscriptionState {
        if let Some(in_flight) = &self.in_flight {
            return SubscriptionState::Pending {
                version: in_flight.version.clone(),
            };
        }
        if let Some(rejection) = &self.rejection {
            return SubscriptionState::BackingOff {
                version: rejection.version.clone(),
            };
        }
        match &self.acked_version {
            Some(version) => SubscriptionState::UpToDate {
                version: version.clone(),
            },
            None => SubscriptionState::AwaitingInitial,
        }
    }

    /// Whether `current` should be pushed now
    pub fn wants(&self, current: &Version, now: Instant) -> bool {
        if current.matches(self.acked_version.as_deref()) {
            return false;
        }
        if let Some(in_flight) = &self.in_flight {
            if current.matches(Some(in_flight.version.as_str())) {
                return false;
            }
        }
        match &self.rejection {
            Some(rejection) if current.matches(Some(rejection.version.as_str())) => {
                now >= rejection.retry_at
            }
            _ => true,
        }
    }

    /// When a rejected version becomes due for resend
    pub fn retry_at(&self) -> Option<Instant> {
        match (&self.rejection, &self.in_flight) {
            (Some(rejection), None) => Some(rejection.retry_at),
            _ => None,
        }
    }

    pub fn mark_sent(&mut self, version: &Version, nonce: String) {
        self.in_flight = Some(InFlight {
            version: version.as_str().to_string(),
            nonce,
        });
    }

    /// Apply an ack or rejection from the subscriber
    pub fn on_answer(
        &mut self,
        request: &DiscoveryRequest,
        policy: &ResendPolicy,
        now: Instant,
    ) -> AnswerOutcome {
        let in_flight = match self.in_flight.take() {
            Some(f) if request.response_nonce.as_deref() == Some(f.nonce.as_str()) => f,
            other => {
                self.in_flight = other;
                return AnswerOutcome::StaleNonce;
            }
        };

        let Some(detail) = request.error_detail.clone() else {
            self.acked_version = Some(in_flight.version.clone());
            self.rejection = None;
            return AnswerOutcome::Acked {
                version: in_flight.version,
            };
        };

        let count = match &self.rejection {
            Some(previous) if previous.version == in_flight.version => previous.count + 1,
            _ => 1,
        };

        if count >= policy.max_rejections {
            self.rejection = None;
            return AnswerOutcome::Failed {
                reason: format!(
                    "version {} rejected {} times, last error: {}",
                    in_flight.version, count, detail
                ),
                version: in_flight.version,
            };
        }

        self.rejection = Some(Rejection {
            version: in_flight.version.clone(),
            count,
            retry_at: now + policy.jittered_backoff(count - 1),
        });
        AnswerOutcome::Rejected {
            version: in_flight.version,
            attempt: count,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use xds_api::DiscoveryResponse;

    fn response(version: &Version, nonce: &str) -> DiscoveryResponse {
        DiscoveryResponse {
            resource_type: ResourceType::Listener,
            version: version.to_string(),
            nonce: nonce.to_string(),
            resources: vec![],
        }
    }

    fn policy() -> ResendPolicy {
        ResendPolicy {
            max_rejections: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_initial_push_then_up_to_date() {
        let now = Instant::now();
        let v1 = Version::new(1, Utc::now());
        let mut sub = Subscription::new(ResourceType::Listener, None);
        assert_eq!(sub.state(), SubscriptionState::AwaitingInitial);
        assert!(sub.wants(&v1, now));

        sub.mark_sent(&v1, "n1".to_string());
        assert_eq!(sub.state(), SubscriptionState::Pending { version: v1.to_string() });
        assert!(!sub.wants(&v1, now));

        let outcome = sub.on_answer(&DiscoveryRequest::ack("p", &response(&v1, "n1")), &policy(), now);
        assert_eq!(outcome, AnswerOutcome::Acked { version: v1.to_string() });
        assert_eq!(sub.state(), SubscriptionState::UpToDate { version: v1.to_string() });
        assert!(!sub.wants(&v1, now));

        let v2 = Version::new(2, Utc::now());
        assert!(sub.wants(&v2, now));
    }

    #[test]
    fn test_declared_version_suppresses_push() {
        let now = Instant::now();
        let v1 = Version::new(1, Utc::now());
        let current = Subscription::new(ResourceType::Cluster, Some(v1.to_string()));
        assert!(!current.wants(&v1, now));

        let stale = Subscription::new(ResourceType::Cluster, Some("0-old".to_string()));
        assert!(stale.wants(&v1, now));

        let empty = Subscription::new(ResourceType::Cluster, Some(String::new()));
        assert_eq!(empty.state(), SubscriptionState::AwaitingInitial);
    }

    #[test]
    fn test_stale_nonce_is_ignored() {
        let now = Instant::now();
        let v1 = Version::new(1, Utc::now());
        let mut sub = Subscription::new(ResourceType::Listener, None);
        sub.mark_sent(&v1, "n1".to_string());

        let outcome = sub.on_answer(&DiscoveryRequest::ack("p", &response(&v1, "other")), &policy(), now);
        assert_eq!(outcome, AnswerOutcome::StaleNonce);
        assert_eq!(sub.state(), SubscriptionState::Pending { version: v1.to_string() });
    }

    #[test]
    fn test_rejection_backs_off_then_resends() {
        let now = Instant::now();
        let v1 = Version::new(1, Utc::now());
        let mut sub = Subscription::new(ResourceType::Listener, None);
        sub.mark_sent(&v1, "n1".to_string());

        let nack = DiscoveryRequest::nack("p", &response(&v1, "n1"), None, "bind failed");
        let outcome = sub.on_answer(&nack, &policy(), now);
        assert_eq!(
            outcome,
            AnswerOutcome::Rejected {
                version: v1.to_string(),
                attempt: 1,
                detail: "bind failed".to_string(),
            }
        );
        assert_eq!(sub.state(), SubscriptionState::BackingOff { version: v1.to_string() });

        let retry_at = sub.retry_at().unwrap();
        assert!(retry_at >= now + Duration::from_millis(100));
        assert!(!sub.wants(&v1, now));
        assert!(sub.wants(&v1, retry_at));

        // A newer version supersedes the backoff
        let v2 = Version::new(2, Utc::now());
        assert!(sub.wants(&v2, now));
    }

    #[test]
    fn test_repeated_rejection_fails_subscription() {
        let now = Instant::now();
        let v1 = Version::new(1, Utc::now());
        let mut sub = Subscription::new(ResourceType::Listener, None);

        let mut last = AnswerOutcome::StaleNonce;
        for attempt in 1..=3 {
            let nonce = format!("n{}", attempt);
            sub.mark_sent(&v1, nonce.clone());
            let nack = DiscoveryRequest::nack("p", &response(&v1, &nonce), None, "bad");
            last = sub.on_answer(&nack, &policy(), now);
        }

        match last {
            AnswerOutcome::Failed { version, reason } => {
                assert_eq!(version, v1.to_string());
                assert!(reason.contains("rejected 3 times"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_rejection_count_resets_for_new_version() {
        let now = Instant::now();
        let v1 = Version::new(1, Utc::now());
        let v2 = Version::new(2, Utc::now());
        let mut sub = Subscription::new(ResourceType::Listener, None);

        sub.mark_sent(&v1, "n1".to_string());
        sub.on_answer(&DiscoveryRequest::nack("p", &response(&v1, "n1"), None, "bad"), &policy(), now);
        sub.mark_sent(&v1, "n2".to_string());
        sub.on_answer(&DiscoveryRequest::nack("p", &response(&v1, "n2"), None, "bad"), &policy(), now);

        sub.mark_sent(&v2, "n3".to_string());
        let outcome =
            sub.on_answer(&DiscoveryRequest::nack("p", &response(&v2, "n3"), None, "bad"), &policy(), now);
        assert!(matches!(outcome, AnswerOutcome::Rejected { attempt: 1, .. }));
    }
}
