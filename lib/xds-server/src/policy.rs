//! Resend policy for rejected discovery responses

use rand::Rng;
use std::time::Duration;

/// How the server reacts when a subscriber rejects a response
#[derive(Clone, Debug)]
pub struct ResendPolicy {
    /// Consecutive rejections of one version before the subscription is abandoned
    pub max_rejections: u32,
    /// Delay before the first resend
    pub initial_backoff: Duration,
    /// Upper bound for any resend delay
    pub max_backoff: Duration,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self {
            max_rejections: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ResendPolicy {
    /// Calculate backoff duration for the given retry count
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = 2u64.saturating_pow(retry_count);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(backoff_ms)
    }

    /// Backoff plus up to 10% random jitter, still capped at `max_backoff`
    pub fn jittered_backoff(&self, retry_count: u32) -> Duration {
        let backoff = self.backoff_duration(retry_count);
        let jitter_ms = backoff.as_millis() as u64 / 10;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (backoff + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}
