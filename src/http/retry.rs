//! Retry policy for unary GraphQL requests.

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use reqwest::header::{HeaderMap, RETRY_AFTER};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// When and how often a failed request is retried.
///
/// A response whose status is in `retryable_status_codes` is retried after
/// an exponentially growing delay; a `Retry-After` header from the server
/// takes precedence over the computed delay.
#[non_exhaustive]
#[derive(Builder, Debug, Clone)]
pub struct RetryPolicy {
    /// HTTP status codes worth retrying
    #[builder(default = vec![429, 502, 503, 504])]
    pub retryable_status_codes: Vec<u16>,
    /// Maximum number of retries after the initial attempt
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    /// Initial backoff duration for the first retry
    #[builder(default = DEFAULT_INITIAL_BACKOFF)]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[builder(default = DEFAULT_MAX_BACKOFF)]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }
}

impl From<&RetryPolicy> for ExponentialBackoff {
    fn from(policy: &RetryPolicy) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(policy.initial_backoff)
            .with_max_interval(policy.max_backoff)
            .with_multiplier(policy.backoff_multiplier)
            .with_max_elapsed_time(None) // max_retries bounds the attempts
            .build()
    }
}

/// The `Retry-After` delay the server asked for, when present in its
/// seconds form.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn backoff_sequence_starts_near_initial_interval() {
        let policy = RetryPolicy::default();
        let mut backoff: ExponentialBackoff = (&policy).into();

        // First backoff should be around initial_backoff (with some jitter)
        let first = backoff.next_backoff().expect("first delay");
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));
    }

    #[test]
    fn default_codes_cover_rate_limit_and_gateway_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(429));
        assert!(policy.is_retryable(503));
        assert!(!policy.is_retryable(400));
    }

    #[test]
    fn retry_after_seconds_form() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }
}
