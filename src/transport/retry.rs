//! Fixed-interval retry policy for transient transport failures.
//!
//! A failed attempt is classified into a [`FailureType`]. Only
//! [`FailureType::Transient`] failures (timeouts, refused or dropped
//! connections, no response) are retried; everything else surfaces at once.
//! HTTP error statuses are replies, not failures of the transport, and are
//! never retried here.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use courier_core::transport::{RetryDecision, RetryPolicy, TransportError, classify_error};
//!
//! let policy = RetryPolicy::new(2, Duration::from_millis(250));
//! let error = TransportError::timeout("https://example.com/feed");
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => assert_eq!((delay, attempt), (Duration::from_millis(250), 2)),
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::TransportError;
use crate::request::Request;

/// Classification of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on another attempt: timeout, connection refused or reset, no response.
    Transient,

    /// Will not succeed on retry: malformed URL, TLS failure, local IO, checksum mismatch.
    Permanent,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry bound and fixed delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    retries: u32,

    /// Sleep between attempts.
    interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: super::DEFAULT_RETRY_COUNT,
            interval: Duration::from_millis(super::DEFAULT_RETRY_INTERVAL_MS),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `retries` retries, `interval` apart.
    #[must_use]
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }

    /// Takes the retry settings carried by a request.
    #[must_use]
    pub fn for_request(request: &Request) -> Self {
        Self::new(request.retries(), request.retry_interval())
    }

    /// Returns the configured retry count.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns the total number of attempts allowed.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Returns the delay between attempts.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Determines whether to retry after `attempt` (1-indexed) failed.
    #[instrument(level = "debug", skip(self), fields(retries = self.retries))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts() {
            debug!(attempt, max = self.max_attempts(), "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("retries ({}) exhausted", self.retries),
            };
        }

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = self.interval.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay: self.interval,
            attempt: attempt + 1,
        }
    }
}

/// Classifies a transport error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Timeout | Transient |
/// | Network (connect, reset, no response) | Transient |
/// | Network (TLS, request builder) | Permanent |
/// | HttpStatus | Permanent |
/// | InvalidUrl, TooManyRedirects | Permanent |
/// | Io, Integrity, Cancelled, ClientBuild | Permanent |
#[must_use]
pub fn classify_error(error: &TransportError) -> FailureType {
    match error {
        TransportError::Timeout { .. } => FailureType::Transient,
        TransportError::Network { source, .. } => {
            if source.is_builder() || is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        TransportError::HttpStatus { .. }
        | TransportError::Io { .. }
        | TransportError::InvalidUrl { .. }
        | TransportError::Integrity { .. }
        | TransportError::TooManyRedirects { .. }
        | TransportError::Cancelled { .. }
        | TransportError::ClientBuild { .. } => FailureType::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = format!("{error:?}").to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries(), 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_policy_for_request() {
        let request = Request::builder("https://example.com")
            .retries(2)
            .retry_interval(Duration::from_millis(40))
            .build()
            .unwrap();
        let policy = RetryPolicy::for_request(&request);
        assert_eq!(policy, RetryPolicy::new(2, Duration::from_millis(40)));
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let decision = policy.should_retry(FailureType::Permanent, 1);
        match decision {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("permanent")),
            RetryDecision::Retry { .. } => panic!("permanent failure must not retry"),
        }
    }

    #[test]
    fn test_should_retry_transient_uses_fixed_interval() {
        let policy = RetryPolicy::new(3, Duration::from_millis(75));
        for attempt in 1..=3 {
            assert_eq!(
                policy.should_retry(FailureType::Transient, attempt),
                RetryDecision::Retry {
                    delay: Duration::from_millis(75),
                    attempt: attempt + 1,
                }
            );
        }
    }

    #[test]
    fn test_should_retry_respects_retry_count() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        match policy.should_retry(FailureType::Transient, 3) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => panic!("should stop after 3 attempts"),
        }
    }

    #[test]
    fn test_classify_timeout_transient() {
        let error = TransportError::timeout("https://example.com");
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    #[test]
    fn test_classify_invalid_url_permanent() {
        let error = TransportError::invalid_url("nope");
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_http_status_permanent() {
        let error = TransportError::http_status("https://example.com", 503);
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_integrity_permanent() {
        let error = TransportError::integrity("/tmp/x", "a", "b");
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_io_error_permanent() {
        let error = TransportError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }
}
