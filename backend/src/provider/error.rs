//! Provider failure taxonomy
//!
//! Every way a provider call can fail is a [`ProviderError`] variant, and
//! [`classify`] is the only place that decides what a failure means for
//! retrying. Call sites never inspect error strings.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`TextGenerator`](super::TextGenerator)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Credentials missing, invalid, or not permitted
    #[error("Provider rejected credentials: {0}")]
    Auth(String),

    /// The call did not finish within its deadline
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    /// The provider is throttling us
    #[error("Provider rate limit exceeded: {message}")]
    RateLimited {
        /// Provider supplied detail
        message: String,
        /// Provider supplied `Retry-After`, if any
        retry_after: Option<Duration>,
    },

    /// Provider-side outage or overload (5xx, connection refused)
    #[error("Provider unavailable: {0}")]
    ServiceUnavailable(String),

    /// The provider answered with something we cannot use
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// The call succeeded but produced only whitespace
    #[error("Provider returned an empty response")]
    EmptyResponse,

    /// Anything not covered above
    #[error("Provider error: {0}")]
    Other(String),
}

/// Closed set of failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials problem
    Auth,
    /// Deadline exceeded
    Timeout,
    /// Throttled
    RateLimited,
    /// Provider outage
    ServiceUnavailable,
    /// Unusable (including empty) answer
    InvalidResponse,
    /// Unclassified
    Unknown,
}

impl ErrorKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// What a failure means for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    /// Failure kind
    pub kind: ErrorKind,
    /// Whether one retry is worthwhile
    pub retryable: bool,
    /// How long to wait before that retry
    pub backoff_hint: Option<Duration>,
}

/// Base wait before retrying a timed-out call
pub const TIMEOUT_BACKOFF: Duration = Duration::from_millis(500);

/// Wait before retrying a rate-limited call when the provider gives no hint
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

/// Classify a provider failure
///
/// `auth` and `invalid_response` go straight to fallback; `timeout` and
/// `rate_limited` earn one retry; outages and unknown failures are not
/// retried inside a single request.
pub fn classify(error: &ProviderError) -> ErrorClassification {
    let (kind, retryable, backoff_hint) = match error {
        ProviderError::Auth(_) => (ErrorKind::Auth, false, None),
        ProviderError::Timeout(_) => (ErrorKind::Timeout, true, Some(TIMEOUT_BACKOFF)),
        ProviderError::RateLimited { retry_after, .. } => (
            ErrorKind::RateLimited,
            true,
            Some(retry_after.unwrap_or(RATE_LIMIT_BACKOFF)),
        ),
        ProviderError::ServiceUnavailable(_) => (ErrorKind::ServiceUnavailable, false, None),
        ProviderError::InvalidResponse(_) | ProviderError::EmptyResponse => {
            (ErrorKind::InvalidResponse, false, None)
        }
        ProviderError::Other(_) => (ErrorKind::Unknown, false, None),
    };

    ErrorClassification {
        kind,
        retryable,
        backoff_hint,
    }
}
