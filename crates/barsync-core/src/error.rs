//! Error types for bar synchronization.
//!
//! [`DataError`] covers failures raised by the individual layers (calendar,
//! provider, rate limiter, store). [`SyncError`] is the top-level error returned
//! by the synchronization engine once layer-level retries are exhausted.

use std::time::Duration;

use thiserror::Error;

use crate::interval::Interval;
use crate::types::{BarKey, Instrument, Session};

/// Errors raised by calendars, providers, rate limiters and stores.
#[derive(Error, Debug, Clone)]
pub enum DataError {
    /// The venue has no loaded calendar, or the dates fall outside its coverage.
    #[error("Calendar unavailable: {0}")]
    CalendarUnavailable(String),

    /// Calendar metadata could not be loaded at construction time.
    #[error("Calendar load error: {0}")]
    CalendarLoad(String),

    /// The market-data provider rejected or failed the request.
    #[error("Provider {provider} error: {message}")]
    Provider {
        /// Name of the provider that failed.
        provider: String,
        /// Underlying cause.
        message: String,
        /// Whether retrying the same request may succeed.
        retryable: bool,
    },

    /// Transport-level failure (connection reset, DNS, TLS).
    #[error("Network error: {0}")]
    Network(String),

    /// The local rate limiter could not admit the request within its bounded wait.
    #[error("Rate limit exceeded: a slot would not open within {waited:?}")]
    RateLimitExceeded {
        /// How long the caller would have had to wait.
        waited: Duration,
    },

    /// A single attempt did not complete within its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Storage-layer I/O failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An insert-only write found different payloads already persisted.
    #[error("Conflicting payload for {} cached bar(s)", keys.len())]
    Conflict {
        /// Keys whose persisted payload differs from the incoming one.
        keys: Vec<BarKey>,
    },

    /// A bar violates the OHLCV invariants.
    #[error("Invalid bar: {0}")]
    InvalidBar(String),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Error parsing a provider payload or a stored value.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DataError {
    /// Returns true if the failed operation may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::Network(_)
            | Self::Timeout(_)
            | Self::Storage(_)
            | Self::RateLimitExceeded { .. } => true,
            Self::CalendarUnavailable(_)
            | Self::CalendarLoad(_)
            | Self::Conflict { .. }
            | Self::InvalidBar(_)
            | Self::InvalidParameter(_)
            | Self::Parse(_)
            | Self::Config(_) => false,
        }
    }

    /// Shorthand for a provider error that is worth retrying.
    #[must_use]
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a provider error that must not be retried.
    #[must_use]
    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Result type alias using [`DataError`].
pub type Result<T> = std::result::Result<T, DataError>;

/// Top-level failure of a series query.
///
/// A series with provider-side holes is not an error; it is returned as a
/// partial result instead.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The expected sessions could not be resolved.
    #[error("Calendar resolution failed: {0}")]
    Calendar(#[source] DataError),

    /// Every fetch for a required gap failed and nothing was cached to fall back on.
    #[error("Fetch failed for {instrument} {interval}: {} session(s) unavailable", missing.len())]
    Fetch {
        /// Requested instrument.
        instrument: Instrument,
        /// Requested interval.
        interval: Interval,
        /// Sessions that could not be obtained.
        missing: Vec<Session>,
        /// Last underlying cause.
        #[source]
        source: DataError,
    },

    /// The store kept failing after bounded retries.
    #[error("Storage failed: {0}")]
    Storage(#[source] DataError),

    /// The caller-level deadline elapsed; in-flight fetches continue in the background.
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(DataError::transient("p", "503").is_retryable());
        assert!(!DataError::permanent("p", "unknown ticker").is_retryable());
        assert!(DataError::Storage("disk I/O".into()).is_retryable());
        assert!(DataError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            DataError::RateLimitExceeded {
                waited: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(!DataError::CalendarUnavailable("XLON".into()).is_retryable());
    }

    #[test]
    fn test_conflict_message_counts_keys() {
        let err = DataError::Conflict { keys: Vec::new() };
        assert_eq!(err.to_string(), "Conflicting payload for 0 cached bar(s)");
    }
}
