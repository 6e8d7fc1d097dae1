// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use std::time::Duration;

use thiserror::Error;

/// Error types for CodeGraph core operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing or invalid environment)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Staging store error
    #[error("Staging store error: {0}")]
    Storage(String),

    /// Queue broker error
    #[error("Queue broker error: {0}")]
    Broker(String),

    /// External classifier error
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// Graph store error
    #[error("Graph store error: {0}")]
    Graph(String),

    /// Job payload failed schema validation at the queue boundary
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// POI reference could not be resolved to a database identifier
    #[error("Unresolved POI reference: {0}")]
    Resolution(String),

    /// Operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CodeGraph core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome classification for a job handler.
///
/// Workers never panic past their loop; every failure is either retriable
/// (routed back through the broker's backoff policy) or permanent (moved to
/// the queue's dead-letter queue with a diagnostic).
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the broker should retry with backoff.
    /// An explicit `delay` overrides the backoff schedule (used for
    /// rate-limit and circuit-open rejections, where the wait is known).
    #[error("retriable: {reason}")]
    Retriable {
        reason: String,
        delay: Option<Duration>,
    },

    /// Non-retriable failure; the job moves to the dead-letter queue.
    #[error("permanent: {reason}")]
    Permanent { reason: String },
}

impl JobError {
    /// Transient failure with the broker's default backoff.
    pub fn retriable(reason: impl Into<String>) -> Self {
        Self::Retriable {
            reason: reason.into(),
            delay: None,
        }
    }

    /// Transient failure with a known wait (rate-limit refill, breaker reset).
    pub fn retriable_after(reason: impl Into<String>, delay: Duration) -> Self {
        Self::Retriable {
            reason: reason.into(),
            delay: Some(delay),
        }
    }

    /// Non-retriable failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// True if the broker should re-deliver the job.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable { .. })
    }

    /// The failure reason, without the classification prefix.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Retriable { reason, .. } | Self::Permanent { reason } => reason,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::Config("REDIS_URL is required".to_string());
        assert_eq!(error.to_string(), "Configuration error: REDIS_URL is required");

        let error = Error::Resolution("createUser not found in run r-1".to_string());
        assert!(error.to_string().contains("Unresolved POI reference"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn test_io_error_from() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error = Error::from(io_error);
        assert!(matches!(error, Error::Io(_)));
    }

    #[test]
    fn test_json_error_from() {
        let json_error = serde_json::from_str::<i32>("not json").unwrap_err();
        let error = Error::from(json_error);
        assert!(matches!(error, Error::Json(_)));
    }

    #[test]
    fn test_job_error_classification() {
        let e = JobError::retriable("classifier timeout");
        assert!(e.is_retriable());
        assert_eq!(e.reason(), "classifier timeout");

        let e = JobError::permanent("malformed payload");
        assert!(!e.is_retriable());
        assert_eq!(e.reason(), "malformed payload");
    }

    #[test]
    fn test_job_error_retriable_after_carries_delay() {
        let e = JobError::retriable_after("rate limited", Duration::from_millis(250));
        match e {
            JobError::Retriable { delay, .. } => {
                assert_eq!(delay, Some(Duration::from_millis(250)));
            }
            JobError::Permanent { .. } => panic!("expected retriable"),
        }
    }

    #[test]
    fn test_error_propagation() {
        fn might_fail() -> Result<i32> {
            Err(Error::Broker("connection refused".to_string()))
        }

        fn calls_might_fail() -> Result<i32> {
            might_fail()?;
            Ok(42)
        }

        assert!(matches!(calls_might_fail().unwrap_err(), Error::Broker(_)));
    }
}
