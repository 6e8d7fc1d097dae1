// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Retry backoff schedule for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// `base * 2^attempt`, capped, with 0-25% jitter.
    Exponential { delay_ms: u64 },
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential { delay_ms: 1_000 }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), jittered to avoid
    /// thundering herds.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = match self {
            Self::Exponential { delay_ms } => {
                let exp = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                delay_ms.saturating_mul(exp)
            }
            Self::Fixed { delay_ms } => *delay_ms,
        };
        let capped = std::cmp::min(base_ms, MAX_BACKOFF.as_millis() as u64);
        let jitter = (capped as f64 * 0.25 * rand::random::<f64>()) as u64;
        Duration::from_millis(capped + jitter)
    }
}

/// Per-job options, set at enqueue time and preserved by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total delivery attempts before the job is dead-lettered.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    /// Initial scheduling delay, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Larger numbers are reserved first within a queue.
    #[serde(default)]
    pub priority: i32,
    /// Drop the job record entirely on successful completion.
    #[serde(default)]
    pub remove_on_complete: bool,
    /// Drop the job record entirely on terminal failure (the dead-letter
    /// record is still written).
    #[serde(default)]
    pub remove_on_fail: bool,
    /// Enqueue-time dedup key; a second enqueue with the same key is a no-op.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::default(),
            delay_ms: None,
            priority: 0,
            remove_on_complete: false,
            remove_on_fail: false,
            idempotency_key: None,
        }
    }
}

impl JobOptions {
    /// Default options with an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// A reserved or stored job. Payloads are opaque JSON; workers validate
/// them against typed payloads at reserve time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub opts: JobOptions,
    /// Deliveries so far, including the current one once reserved.
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    /// A fresh job bound for `queue`.
    #[must_use]
    pub fn new(queue: impl Into<String>, payload: serde_json::Value, opts: JobOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.into(),
            payload,
            opts,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            reserved_at: None,
            last_error: None,
        }
    }

    /// True if another delivery attempt remains after a retriable failure.
    #[must_use]
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts_made < self.opts.attempts
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let policy = BackoffPolicy::Exponential { delay_ms: 1_000 };
        let d0 = policy.delay_for_attempt(0);
        let d3 = policy.delay_for_attempt(3);
        // Jitter adds at most 25%.
        assert!(d0 >= Duration::from_millis(1_000));
        assert!(d0 <= Duration::from_millis(1_250));
        assert!(d3 >= Duration::from_millis(8_000));
        // A huge attempt number stays capped (plus jitter).
        let d_large = policy.delay_for_attempt(63);
        assert!(d_large <= MAX_BACKOFF + MAX_BACKOFF / 4);
    }

    #[test]
    fn test_fixed_backoff_is_constant_modulo_jitter() {
        let policy = BackoffPolicy::Fixed { delay_ms: 500 };
        for attempt in 0..5 {
            let d = policy.delay_for_attempt(attempt);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(625));
        }
    }

    #[test]
    fn test_default_options() {
        let opts = JobOptions::default();
        assert_eq!(opts.attempts, 3);
        assert!(matches!(opts.backoff, BackoffPolicy::Exponential { delay_ms: 1_000 }));
        assert!(opts.idempotency_key.is_none());
    }

    #[test]
    fn test_attempts_remaining() {
        let mut job = Job::new("q", serde_json::json!({}), JobOptions::default());
        assert!(job.has_attempts_remaining());
        job.attempts_made = 3;
        assert!(!job.has_attempts_remaining());
    }

    #[test]
    fn test_job_serde_round_trip() {
        let job = Job::new(
            "file-analysis",
            serde_json::json!({"file_path": "a.js"}),
            JobOptions::with_idempotency_key("key-1"),
        );
        let json = serde_json::to_string(&job).unwrap();
        let parsed: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.opts.idempotency_key.as_deref(), Some("key-1"));
    }
}
