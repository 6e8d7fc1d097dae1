// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dead_letter::DeadLetterRecord;
use crate::job::{Job, JobOptions};

/// Error types for broker operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Backend connection failure (retriable by the caller)
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Payload or job record could not be (de)serialized
    #[error("Broker serialization error: {0}")]
    Serialization(String),

    /// Backend command failure
    #[error("Broker backend error: {0}")]
    Backend(String),
}

/// Result type for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Job lifecycle states the broker tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was accepted; carries its id.
    Enqueued(String),
    /// A job with the same idempotency key already exists; nothing was added.
    Duplicate,
}

/// Result of failing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job was returned to the queue and will be redelivered after `delay`.
    Retried { delay: Duration },
    /// Attempts were exhausted (or the failure was permanent); the job moved
    /// to the queue's dead-letter queue.
    DeadLettered,
}

/// Thin abstraction over durable job queues.
///
/// Implementations provide at-least-once delivery. Every queue has an
/// automatically provisioned `{queue}-dead-letter` companion; on terminal
/// failure the job, its error, and its context move there atomically with
/// the original queue name preserved.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Add a job. Honors `opts.delay_ms` (scheduled delay) and
    /// `opts.idempotency_key` (enqueue-time dedup).
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> BrokerResult<EnqueueOutcome>;

    /// Reserve the next job, waiting up to `wait` for one to arrive.
    /// Returns `None` on timeout or when the queue is paused. Promotes due
    /// delayed jobs as a side effect.
    async fn reserve(&self, queue: &str, wait: Duration) -> BrokerResult<Option<Job>>;

    /// Acknowledge successful completion of a reserved job.
    async fn ack(&self, job: &Job) -> BrokerResult<()>;

    /// Report a failed job. Retriable failures re-queue with backoff
    /// (or `delay_override` when the caller knows the wait, e.g. a rate-limit
    /// refill); non-retriable failures and exhausted attempts dead-letter.
    async fn fail(
        &self,
        job: &Job,
        error: &str,
        retriable: bool,
        delay_override: Option<Duration>,
    ) -> BrokerResult<FailOutcome>;

    /// Per-state job counts.
    async fn counts(&self, queue: &str) -> BrokerResult<QueueCounts>;

    /// Remove every job in every state. Returns the number removed.
    async fn drain(&self, queue: &str) -> BrokerResult<u64>;

    /// Remove jobs in `state` older than `older_than`. Returns the number
    /// removed.
    async fn clean(&self, queue: &str, older_than: Duration, state: JobState) -> BrokerResult<u64>;

    /// Stop handing out jobs from this queue.
    async fn pause(&self, queue: &str) -> BrokerResult<()>;

    /// Resume a paused queue.
    async fn resume(&self, queue: &str) -> BrokerResult<()>;

    /// Most recent dead-letter records for a queue.
    async fn dead_letters(&self, queue: &str, limit: usize) -> BrokerResult<Vec<DeadLetterRecord>>;

    /// Active jobs reserved longer ago than `older_than` (stuck candidates).
    async fn stale_active(&self, queue: &str, older_than: Duration) -> BrokerResult<Vec<Job>>;
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_default_is_empty() {
        let counts = QueueCounts::default();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.active, 0);
        assert!(!counts.paused);
    }

    #[test]
    fn test_broker_error_display() {
        let e = BrokerError::Connection("refused".to_string());
        assert_eq!(e.to_string(), "Broker connection error: refused");
    }

    #[test]
    fn test_job_state_serde() {
        assert_eq!(
            serde_json::to_value(JobState::Waiting).unwrap(),
            serde_json::json!("waiting")
        );
    }
}
