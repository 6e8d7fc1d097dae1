// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-memory queue backend.
//!
//! Mirrors the Redis backend's semantics (delays, retries, dead letters,
//! idempotency keys, pause/resume) without external dependencies. Used by
//! tests and single-process development runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::broker::{
    BrokerError, BrokerResult, EnqueueOutcome, FailOutcome, JobState, QueueBroker, QueueCounts,
};
use crate::dead_letter::DeadLetterRecord;
use crate::job::{Job, JobOptions};

/// Reserve poll granularity.
const RESERVE_POLL: Duration = Duration::from_millis(20);
/// Dead letters retained per queue.
const MAX_DEAD_LETTERS: usize = 10_000;

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<Job>,
    delayed: Vec<(DateTime<Utc>, Job)>,
    active: HashMap<String, Job>,
    completed: Vec<(DateTime<Utc>, Job)>,
    failed: Vec<(DateTime<Utc>, Job)>,
    dead: VecDeque<DeadLetterRecord>,
    dedupe_keys: HashSet<String>,
    paused: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut still_delayed = Vec::with_capacity(self.delayed.len());
        for (ready_at, job) in self.delayed.drain(..) {
            if ready_at <= now {
                push_by_priority(&mut self.waiting, job);
            } else {
                still_delayed.push((ready_at, job));
            }
        }
        self.delayed = still_delayed;
    }
}

fn push_by_priority(waiting: &mut VecDeque<Job>, job: Job) {
    if job.opts.priority == 0 {
        waiting.push_back(job);
        return;
    }
    let pos = waiting
        .iter()
        .position(|existing| existing.opts.priority < job.opts.priority)
        .unwrap_or(waiting.len());
    waiting.insert(pos, job);
}

/// Process-local [`QueueBroker`] implementation.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.queues.lock();
        f(queues.entry(queue.to_string()).or_default())
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> BrokerResult<EnqueueOutcome> {
        self.with_queue(queue, |state| {
            if let Some(key) = &opts.idempotency_key {
                if !state.dedupe_keys.insert(key.clone()) {
                    return Ok(EnqueueOutcome::Duplicate);
                }
            }
            let delay_ms = opts.delay_ms;
            let job = Job::new(queue, payload, opts);
            let id = job.id.clone();
            match delay_ms {
                Some(ms) if ms > 0 => {
                    let ready_at = Utc::now() + chrono::Duration::milliseconds(ms as i64);
                    state.delayed.push((ready_at, job));
                }
                _ => push_by_priority(&mut state.waiting, job),
            }
            Ok(EnqueueOutcome::Enqueued(id))
        })
    }

    async fn reserve(&self, queue: &str, wait: Duration) -> BrokerResult<Option<Job>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let reserved = self.with_queue(queue, |state| {
                if state.paused {
                    return None;
                }
                state.promote_due(Utc::now());
                state.waiting.pop_front().map(|mut job| {
                    job.attempts_made += 1;
                    job.reserved_at = Some(Utc::now());
                    state.active.insert(job.id.clone(), job.clone());
                    job
                })
            });
            if reserved.is_some() {
                return Ok(reserved);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESERVE_POLL.min(wait)).await;
        }
    }

    async fn ack(&self, job: &Job) -> BrokerResult<()> {
        self.with_queue(&job.queue, |state| {
            if let Some(done) = state.active.remove(&job.id) {
                if !done.opts.remove_on_complete {
                    state.completed.push((Utc::now(), done));
                }
                Ok(())
            } else {
                Err(BrokerError::Backend(format!(
                    "ack for unknown active job {}",
                    job.id
                )))
            }
        })
    }

    async fn fail(
        &self,
        job: &Job,
        error: &str,
        retriable: bool,
        delay_override: Option<Duration>,
    ) -> BrokerResult<FailOutcome> {
        self.with_queue(&job.queue, |state| {
            let Some(mut failed) = state.active.remove(&job.id) else {
                return Err(BrokerError::Backend(format!(
                    "fail for unknown active job {}",
                    job.id
                )));
            };
            failed.last_error = Some(error.to_string());
            failed.reserved_at = None;

            if retriable && failed.has_attempts_remaining() {
                // attempts_made counts deliveries, so the next retry is
                // attempt number `attempts_made` (0-based for backoff).
                let delay = delay_override.unwrap_or_else(|| {
                    failed.opts.backoff.delay_for_attempt(failed.attempts_made.saturating_sub(1))
                });
                let ready_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                state.delayed.push((ready_at, failed));
                Ok(FailOutcome::Retried { delay })
            } else {
                let error_type = if retriable { "attempts_exhausted" } else { "permanent" };
                let record = DeadLetterRecord::from_job(&failed, error, error_type);
                state.dead.push_back(record);
                while state.dead.len() > MAX_DEAD_LETTERS {
                    state.dead.pop_front();
                }
                if !failed.opts.remove_on_fail {
                    state.failed.push((Utc::now(), failed));
                }
                Ok(FailOutcome::DeadLettered)
            }
        })
    }

    async fn counts(&self, queue: &str) -> BrokerResult<QueueCounts> {
        self.with_queue(queue, |state| {
            state.promote_due(Utc::now());
            Ok(QueueCounts {
                waiting: state.waiting.len() as u64,
                active: state.active.len() as u64,
                completed: state.completed.len() as u64,
                failed: state.failed.len() as u64,
                delayed: state.delayed.len() as u64,
                paused: state.paused,
            })
        })
    }

    async fn drain(&self, queue: &str) -> BrokerResult<u64> {
        self.with_queue(queue, |state| {
            let removed = state.waiting.len()
                + state.delayed.len()
                + state.active.len()
                + state.completed.len()
                + state.failed.len();
            let paused = state.paused;
            let dedupe_keys = std::mem::take(&mut state.dedupe_keys);
            *state = QueueState {
                paused,
                dedupe_keys,
                ..QueueState::default()
            };
            Ok(removed as u64)
        })
    }

    async fn clean(&self, queue: &str, older_than: Duration, state: JobState) -> BrokerResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than.as_millis() as i64);
        self.with_queue(queue, |qs| {
            let removed = match state {
                JobState::Completed => {
                    let before = qs.completed.len();
                    qs.completed.retain(|(at, _)| *at > cutoff);
                    before - qs.completed.len()
                }
                JobState::Failed => {
                    let before = qs.failed.len();
                    qs.failed.retain(|(at, _)| *at > cutoff);
                    before - qs.failed.len()
                }
                JobState::Delayed => {
                    let before = qs.delayed.len();
                    qs.delayed.retain(|(_, job)| job.enqueued_at > cutoff);
                    before - qs.delayed.len()
                }
                JobState::Waiting => {
                    let before = qs.waiting.len();
                    qs.waiting.retain(|job| job.enqueued_at > cutoff);
                    before - qs.waiting.len()
                }
                JobState::Active | JobState::Paused => 0,
            };
            Ok(removed as u64)
        })
    }

    async fn pause(&self, queue: &str) -> BrokerResult<()> {
        self.with_queue(queue, |state| {
            state.paused = true;
            Ok(())
        })
    }

    async fn resume(&self, queue: &str) -> BrokerResult<()> {
        self.with_queue(queue, |state| {
            state.paused = false;
            Ok(())
        })
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> BrokerResult<Vec<DeadLetterRecord>> {
        self.with_queue(queue, |state| {
            Ok(state.dead.iter().rev().take(limit).cloned().collect())
        })
    }

    async fn stale_active(&self, queue: &str, older_than: Duration) -> BrokerResult<Vec<Job>> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than.as_millis() as i64);
        self.with_queue(queue, |state| {
            Ok(state
                .active
                .values()
                .filter(|job| job.reserved_at.is_some_and(|at| at < cutoff))
                .cloned()
                .collect())
        })
    }
}
