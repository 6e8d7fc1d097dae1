// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The worker pool manager.
//!
//! Invariants:
//! - sum of in-flight slots <= the global cap
//! - per-type in-flight <= that type's (possibly scaled-down) concurrency
//! - token buckets refill continuously
//!
//! Admission order is: rate limit, then circuit breaker, then capacity.
//! Both rejection kinds carry the exact wait, so the caller can return the
//! job to the broker with that delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{CounterVec, Gauge, Opts};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use codegraph::metrics_constants::{
    METRIC_SLOTS_CIRCUIT_OPEN_TOTAL, METRIC_SLOTS_GRANTED_TOTAL, METRIC_SLOTS_IN_FLIGHT,
    METRIC_SLOTS_RATE_LIMITED_TOTAL,
};

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::rate_limit::TokenBucket;

static SLOTS_GRANTED: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(METRIC_SLOTS_GRANTED_TOTAL, "Total worker slots granted"),
        &["worker_type"],
    )
});
static SLOTS_RATE_LIMITED: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(
            METRIC_SLOTS_RATE_LIMITED_TOTAL,
            "Total slot requests rejected by the rate limiter",
        ),
        &["worker_type"],
    )
});
static SLOTS_CIRCUIT_OPEN: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(
            METRIC_SLOTS_CIRCUIT_OPEN_TOTAL,
            "Total slot requests rejected by an open circuit",
        ),
        &["worker_type"],
    )
});
static SLOTS_IN_FLIGHT: LazyLock<Gauge> = LazyLock::new(|| {
    codegraph::metrics_utils::gauge(METRIC_SLOTS_IN_FLIGHT, "In-flight worker slots")
});

/// Registration limits for one worker type.
#[derive(Debug, Clone)]
pub struct WorkerLimits {
    pub max_concurrency: usize,
    pub min_concurrency: usize,
    pub rate_limit_requests: u64,
    pub rate_limit_window: Duration,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            min_concurrency: 1,
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(1),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Slot admission failures. Both variants are retriable with a known wait.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("circuit open; retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("unknown worker type: {0}")]
    UnknownWorker(String),
}

impl SlotError {
    /// The wait the rejection prescribes, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } | Self::CircuitOpen { retry_after } => {
                Some(*retry_after)
            }
            Self::UnknownWorker(_) => None,
        }
    }
}

#[derive(Debug)]
struct WorkerEntry {
    limits: WorkerLimits,
    semaphore: Arc<Semaphore>,
    /// Permits withheld by adaptive scaling; each held permit reduces the
    /// effective concurrency by one.
    held_back: Mutex<Vec<OwnedSemaphorePermit>>,
    bucket: Mutex<TokenBucket>,
    breaker: CircuitBreaker,
    in_flight: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

/// Point-in-time stats for one worker type.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_type: String,
    pub in_flight: u64,
    pub effective_concurrency: usize,
    pub max_concurrency: usize,
    pub completed: u64,
    pub failed: u64,
    pub avg_duration_ms: u64,
    pub circuit_state: String,
}

/// Process-wide worker pool.
pub struct WorkerPool {
    global: Arc<Semaphore>,
    global_cap: usize,
    workers: DashMap<String, Arc<WorkerEntry>>,
}

impl WorkerPool {
    /// A pool with `global_cap` total in-flight slots.
    #[must_use]
    pub fn new(global_cap: usize) -> Self {
        let cap = global_cap.max(1);
        Self {
            global: Arc::new(Semaphore::new(cap)),
            global_cap: cap,
            workers: DashMap::new(),
        }
    }

    /// Register (or replace) a worker type.
    pub fn register_worker(&self, worker_type: &str, limits: WorkerLimits) {
        let max = limits.max_concurrency.max(1);
        info!(
            worker_type,
            max_concurrency = max,
            rate_limit_requests = limits.rate_limit_requests,
            failure_threshold = limits.failure_threshold,
            "Registering worker type"
        );
        let entry = WorkerEntry {
            semaphore: Arc::new(Semaphore::new(max)),
            held_back: Mutex::new(Vec::new()),
            bucket: Mutex::new(TokenBucket::new(
                limits.rate_limit_requests,
                limits.rate_limit_window,
            )),
            breaker: CircuitBreaker::new(
                worker_type,
                limits.failure_threshold,
                limits.reset_timeout,
            ),
            in_flight: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            limits: WorkerLimits {
                max_concurrency: max,
                min_concurrency: limits.min_concurrency.clamp(1, max),
                ..limits
            },
        };
        self.workers.insert(worker_type.to_string(), Arc::new(entry));
    }

    /// Request a slot for `worker_type`.
    ///
    /// Rejects immediately on rate limit or open circuit; waits on capacity
    /// (global cap, then per-type cap) otherwise.
    pub async fn request_slot(&self, worker_type: &str) -> Result<SlotGuard, SlotError> {
        let entry = self
            .workers
            .get(worker_type)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SlotError::UnknownWorker(worker_type.to_string()))?;

        if let Err(retry_after) = entry.bucket.lock().try_acquire() {
            SLOTS_RATE_LIMITED.with_label_values(&[worker_type]).inc();
            return Err(SlotError::RateLimited { retry_after });
        }

        if let Err(retry_after) = entry.breaker.try_acquire() {
            SLOTS_CIRCUIT_OPEN.with_label_values(&[worker_type]).inc();
            return Err(SlotError::CircuitOpen { retry_after });
        }

        // Capacity waits are deliberate: a consumer loop parks here rather
        // than spinning against a saturated stage.
        #[allow(clippy::expect_used)] // semaphores live as long as the pool
        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .expect("global semaphore closed");
        #[allow(clippy::expect_used)]
        let typed = Arc::clone(&entry.semaphore)
            .acquire_owned()
            .await
            .expect("worker semaphore closed");

        entry.in_flight.fetch_add(1, Ordering::Relaxed);
        SLOTS_GRANTED.with_label_values(&[worker_type]).inc();
        SLOTS_IN_FLIGHT.inc();

        Ok(SlotGuard {
            entry,
            _global: global,
            _typed: typed,
            started: Instant::now(),
            outcome_recorded: false,
        })
    }

    /// Acquire a slot, run `f`, and record its outcome with the breaker.
    pub async fn execute_with_management<F, Fut, T, E>(
        &self,
        worker_type: &str,
        f: F,
    ) -> Result<Result<T, E>, SlotError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let guard = self.request_slot(worker_type).await?;
        let result = f().await;
        guard.complete(result.is_ok());
        Ok(result)
    }

    /// Reduce a type's effective concurrency by one (toward its minimum).
    /// Returns true if a permit was withheld.
    pub fn throttle(&self, worker_type: &str) -> bool {
        let Some(entry) = self.workers.get(worker_type).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let mut held = entry.held_back.lock();
        let effective = entry.limits.max_concurrency - held.len();
        if effective <= entry.limits.min_concurrency {
            return false;
        }
        match Arc::clone(&entry.semaphore).try_acquire_owned() {
            Ok(permit) => {
                held.push(permit);
                debug!(worker_type, effective = effective - 1, "Throttled worker type");
                true
            }
            // Fully busy right now; try again on the next sample.
            Err(_) => false,
        }
    }

    /// Restore one unit of a type's effective concurrency.
    /// Returns true if a withheld permit was released.
    pub fn restore(&self, worker_type: &str) -> bool {
        let Some(entry) = self.workers.get(worker_type).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let released = entry.held_back.lock().pop().is_some();
        if released {
            debug!(worker_type, "Restored worker concurrency");
        }
        released
    }

    /// The type's current effective concurrency.
    #[must_use]
    pub fn effective_concurrency(&self, worker_type: &str) -> usize {
        self.workers
            .get(worker_type)
            .map(|e| e.limits.max_concurrency - e.held_back.lock().len())
            .unwrap_or(0)
    }

    /// All registered worker type names.
    #[must_use]
    pub fn worker_types(&self) -> Vec<String> {
        self.workers.iter().map(|e| e.key().clone()).collect()
    }

    /// The global slot cap.
    #[must_use]
    pub fn global_cap(&self) -> usize {
        self.global_cap
    }

    /// Current stats for one worker type.
    #[must_use]
    pub fn stats(&self, worker_type: &str) -> Option<WorkerStats> {
        let entry = self.workers.get(worker_type)?;
        let completed = entry.completed.load(Ordering::Relaxed);
        let total_ms = entry.total_duration_ms.load(Ordering::Relaxed);
        let held_back_len = entry.held_back.lock().len();
        let stats = WorkerStats {
            worker_type: worker_type.to_string(),
            in_flight: entry.in_flight.load(Ordering::Relaxed),
            effective_concurrency: entry.limits.max_concurrency - held_back_len,
            max_concurrency: entry.limits.max_concurrency,
            completed,
            failed: entry.failed.load(Ordering::Relaxed),
            avg_duration_ms: if completed == 0 { 0 } else { total_ms / completed },
            circuit_state: match entry.breaker.state() {
                CircuitState::Closed => "closed".to_string(),
                CircuitState::Open => "open".to_string(),
                CircuitState::HalfOpen => "half-open".to_string(),
            },
        };
        Some(stats)
    }
}

/// An admitted slot. Dropping the guard releases the capacity; calling
/// [`SlotGuard::complete`] additionally reports the outcome to the circuit
/// breaker. A guard dropped without an explicit outcome counts as success
/// (the breaker only tracks observed failures).
#[derive(Debug)]
pub struct SlotGuard {
    entry: Arc<WorkerEntry>,
    _global: OwnedSemaphorePermit,
    _typed: OwnedSemaphorePermit,
    started: Instant,
    outcome_recorded: bool,
}

impl SlotGuard {
    /// Report the job outcome and release the slot.
    pub fn complete(mut self, success: bool) {
        self.record(success);
    }

    /// Elapsed time since the slot was granted.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn record(&mut self, success: bool) {
        if self.outcome_recorded {
            return;
        }
        self.outcome_recorded = true;
        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.entry
            .total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        if success {
            self.entry.completed.fetch_add(1, Ordering::Relaxed);
            self.entry.breaker.record_success();
        } else {
            self.entry.failed.fetch_add(1, Ordering::Relaxed);
            self.entry.breaker.record_failure();
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.outcome_recorded {
            self.record(true);
        }
        self.entry.in_flight.fetch_sub(1, Ordering::Relaxed);
        SLOTS_IN_FLIGHT.dec();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize, rate: u64, window_ms: u64) -> WorkerLimits {
        WorkerLimits {
            max_concurrency: max,
            min_concurrency: 1,
            rate_limit_requests: rate,
            rate_limit_window: Duration::from_millis(window_ms),
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_unknown_worker_is_rejected() {
        let pool = WorkerPool::new(10);
        let err = pool.request_slot("nope").await.unwrap_err();
        assert!(matches!(err, SlotError::UnknownWorker(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_saturation() {
        // The canonical scenario: 2 requests per 1000ms window, 10 rapid
        // requests -> exactly 2 succeed, 8 rejected; after the window, 2 more.
        let pool = WorkerPool::new(100);
        pool.register_worker("w", limits(10, 2, 1000));

        let mut granted = Vec::new();
        let mut rejected = 0;
        for _ in 0..10 {
            match pool.request_slot("w").await {
                Ok(slot) => granted.push(slot),
                Err(SlotError::RateLimited { retry_after }) => {
                    assert!(retry_after > Duration::ZERO);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected rejection: {other}"),
            }
        }
        assert_eq!(granted.len(), 2);
        assert_eq!(rejected, 8);
        drop(granted);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        let a = pool.request_slot("w").await;
        let b = pool.request_slot("w").await;
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_circuit_opens_and_admits_probe() {
        let pool = WorkerPool::new(10);
        pool.register_worker("w", limits(4, 1_000, 1000));

        for _ in 0..3 {
            let slot = pool.request_slot("w").await.unwrap();
            slot.complete(false);
        }
        let err = pool.request_slot("w").await.unwrap_err();
        assert!(matches!(err, SlotError::CircuitOpen { .. }));

        // After the reset timeout one trial is admitted.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let probe = pool.request_slot("w").await.unwrap();
        probe.complete(true);
        assert!(pool.request_slot("w").await.is_ok());
    }

    #[tokio::test]
    async fn test_per_type_concurrency_cap() {
        let pool = WorkerPool::new(10);
        pool.register_worker("w", limits(2, 1_000, 1000));

        let a = pool.request_slot("w").await.unwrap();
        let _b = pool.request_slot("w").await.unwrap();

        // Third acquisition parks until a slot frees.
        let acquired =
            tokio::time::timeout(Duration::from_millis(50), pool.request_slot("w")).await;
        assert!(acquired.is_err(), "third slot should wait");

        drop(a);
        let c = tokio::time::timeout(Duration::from_millis(200), pool.request_slot("w"))
            .await
            .expect("slot should free")
            .unwrap();
        drop(c);
    }

    #[tokio::test]
    async fn test_global_cap_spans_worker_types() {
        let pool = WorkerPool::new(2);
        pool.register_worker("a", limits(2, 1_000, 1000));
        pool.register_worker("b", limits(2, 1_000, 1000));

        let _a = pool.request_slot("a").await.unwrap();
        let _b = pool.request_slot("b").await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.request_slot("a")).await;
        assert!(blocked.is_err(), "global cap should block the third slot");
    }

    #[tokio::test]
    async fn test_throttle_and_restore() {
        let pool = WorkerPool::new(10);
        pool.register_worker("w", limits(3, 1_000, 1000));
        assert_eq!(pool.effective_concurrency("w"), 3);

        assert!(pool.throttle("w"));
        assert!(pool.throttle("w"));
        assert_eq!(pool.effective_concurrency("w"), 1);
        // At the minimum; no further reduction.
        assert!(!pool.throttle("w"));

        assert!(pool.restore("w"));
        assert_eq!(pool.effective_concurrency("w"), 2);
    }

    #[tokio::test]
    async fn test_execute_with_management_records_failures() {
        let pool = WorkerPool::new(10);
        pool.register_worker("w", limits(4, 1_000, 1000));

        for _ in 0..3 {
            let result: Result<Result<(), &str>, SlotError> = pool
                .execute_with_management("w", || async { Err::<(), _>("boom") })
                .await;
            assert!(result.unwrap().is_err());
        }
        // Three failures tripped the breaker.
        let err = pool.request_slot("w").await.unwrap_err();
        assert!(matches!(err, SlotError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_stats_track_outcomes() {
        let pool = WorkerPool::new(10);
        pool.register_worker("w", limits(4, 1_000, 1000));

        let slot = pool.request_slot("w").await.unwrap();
        slot.complete(true);
        let slot = pool.request_slot("w").await.unwrap();
        slot.complete(false);

        let stats = pool.stats("w").unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }
}
