// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The consumer runtime.
//!
//! One cooperative task per consumer: reserve -> admission slot -> handle ->
//! ack/fail, then reserve again. Concurrency comes from running several
//! consumer tasks per queue under the pool's caps, never from spawning
//! per-job tasks. On shutdown a consumer stops reserving and finishes (or
//! abandons, after the grace period) its in-flight job; abandoned jobs are
//! recovered by the broker's stale-active sweep.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts};
use tracing::{debug, error, warn};

use codegraph::metrics_constants::{
    METRIC_JOBS_COMPLETED_TOTAL, METRIC_JOBS_FAILED_TOTAL, METRIC_JOBS_RETRIED_TOTAL,
    METRIC_JOB_DURATION_MS,
};
use codegraph::JobError;
use codegraph_broker::{FailOutcome, Job, QueueBroker};
use codegraph_pool::{SlotError, WorkerPool};

static JOBS_COMPLETED: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(METRIC_JOBS_COMPLETED_TOTAL, "Total jobs completed"),
        &["queue"],
    )
});
static JOBS_FAILED: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(METRIC_JOBS_FAILED_TOTAL, "Total jobs failed terminally"),
        &["queue"],
    )
});
static JOBS_RETRIED: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(METRIC_JOBS_RETRIED_TOTAL, "Total jobs returned for retry"),
        &["queue"],
    )
});
static JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    codegraph::metrics_utils::histogram_vec(
        HistogramOpts::new(METRIC_JOB_DURATION_MS, "Job handler duration in milliseconds"),
        &["queue"],
    )
});

/// How long one reserve call blocks before re-checking shutdown.
const RESERVE_WAIT: Duration = Duration::from_millis(500);
/// Pause after a broker error before retrying the reserve loop.
const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What the handler did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The job is finished; the runtime acks it.
    Done,
    /// The handler took ownership of the job's lifecycle (e.g. it joined a
    /// pending batch); the runtime must not ack or fail it.
    Deferred,
}

/// A queue consumer's job handler. The worker type doubles as the queue
/// name; it must be registered with the pool before consumers start.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Queue this handler consumes (also its pool worker type).
    fn worker_type(&self) -> &'static str;

    /// Process one reserved job.
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError>;
}

/// Run one consumer until `shutdown` flips to true.
pub async fn run_consumer(
    broker: Arc<dyn QueueBroker>,
    pool: Arc<WorkerPool>,
    handler: Arc<dyn JobHandler>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let queue = handler.worker_type();
    debug!(queue, "Consumer started");

    while !*shutdown.borrow() {
        let reserved = tokio::select! {
            reserved = broker.reserve(queue, RESERVE_WAIT) => reserved,
            _ = shutdown.changed() => continue,
        };
        let job = match reserved {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                warn!(queue, error = %e, "Reserve failed; backing off");
                tokio::time::sleep(BROKER_ERROR_BACKOFF).await;
                continue;
            }
        };

        process_job(&broker, &pool, handler.as_ref(), &job).await;
    }
    debug!(queue, "Consumer stopped");
}

async fn process_job(
    broker: &Arc<dyn QueueBroker>,
    pool: &Arc<WorkerPool>,
    handler: &dyn JobHandler,
    job: &Job,
) {
    let queue = handler.worker_type();
    let slot = match pool.request_slot(queue).await {
        Ok(slot) => slot,
        Err(e @ (SlotError::RateLimited { .. } | SlotError::CircuitOpen { .. })) => {
            // Both rejections are retriable with a known wait.
            let delay = e.retry_after();
            report_fail(broker, job, &e.to_string(), true, delay).await;
            return;
        }
        Err(SlotError::UnknownWorker(worker_type)) => {
            error!(queue, worker_type, "Worker type not registered with the pool");
            report_fail(broker, job, "worker type not registered", true, Some(BROKER_ERROR_BACKOFF))
                .await;
            return;
        }
    };

    let result = handler.handle(job).await;
    JOB_DURATION
        .with_label_values(&[queue])
        .observe(slot.elapsed().as_secs_f64() * 1000.0);

    match result {
        Ok(HandlerOutcome::Done) => {
            slot.complete(true);
            if let Err(e) = broker.ack(job).await {
                warn!(queue, job_id = %job.id, error = %e, "Ack failed; job may redeliver");
            } else {
                JOBS_COMPLETED.with_label_values(&[queue]).inc();
            }
        }
        Ok(HandlerOutcome::Deferred) => {
            // Batch membership: the handler acks at flush time.
            slot.complete(true);
        }
        Err(e) => {
            slot.complete(false);
            let delay = match &e {
                JobError::Retriable { delay, .. } => *delay,
                JobError::Permanent { .. } => None,
            };
            report_fail(broker, job, e.reason(), e.is_retriable(), delay).await;
        }
    }
}

async fn report_fail(
    broker: &Arc<dyn QueueBroker>,
    job: &Job,
    reason: &str,
    retriable: bool,
    delay: Option<Duration>,
) {
    match broker.fail(job, reason, retriable, delay).await {
        Ok(FailOutcome::Retried { delay }) => {
            JOBS_RETRIED.with_label_values(&[job.queue.as_str()]).inc();
            debug!(
                queue = %job.queue,
                job_id = %job.id,
                delay_ms = delay.as_millis() as u64,
                reason,
                "Job returned for retry"
            );
        }
        Ok(FailOutcome::DeadLettered) => {
            JOBS_FAILED.with_label_values(&[job.queue.as_str()]).inc();
        }
        Err(e) => {
            error!(
                queue = %job.queue,
                job_id = %job.id,
                error = %e,
                "Failed to report job failure; stale sweep will recover it"
            );
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use codegraph_broker::{InMemoryBroker, JobOptions};
    use codegraph_pool::WorkerLimits;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingHandler {
        outcome: fn() -> Result<HandlerOutcome, JobError>,
        handled: AtomicU64,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn worker_type(&self) -> &'static str {
            "test-queue"
        }
        async fn handle(&self, _job: &Job) -> Result<HandlerOutcome, JobError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn setup(outcome: fn() -> Result<HandlerOutcome, JobError>) -> (
        Arc<InMemoryBroker>,
        Arc<WorkerPool>,
        Arc<CountingHandler>,
    ) {
        let broker = Arc::new(InMemoryBroker::new());
        let pool = Arc::new(WorkerPool::new(10));
        pool.register_worker("test-queue", WorkerLimits::default());
        let handler = Arc::new(CountingHandler {
            outcome,
            handled: AtomicU64::new(0),
        });
        (broker, pool, handler)
    }

    #[tokio::test]
    async fn test_successful_job_is_acked() {
        let (broker, pool, handler) = setup(|| Ok(HandlerOutcome::Done));
        broker
            .enqueue("test-queue", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        let job = broker
            .reserve("test-queue", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        process_job(
            &(Arc::clone(&broker) as Arc<dyn QueueBroker>),
            &pool,
            handler.as_ref(),
            &job,
        )
        .await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        let counts = broker.counts("test-queue").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn test_retriable_failure_is_requeued() {
        let (broker, pool, handler) =
            setup(|| Err(JobError::retriable_after("transient", Duration::from_millis(10))));
        broker
            .enqueue("test-queue", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        let job = broker
            .reserve("test-queue", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        process_job(
            &(Arc::clone(&broker) as Arc<dyn QueueBroker>),
            &pool,
            handler.as_ref(),
            &job,
        )
        .await;

        let counts = broker.counts("test-queue").await.unwrap();
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters() {
        let (broker, pool, handler) = setup(|| Err(JobError::permanent("bad payload")));
        broker
            .enqueue("test-queue", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        let job = broker
            .reserve("test-queue", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        process_job(
            &(Arc::clone(&broker) as Arc<dyn QueueBroker>),
            &pool,
            handler.as_ref(),
            &job,
        )
        .await;

        let dead = broker.dead_letters("test-queue", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "bad payload");
    }

    #[tokio::test]
    async fn test_shutdown_stops_reserving() {
        let (broker, pool, handler) = setup(|| Ok(HandlerOutcome::Done));
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let consumer = tokio::spawn(run_consumer(
            Arc::clone(&broker) as Arc<dyn QueueBroker>,
            Arc::clone(&pool),
            Arc::clone(&handler) as Arc<dyn JobHandler>,
            shutdown_rx,
        ));

        // Let the consumer drain one job, then signal shutdown.
        broker
            .enqueue("test-queue", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("consumer should stop on shutdown")
            .unwrap();

        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);

        // Jobs enqueued after shutdown are not reserved.
        broker
            .enqueue("test-queue", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let counts = broker.counts("test-queue").await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_slot_returns_job_with_delay() {
        let broker = Arc::new(InMemoryBroker::new());
        let pool = Arc::new(WorkerPool::new(10));
        pool.register_worker(
            "test-queue",
            WorkerLimits {
                rate_limit_requests: 1,
                rate_limit_window: Duration::from_secs(60),
                ..WorkerLimits::default()
            },
        );
        let handler = Arc::new(CountingHandler {
            outcome: || Ok(HandlerOutcome::Done),
            handled: AtomicU64::new(0),
        });

        // Drain the single token.
        let slot = pool.request_slot("test-queue").await.unwrap();
        drop(slot);

        broker
            .enqueue("test-queue", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        let job = broker
            .reserve("test-queue", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        process_job(
            &(Arc::clone(&broker) as Arc<dyn QueueBroker>),
            &pool,
            handler.as_ref(),
            &job,
        )
        .await;

        // Handler never ran; the job went back delayed.
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
        let counts = broker.counts("test-queue").await.unwrap();
        assert_eq!(counts.delayed, 1);
    }
}
