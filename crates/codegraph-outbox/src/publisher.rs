// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The outbox polling loop.
//!
//! Each tick:
//! 1. reserve up to `batch_size` PENDING rows in ascending id order;
//! 2. persist POIs from finding events (idempotent by hash) - findings
//!    without relationship candidates are marked PUBLISHED in that same
//!    transaction;
//! 3. resolve relationship endpoints within the run; hold events whose
//!    endpoints have not arrived (bounded attempts, then FAILED with a
//!    diagnostic);
//! 4. coalesce resolved events into super-batches, enqueue each with an
//!    idempotency key derived from its event ids, then mark the events
//!    PUBLISHED - a crash between enqueue and mark is absorbed by the
//!    broker rejecting the duplicate key on the next tick.
//!
//! The loop never throws: a failed tick leaves rows PENDING and polling
//! continues on the next interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use prometheus::Counter;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use codegraph::hashing;
use codegraph::metrics_constants::{
    METRIC_OUTBOX_FAILED_TOTAL, METRIC_OUTBOX_HELD_TOTAL, METRIC_OUTBOX_PUBLISHED_TOTAL,
};
use codegraph::models::{EventPayload, OutboxEvent, RelationshipResolutionJob};
use codegraph::queues;
use codegraph_broker::{EnqueueOutcome, JobOptions, QueueBroker};
use codegraph_store::{queries, StagingStore};

use crate::resolution::resolve_candidates;
use crate::super_batch::{coalesce, ReadyEvent};

static PUBLISHED: LazyLock<Counter> = LazyLock::new(|| {
    codegraph::metrics_utils::counter(METRIC_OUTBOX_PUBLISHED_TOTAL, "Total outbox events published")
});
static HELD: LazyLock<Counter> = LazyLock::new(|| {
    codegraph::metrics_utils::counter(
        METRIC_OUTBOX_HELD_TOTAL,
        "Total outbox events held for later resolution",
    )
});
static FAILED: LazyLock<Counter> = LazyLock::new(|| {
    codegraph::metrics_utils::counter(
        METRIC_OUTBOX_FAILED_TOTAL,
        "Total outbox events failed after exhausting resolution attempts",
    )
});

/// Publisher tuning, usually sourced from [`codegraph::PipelineConfig`].
#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub super_batch_size: usize,
    pub max_resolution_attempts: u32,
    /// Base of the growing delay between resolution attempts
    /// (`base * 2^attempts`, capped at one minute).
    pub resolution_retry_base: Duration,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 200,
            super_batch_size: 1_000,
            max_resolution_attempts: 5,
            resolution_retry_base: Duration::from_secs(2),
        }
    }
}

/// What one tick accomplished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub reserved: usize,
    pub pois_persisted: u64,
    pub published: u64,
    pub held: u64,
    pub failed: u64,
    pub jobs_enqueued: u64,
    pub duplicate_jobs: u64,
}

/// Cumulative publisher stats (exposed through the health payload).
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub held: u64,
    pub failed: u64,
    pub jobs_enqueued: u64,
    pub duplicate_jobs: u64,
}

#[derive(Default)]
struct StatsInner {
    published: AtomicU64,
    held: AtomicU64,
    failed: AtomicU64,
    jobs_enqueued: AtomicU64,
    duplicate_jobs: AtomicU64,
}

/// The transactional outbox publisher.
pub struct OutboxPublisher {
    store: StagingStore,
    broker: Arc<dyn QueueBroker>,
    config: OutboxPublisherConfig,
    stats: Arc<StatsInner>,
}

impl OutboxPublisher {
    #[must_use]
    pub fn new(
        store: StagingStore,
        broker: Arc<dyn QueueBroker>,
        config: OutboxPublisherConfig,
    ) -> Self {
        Self {
            store,
            broker,
            config,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Cumulative stats snapshot.
    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.stats.published.load(Ordering::Relaxed),
            held: self.stats.held.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            jobs_enqueued: self.stats.jobs_enqueued.load(Ordering::Relaxed),
            duplicate_jobs: self.stats.duplicate_jobs.load(Ordering::Relaxed),
        }
    }

    /// Poll until `shutdown` flips to true. Errors are logged and absorbed;
    /// affected rows stay PENDING for the next tick.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox publisher started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.tick().await {
                        Ok(summary) if summary.reserved > 0 => {
                            debug!(
                                reserved = summary.reserved,
                                published = summary.published,
                                held = summary.held,
                                failed = summary.failed,
                                jobs = summary.jobs_enqueued,
                                "Outbox tick complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Outbox tick failed; rows remain PENDING");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Outbox publisher stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One poll cycle. Public for tests and for drain-style CLI use.
    pub async fn tick(&self) -> codegraph::Result<TickSummary> {
        let batch_size = self.config.batch_size;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let events = self
            .store
            .with_conn(move |conn| queries::outbox::pending(conn, batch_size, now_ms))
            .await
            .map_err(storage_err)?;

        let mut summary = TickSummary {
            reserved: events.len(),
            ..TickSummary::default()
        };
        if events.is_empty() {
            return Ok(summary);
        }

        // Phase 1: persist POIs; publish findings with no candidates in the
        // same transaction. Events carrying candidates move to phase 2.
        let mut relationship_events: Vec<OutboxEvent> = Vec::new();
        for event in events {
            match &event.payload {
                EventPayload::FileAnalysisFinding {
                    pois,
                    relationships,
                    file_path,
                    run_id,
                } => {
                    let persisted = self
                        .persist_finding(
                            event.id,
                            run_id.clone(),
                            file_path.clone(),
                            pois.clone(),
                            relationships.is_empty(),
                        )
                        .await?;
                    summary.pois_persisted += persisted;
                    if relationships.is_empty() {
                        summary.published += 1;
                        self.stats.published.fetch_add(1, Ordering::Relaxed);
                        PUBLISHED.inc();
                    } else {
                        relationship_events.push(event);
                    }
                }
                EventPayload::RelationshipCreation { .. } => relationship_events.push(event),
            }
        }

        // Phase 2: resolve endpoints for every candidate-bearing event.
        let mut ready: Vec<ReadyEvent> = Vec::new();
        let mut held: Vec<(i64, i64)> = Vec::new();
        let mut exhausted: Vec<(i64, String)> = Vec::new();
        for event in relationship_events {
            let candidates = match &event.payload {
                EventPayload::FileAnalysisFinding { relationships, .. }
                | EventPayload::RelationshipCreation { relationships, .. } => relationships.clone(),
            };
            let run_id = event.run_id.clone();
            let outcome = self
                .store
                .with_conn(move |conn| resolve_candidates(conn, &run_id, &candidates))
                .await
                .map_err(storage_err)?;

            if outcome.is_complete() {
                ready.push(ReadyEvent {
                    event_id: event.id,
                    run_id: event.run_id.clone(),
                    relationships: outcome.resolved,
                });
            } else if event.resolution_attempts + 1 >= self.config.max_resolution_attempts {
                let mut unresolved = outcome.unresolved;
                unresolved.sort();
                unresolved.dedup();
                exhausted.push((
                    event.id,
                    format!(
                        "unresolved POI references after {} attempts: {}",
                        event.resolution_attempts + 1,
                        unresolved.join(", ")
                    ),
                ));
            } else {
                // Growing delay before the next attempt, capped at a minute.
                let exp = 1u64.checked_shl(event.resolution_attempts).unwrap_or(u64::MAX);
                let delay_ms = (self.config.resolution_retry_base.as_millis() as u64)
                    .saturating_mul(exp)
                    .min(60_000);
                held.push((event.id, now_ms + delay_ms as i64));
            }
        }

        if !held.is_empty() {
            let holds = held.clone();
            self.store
                .transaction(move |tx| queries::outbox::bump_resolution_attempts(tx, &holds))
                .await
                .map_err(storage_err)?;
            summary.held = held.len() as u64;
            self.stats.held.fetch_add(summary.held, Ordering::Relaxed);
            HELD.inc_by(summary.held as f64);
        }

        for (event_id, reason) in exhausted {
            warn!(event_id, reason = %reason, "Outbox event failed resolution permanently");
            self.store
                .transaction(move |tx| queries::outbox::mark_failed(tx, event_id, &reason))
                .await
                .map_err(storage_err)?;
            summary.failed += 1;
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            FAILED.inc();
        }

        // Phase 3: super-batch and dispatch.
        for batch in coalesce(ready, self.config.super_batch_size) {
            let idempotency_key = hashing::idempotency_key(&batch.run_id, &batch.event_ids);
            let job = RelationshipResolutionJob {
                run_id: batch.run_id.clone(),
                relationships: batch.relationships,
                idempotency_key: idempotency_key.clone(),
            };
            let payload = serde_json::to_value(&job)?;
            let outcome = self
                .broker
                .enqueue(
                    queues::RELATIONSHIP_RESOLUTION,
                    payload,
                    JobOptions::with_idempotency_key(idempotency_key),
                )
                .await
                .map_err(broker_err)?;
            match outcome {
                EnqueueOutcome::Enqueued(_) => {
                    summary.jobs_enqueued += 1;
                    self.stats.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
                }
                EnqueueOutcome::Duplicate => {
                    // A previous tick enqueued this batch and crashed before
                    // marking; finishing the mark below restores the invariant.
                    summary.duplicate_jobs += 1;
                    self.stats.duplicate_jobs.fetch_add(1, Ordering::Relaxed);
                }
            }

            let event_ids = batch.event_ids.clone();
            let published = self
                .store
                .transaction(move |tx| queries::outbox::mark_published(tx, &event_ids))
                .await
                .map_err(storage_err)?;
            summary.published += published;
            self.stats.published.fetch_add(published, Ordering::Relaxed);
            PUBLISHED.inc_by(published as f64);
        }

        Ok(summary)
    }

    /// Persist one finding's POIs (idempotent); optionally publish the event
    /// in the same transaction.
    async fn persist_finding(
        &self,
        event_id: i64,
        run_id: String,
        file_path: String,
        pois: Vec<codegraph::models::Poi>,
        publish_now: bool,
    ) -> codegraph::Result<u64> {
        let pois = Arc::new(pois);
        self.store
            .transaction(move |tx| {
                queries::runs::ensure(tx, &run_id)?;
                let file_id = queries::files::get(tx, &run_id, &file_path)?.and_then(|f| f.id);
                let mut to_insert = (*pois).clone();
                for poi in &mut to_insert {
                    poi.file_id = poi.file_id.or(file_id);
                }
                let inserted = queries::pois::insert_batch(tx, &to_insert)?;
                if publish_now {
                    queries::outbox::mark_published(tx, &[event_id])?;
                }
                Ok(inserted)
            })
            .await
            .map_err(storage_err)
    }
}

fn storage_err(e: codegraph_store::StoreError) -> codegraph::Error {
    codegraph::Error::Storage(e.to_string())
}

fn broker_err(e: codegraph_broker::BrokerError) -> codegraph::Error {
    codegraph::Error::Broker(e.to_string())
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use codegraph::models::{
        NewOutboxEvent, Poi, PoiType, RelationshipCandidate,
    };
    use codegraph_broker::InMemoryBroker;

    fn poi(file: &str, name: &str) -> Poi {
        Poi::from_classifier(file, name, PoiType::FunctionDefinition, 1, 5, true, "run-1")
    }

    fn candidate(source: &str, target: &str) -> RelationshipCandidate {
        RelationshipCandidate {
            source: source.to_string(),
            target: target.to_string(),
            rel_type: "CALLS".to_string(),
            file_path: "b.js".to_string(),
            confidence: 0.8,
            reason: "call expression".to_string(),
        }
    }

    fn finding(file: &str, pois: Vec<Poi>, relationships: Vec<RelationshipCandidate>) -> NewOutboxEvent {
        NewOutboxEvent::new(EventPayload::FileAnalysisFinding {
            run_id: "run-1".to_string(),
            file_path: file.to_string(),
            pois,
            relationships,
        })
    }

    async fn publisher_with(
        config: OutboxPublisherConfig,
    ) -> (OutboxPublisher, StagingStore, Arc<InMemoryBroker>) {
        let store = StagingStore::open_in_memory().await.unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = OutboxPublisher::new(store.clone(), Arc::clone(&broker) as Arc<dyn QueueBroker>, config);
        (publisher, store, broker)
    }

    async fn insert_event(store: &StagingStore, event: NewOutboxEvent) -> i64 {
        store
            .transaction(move |tx| queries::outbox::insert(tx, &event))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_finding_without_candidates_publishes_immediately() {
        let (publisher, store, _broker) = publisher_with(OutboxPublisherConfig::default()).await;
        insert_event(&store, finding("a.js", vec![poi("a.js", "createUser")], vec![])).await;

        let summary = publisher.tick().await.unwrap();
        assert_eq!(summary.reserved, 1);
        assert_eq!(summary.published, 1);
        assert_eq!(summary.pois_persisted, 1);
        assert_eq!(summary.jobs_enqueued, 0);

        let (pending, published, _) = store
            .with_conn(|c| queries::outbox::counts_by_status(c, "run-1"))
            .await
            .unwrap();
        assert_eq!((pending, published), (0, 1));
    }

    #[tokio::test]
    async fn test_resolves_and_enqueues_relationship_job() {
        let (publisher, store, broker) = publisher_with(OutboxPublisherConfig::default()).await;
        insert_event(&store, finding("a.js", vec![poi("a.js", "createUser")], vec![])).await;
        insert_event(
            &store,
            finding(
                "b.js",
                vec![poi("b.js", "validateUser")],
                vec![candidate("validateUser", "createUser")],
            ),
        )
        .await;

        let summary = publisher.tick().await.unwrap();
        assert_eq!(summary.published, 2);
        assert_eq!(summary.jobs_enqueued, 1);

        let counts = broker.counts(queues::RELATIONSHIP_RESOLUTION).await.unwrap();
        assert_eq!(counts.waiting, 1);

        let job = broker
            .reserve(queues::RELATIONSHIP_RESOLUTION, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let parsed: RelationshipResolutionJob = serde_json::from_value(job.payload).unwrap();
        assert_eq!(parsed.relationships.len(), 1);
        assert_eq!(parsed.relationships[0].rel_type, "CALLS");
    }

    #[tokio::test]
    async fn test_forward_reference_is_held_then_published() {
        // Scenario: b.js (with the call) is processed before a.js (with the
        // target). The event stays PENDING until the target POI arrives.
        let config = OutboxPublisherConfig {
            resolution_retry_base: Duration::from_millis(20),
            ..OutboxPublisherConfig::default()
        };
        let (publisher, store, broker) = publisher_with(config).await;
        insert_event(
            &store,
            finding(
                "b.js",
                vec![poi("b.js", "validateUser")],
                vec![candidate("validateUser", "createUser")],
            ),
        )
        .await;

        let summary = publisher.tick().await.unwrap();
        assert_eq!(summary.held, 1);
        assert_eq!(summary.jobs_enqueued, 0);
        let (pending, _, failed) = store
            .with_conn(|c| queries::outbox::counts_by_status(c, "run-1"))
            .await
            .unwrap();
        assert_eq!((pending, failed), (1, 0));

        // The target arrives via a later file's event; once the hold delay
        // elapses the next cycle resolves and publishes.
        insert_event(&store, finding("a.js", vec![poi("a.js", "createUser")], vec![])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = publisher.tick().await.unwrap();
        assert_eq!(summary.held, 0);
        assert_eq!(summary.jobs_enqueued, 1);
        assert_eq!(summary.published, 2);

        let counts = broker.counts(queues::RELATIONSHIP_RESOLUTION).await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_reference_fails_with_diagnostic() {
        let config = OutboxPublisherConfig {
            max_resolution_attempts: 3,
            resolution_retry_base: Duration::from_millis(10),
            ..OutboxPublisherConfig::default()
        };
        let (publisher, store, _broker) = publisher_with(config).await;
        insert_event(
            &store,
            finding(
                "b.js",
                vec![poi("b.js", "validateUser")],
                vec![candidate("validateUser", "neverDefined")],
            ),
        )
        .await;

        // Attempts 1 and 2 hold (with growing delay); attempt 3 fails.
        assert_eq!(publisher.tick().await.unwrap().held, 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(publisher.tick().await.unwrap().held, 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let summary = publisher.tick().await.unwrap();
        assert_eq!(summary.failed, 1);

        let reason: String = store
            .with_conn(|c| {
                Ok(c.query_row(
                    "SELECT failure_reason FROM outbox WHERE status = 'FAILED'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert!(reason.contains("neverDefined"));
        assert!(reason.contains("3 attempts"));
    }

    #[tokio::test]
    async fn test_exactly_once_after_crash_between_enqueue_and_mark() {
        let (publisher, store, broker) = publisher_with(OutboxPublisherConfig::default()).await;
        insert_event(&store, finding("a.js", vec![poi("a.js", "createUser")], vec![])).await;
        let rel_event_id = insert_event(
            &store,
            finding(
                "b.js",
                vec![poi("b.js", "validateUser")],
                vec![candidate("validateUser", "createUser")],
            ),
        )
        .await;

        let summary = publisher.tick().await.unwrap();
        assert_eq!(summary.jobs_enqueued, 1);

        // Simulate a crash after enqueue but before PUBLISHED: revert the
        // row and re-run the publisher.
        store
            .with_conn(move |c| {
                c.execute(
                    "UPDATE outbox SET status = 'PENDING' WHERE id = ?1",
                    rusqlite::params![rel_event_id],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let summary = publisher.tick().await.unwrap();
        assert_eq!(summary.jobs_enqueued, 0);
        assert_eq!(summary.duplicate_jobs, 1);
        assert_eq!(summary.published, 1);

        // Exactly one downstream job exists.
        let counts = broker.counts(queues::RELATIONSHIP_RESOLUTION).await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn test_poi_persistence_is_idempotent_across_ticks() {
        let (publisher, store, _broker) = publisher_with(OutboxPublisherConfig::default()).await;
        insert_event(&store, finding("a.js", vec![poi("a.js", "createUser")], vec![])).await;
        publisher.tick().await.unwrap();

        // Same POIs arriving again in a new event insert nothing new.
        insert_event(&store, finding("a.js", vec![poi("a.js", "createUser")], vec![])).await;
        let summary = publisher.tick().await.unwrap();
        assert_eq!(summary.pois_persisted, 0);

        let count = store
            .with_conn(|c| queries::pois::count_by_run(c, "run-1"))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
