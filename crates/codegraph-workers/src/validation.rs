// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Evidence validation worker.
//!
//! Accumulates one evidence item per distinct source against
//! `relationship_evidence_tracking`. When the expected count is reached the
//! relationship moves to VALIDATED and a reconciliation job is emitted.
//! Duplicate deliveries of the same source are absorbed by the tracking
//! row, so at-least-once queues cannot inflate the count.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use codegraph::models::{ReconciliationJob, RelationshipStatus, ValidationJob};
use codegraph::{hashing, queues, JobError};
use codegraph_broker::{Job, JobOptions, QueueBroker};
use codegraph_store::{queries, StagingStore};

use crate::runtime::{HandlerOutcome, JobHandler};

/// The `validation` consumer.
pub struct ValidationWorker {
    store: StagingStore,
    broker: Arc<dyn QueueBroker>,
}

impl ValidationWorker {
    #[must_use]
    pub fn new(store: StagingStore, broker: Arc<dyn QueueBroker>) -> Self {
        Self { store, broker }
    }
}

#[async_trait]
impl JobHandler for ValidationWorker {
    fn worker_type(&self) -> &'static str {
        queues::VALIDATION
    }

    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let evidence: ValidationJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid validation payload: {e}")))?;

        let run_id = evidence.run_id.clone();
        let relationship_hash = evidence.relationship_hash.clone();
        let source = evidence.source.clone();
        let relationship_id = evidence.relationship_id;
        let confidence = evidence.confidence;
        let expected = evidence.expected_count;

        let (tracking, completed_now) = self
            .store
            .transaction(move |tx| {
                queries::evidence::ensure(tx, &run_id, &relationship_hash, expected)?;
                let (tracking, completed_now) =
                    queries::evidence::add(tx, &run_id, &relationship_hash, &source, confidence)?;
                queries::relationships::append_evidence(
                    tx,
                    relationship_id,
                    &serde_json::json!({
                        "source": source,
                        "confidence": confidence,
                    }),
                )?;
                if completed_now {
                    queries::relationships::set_status(
                        tx,
                        relationship_id,
                        RelationshipStatus::Validated,
                    )?;
                }
                Ok((tracking, completed_now))
            })
            .await
            .map_err(|e| match e {
                codegraph_store::StoreError::NotFound(what) => {
                    JobError::permanent(format!("missing {what}"))
                }
                other => JobError::retriable(other.to_string()),
            })?;

        debug!(
            relationship_id = evidence.relationship_id,
            evidence_count = tracking.evidence_count,
            expected_count = tracking.expected_count,
            avg_confidence = tracking.avg_confidence,
            completed = completed_now,
            "Evidence accumulated"
        );

        if completed_now {
            let reconciliation = ReconciliationJob {
                run_id: evidence.run_id.clone(),
                relationship_id: evidence.relationship_id,
                relationship_hash: evidence.relationship_hash.clone(),
            };
            let key = hashing::sha256_hex(
                format!("rec:{}:{}", evidence.run_id, evidence.relationship_hash).as_bytes(),
            );
            self.broker
                .enqueue(
                    queues::RECONCILIATION,
                    serde_json::to_value(&reconciliation)
                        .map_err(|e| JobError::permanent(e.to_string()))?,
                    JobOptions::with_idempotency_key(key),
                )
                .await
                .map_err(|e| JobError::retriable(format!("reconciliation enqueue: {e}")))?;
        }

        Ok(HandlerOutcome::Done)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use codegraph::models::{Poi, PoiType, ResolvedRelationship};
    use codegraph_broker::InMemoryBroker;

    async fn fixture() -> (ValidationWorker, StagingStore, Arc<InMemoryBroker>, i64, String) {
        let store = StagingStore::open_in_memory().await.unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let worker = ValidationWorker::new(store.clone(), Arc::clone(&broker) as Arc<dyn QueueBroker>);
        let (relationship_id, hash) = store
            .transaction(|tx| {
                queries::runs::ensure(tx, "run-1")?;
                queries::pois::insert_batch(
                    tx,
                    &[
                        Poi::from_classifier("a.js", "a", PoiType::FunctionDefinition, 1, 2, true, "run-1"),
                        Poi::from_classifier("b.js", "b", PoiType::FunctionDefinition, 1, 2, true, "run-1"),
                    ],
                )?;
                let source = queries::pois::resolve_id(tx, "run-1", "b")?.unwrap_or(1);
                let target = queries::pois::resolve_id(tx, "run-1", "a")?.unwrap_or(2);
                let id = queries::relationships::insert_pending(
                    tx,
                    &ResolvedRelationship {
                        source_poi_id: source,
                        target_poi_id: target,
                        rel_type: "CALLS".to_string(),
                        file_path: "b.js".to_string(),
                        confidence: 0.8,
                        reason: String::new(),
                        run_id: "run-1".to_string(),
                    },
                )?;
                Ok((id, hashing::relationship_hash(source, target, "CALLS")))
            })
            .await
            .unwrap();
        (worker, store, broker, relationship_id, hash)
    }

    fn validation_job(relationship_id: i64, hash: &str, source: &str, expected: u32) -> Job {
        Job::new(
            queues::VALIDATION,
            serde_json::to_value(ValidationJob {
                run_id: "run-1".to_string(),
                relationship_id,
                relationship_hash: hash.to_string(),
                source: source.to_string(),
                confidence: 0.8,
                expected_count: expected,
            })
            .unwrap(),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_completion_validates_and_enqueues_reconciliation() {
        let (worker, store, broker, relationship_id, hash) = fixture().await;

        worker
            .handle(&validation_job(relationship_id, &hash, "initial_analysis", 1))
            .await
            .unwrap();

        let rel = store
            .with_conn(move |c| queries::relationships::get(c, relationship_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rel.status, RelationshipStatus::Validated);
        assert_eq!(rel.evidence.len(), 1);

        assert_eq!(broker.counts(queues::RECONCILIATION).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_partial_evidence_stays_pending() {
        let (worker, store, broker, relationship_id, hash) = fixture().await;

        worker
            .handle(&validation_job(relationship_id, &hash, "initial_analysis", 4))
            .await
            .unwrap();

        let rel = store
            .with_conn(move |c| queries::relationships::get(c, relationship_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rel.status, RelationshipStatus::Pending);
        assert_eq!(broker.counts(queues::RECONCILIATION).await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_duplicate_source_delivery_does_not_complete() {
        let (worker, _store, broker, relationship_id, hash) = fixture().await;

        worker
            .handle(&validation_job(relationship_id, &hash, "initial_analysis", 2))
            .await
            .unwrap();
        // Redelivery of the same evidence source.
        worker
            .handle(&validation_job(relationship_id, &hash, "initial_analysis", 2))
            .await
            .unwrap();

        assert_eq!(broker.counts(queues::RECONCILIATION).await.unwrap().waiting, 0);

        // A different source completes it.
        worker
            .handle(&validation_job(relationship_id, &hash, "cross_file", 2))
            .await
            .unwrap();
        assert_eq!(broker.counts(queues::RECONCILIATION).await.unwrap().waiting, 1);
    }
}
