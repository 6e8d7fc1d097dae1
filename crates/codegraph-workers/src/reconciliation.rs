// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Reconciliation worker.
//!
//! Finalizes a fully-evidenced relationship: deduplicates by
//! `(source, target, type)` keeping the maximum confidence (the staging
//! store's unique key makes duplicates structural no-ops, but confidence is
//! still folded up), sets RECONCILED or REJECTED by threshold, and emits
//! the run's graph-ingestion job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use codegraph::models::{GraphIngestionJob, ReconciliationJob, RelationshipStatus};
use codegraph::{hashing, queues, JobError};
use codegraph_broker::{Job, JobOptions, QueueBroker};
use codegraph_store::{queries, StagingStore};

use crate::runtime::{HandlerOutcome, JobHandler};

/// Reconciliation thresholds.
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Average evidence confidence at or above this finalizes RECONCILED;
    /// below it finalizes REJECTED.
    pub accept_threshold: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.45,
        }
    }
}

/// The `reconciliation` consumer.
pub struct ReconciliationWorker {
    store: StagingStore,
    broker: Arc<dyn QueueBroker>,
    config: ReconciliationConfig,
}

impl ReconciliationWorker {
    #[must_use]
    pub fn new(
        store: StagingStore,
        broker: Arc<dyn QueueBroker>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }
}

#[async_trait]
impl JobHandler for ReconciliationWorker {
    fn worker_type(&self) -> &'static str {
        queues::RECONCILIATION
    }

    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let request: ReconciliationJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid reconciliation payload: {e}")))?;

        let run_id = request.run_id.clone();
        let relationship_hash = request.relationship_hash.clone();
        let relationship_id = request.relationship_id;
        let threshold = self.config.accept_threshold;

        let finalized = self
            .store
            .transaction(move |tx| {
                let rel = queries::relationships::get(tx, relationship_id)?.ok_or_else(|| {
                    codegraph_store::StoreError::NotFound(format!(
                        "relationship {relationship_id}"
                    ))
                })?;
                // Terminal already (a redelivered job): nothing to do.
                if matches!(
                    rel.status,
                    RelationshipStatus::Reconciled | RelationshipStatus::Rejected
                ) {
                    return Ok(rel.status);
                }

                let tracking = queries::evidence::get(tx, &run_id, &relationship_hash)?
                    .ok_or_else(|| {
                        codegraph_store::StoreError::NotFound(format!(
                            "evidence tracking {relationship_hash}"
                        ))
                    })?;

                // Dedup pass: any sibling rows of the same triple fold their
                // best confidence into the canonical (earliest) row.
                let duplicates = queries::relationships::duplicates_of(tx, &rel)?;
                let best = duplicates
                    .iter()
                    .map(|d| d.confidence)
                    .fold(rel.confidence, f64::max);
                if best > rel.confidence {
                    queries::relationships::accept_with_confidence(tx, relationship_id, best)?;
                }

                let status = if tracking.avg_confidence >= threshold {
                    RelationshipStatus::Reconciled
                } else {
                    RelationshipStatus::Rejected
                };
                queries::relationships::set_status(tx, relationship_id, status)?;
                Ok(status)
            })
            .await
            .map_err(|e| match e {
                codegraph_store::StoreError::NotFound(what) => {
                    JobError::permanent(format!("missing {what}"))
                }
                other => JobError::retriable(other.to_string()),
            })?;

        debug!(
            relationship_id = request.relationship_id,
            status = finalized.as_str(),
            "Relationship finalized"
        );

        if finalized == RelationshipStatus::Reconciled {
            let ingestion = GraphIngestionJob {
                run_id: request.run_id.clone(),
            };
            let key = hashing::sha256_hex(
                format!("graph:{}:{}", request.run_id, request.relationship_hash).as_bytes(),
            );
            if let Err(e) = self
                .broker
                .enqueue(
                    queues::GRAPH_INGESTION,
                    serde_json::to_value(&ingestion)
                        .map_err(|e| JobError::permanent(e.to_string()))?,
                    JobOptions::with_idempotency_key(key),
                )
                .await
            {
                warn!(error = %e, "Graph ingestion enqueue failed");
                return Err(JobError::retriable(format!("ingestion enqueue: {e}")));
            }
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

    async fn fixture(avg_confidence: f64) -> (ReconciliationWorker, StagingStore, Arc<InMemoryBroker>, i64, String) {
        let store = StagingStore::open_in_memory().await.unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let worker = ReconciliationWorker::new(
            store.clone(),
            Arc::clone(&broker) as Arc<dyn QueueBroker>,
            ReconciliationConfig::default(),
        );
        let (relationship_id, hash) = store
            .transaction(move |tx| {
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
                let hash = hashing::relationship_hash(source, target, "CALLS");
                queries::evidence::ensure(tx, "run-1", &hash, 1)?;
                queries::evidence::add(tx, "run-1", &hash, "initial_analysis", avg_confidence)?;
                Ok((id, hash))
            })
            .await
            .unwrap();
        (worker, store, broker, relationship_id, hash)
    }

    fn reconciliation_job(relationship_id: i64, hash: &str) -> Job {
        Job::new(
            queues::RECONCILIATION,
            serde_json::to_value(ReconciliationJob {
                run_id: "run-1".to_string(),
                relationship_id,
                relationship_hash: hash.to_string(),
            })
            .unwrap(),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_strong_evidence_reconciles_and_emits_ingestion() {
        let (worker, store, broker, relationship_id, hash) = fixture(0.8).await;
        worker.handle(&reconciliation_job(relationship_id, &hash)).await.unwrap();

        let rel = store
            .with_conn(move |c| queries::relationships::get(c, relationship_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rel.status, RelationshipStatus::Reconciled);
        assert_eq!(broker.counts(queues::GRAPH_INGESTION).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_weak_evidence_rejects_without_ingestion() {
        let (worker, store, broker, relationship_id, hash) = fixture(0.2).await;
        worker.handle(&reconciliation_job(relationship_id, &hash)).await.unwrap();

        let rel = store
            .with_conn(move |c| queries::relationships::get(c, relationship_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rel.status, RelationshipStatus::Rejected);
        assert_eq!(broker.counts(queues::GRAPH_INGESTION).await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_redelivered_job_is_a_no_op() {
        let (worker, _store, broker, relationship_id, hash) = fixture(0.8).await;
        worker.handle(&reconciliation_job(relationship_id, &hash)).await.unwrap();
        worker.handle(&reconciliation_job(relationship_id, &hash)).await.unwrap();
        // Idempotency key on the ingestion enqueue collapses the duplicate.
        assert_eq!(broker.counts(queues::GRAPH_INGESTION).await.unwrap().waiting, 1);
    }
}
