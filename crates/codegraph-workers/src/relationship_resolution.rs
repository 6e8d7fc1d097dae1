// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Relationship scoring worker.
//!
//! Consumes the super-batched jobs the outbox publisher emits. Each
//! resolved candidate is persisted as a PENDING relationship and scored by
//! the confidence scorer; low-confidence candidates go to triangulation,
//! everything else goes straight to evidence validation.
//!
//! Evidence bookkeeping: a relationship expects one evidence item (the
//! initial analysis) unless it escalates, in which case it expects four
//! (initial + the three triangulation roles). An escalated relationship
//! that the triangulation later rejects never completes its evidence - it
//! is terminally REJECTED instead.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use codegraph::models::{
    EvidenceSource, RelationshipResolutionJob, TriangulationJob, ValidationJob,
};
use codegraph::scoring::{ConfidenceScorer, EvidenceItem};
use codegraph::{hashing, queues, JobError};
use codegraph_broker::{Job, JobOptions, QueueBroker};
use codegraph_store::{queries, StagingStore};

use crate::runtime::{HandlerOutcome, JobHandler};

/// Evidence items expected when a relationship does not escalate.
const EXPECTED_DIRECT: u32 = 1;
/// Evidence items expected when a relationship escalates (initial + roles).
const EXPECTED_TRIANGULATED: u32 = 4;

/// The `relationship-resolution` consumer.
pub struct RelationshipResolutionWorker {
    store: StagingStore,
    broker: Arc<dyn QueueBroker>,
    scorer: ConfidenceScorer,
}

impl RelationshipResolutionWorker {
    #[must_use]
    pub fn new(store: StagingStore, broker: Arc<dyn QueueBroker>, scorer: ConfidenceScorer) -> Self {
        Self {
            store,
            broker,
            scorer,
        }
    }
}

#[async_trait]
impl JobHandler for RelationshipResolutionWorker {
    fn worker_type(&self) -> &'static str {
        queues::RELATIONSHIP_RESOLUTION
    }

    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let batch: RelationshipResolutionJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid resolution payload: {e}")))?;

        for resolved in batch.relationships {
            let relationship_hash = hashing::relationship_hash(
                resolved.source_poi_id,
                resolved.target_poi_id,
                &resolved.rel_type,
            );
            let score = self
                .scorer
                .score(&[EvidenceItem::uniform(resolved.confidence)]);
            let expected = if score.escalation_needed {
                EXPECTED_TRIANGULATED
            } else {
                EXPECTED_DIRECT
            };

            // Persist the PENDING row and its evidence tracking together.
            let run_id = resolved.run_id.clone();
            let hash_for_txn = relationship_hash.clone();
            let resolved_for_txn = resolved.clone();
            let relationship_id = self
                .store
                .transaction(move |tx| {
                    let id = queries::relationships::insert_pending(tx, &resolved_for_txn)?;
                    queries::evidence::ensure(tx, &run_id, &hash_for_txn, expected)?;
                    Ok(id)
                })
                .await
                .map_err(|e| JobError::retriable(format!("persist failed: {e}")))?;

            debug!(
                relationship_id,
                confidence = score.final_confidence,
                level = ?score.confidence_level,
                escalation = score.escalation_needed,
                "Scored relationship"
            );

            // Initial-analysis evidence always flows through validation.
            let validation = ValidationJob {
                run_id: resolved.run_id.clone(),
                relationship_id,
                relationship_hash: relationship_hash.clone(),
                source: EvidenceSource::InitialAnalysis.as_str().to_string(),
                confidence: score.final_confidence,
                expected_count: expected,
            };
            self.enqueue(
                queues::VALIDATION,
                serde_json::to_value(&validation)
                    .map_err(|e| JobError::permanent(e.to_string()))?,
                format!("val:{}:{}:initial", resolved.run_id, relationship_hash),
            )
            .await?;

            if score.escalation_needed {
                let triangulation = TriangulationJob {
                    run_id: resolved.run_id.clone(),
                    relationship_id,
                    initial_confidence: score.final_confidence,
                };
                self.enqueue(
                    queues::TRIANGULATED_ANALYSIS,
                    serde_json::to_value(&triangulation)
                        .map_err(|e| JobError::permanent(e.to_string()))?,
                    format!("tri:{}:{relationship_id}", resolved.run_id),
                )
                .await?;
            }
        }
        Ok(HandlerOutcome::Done)
    }
}

impl RelationshipResolutionWorker {
    /// Enqueue with an idempotency key so super-batch redelivery (the
    /// at-least-once case) cannot double-dispatch downstream work.
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        dedupe_seed: String,
    ) -> Result<(), JobError> {
        let key = hashing::sha256_hex(dedupe_seed.as_bytes());
        match self
            .broker
            .enqueue(queue, payload, JobOptions::with_idempotency_key(key))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(queue, error = %e, "Downstream enqueue failed");
                Err(JobError::retriable(format!("enqueue to {queue} failed: {e}")))
            }
        }
    }
}
