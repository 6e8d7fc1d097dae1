// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph ingestion worker.
//!
//! Drains a run's POIs and RECONCILED relationships into the external
//! property graph. Upserts are keyed by `(run_id, hash)` and
//! `(run_id, source, target, type)`, so a duplicate job is a no-op by
//! design and a failed job is safely retriable.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use codegraph::models::{GraphIngestionJob, RelationshipStatus};
use codegraph::{queues, JobError};
use codegraph_broker::Job;
use codegraph_graph::GraphStore;
use codegraph_store::{queries, StagingStore};

use crate::runtime::{HandlerOutcome, JobHandler};

/// The `graph-ingestion` consumer.
pub struct GraphIngestionWorker {
    store: StagingStore,
    graph: Arc<dyn GraphStore>,
}

impl GraphIngestionWorker {
    #[must_use]
    pub fn new(store: StagingStore, graph: Arc<dyn GraphStore>) -> Self {
        Self { store, graph }
    }
}

#[async_trait]
impl JobHandler for GraphIngestionWorker {
    fn worker_type(&self) -> &'static str {
        queues::GRAPH_INGESTION
    }

    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let request: GraphIngestionJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid ingestion payload: {e}")))?;

        let run_id = request.run_id.clone();
        let run_for_query = run_id.clone();
        let (pois, relationships) = self
            .store
            .with_conn(move |conn| {
                let pois = queries::pois::by_run(conn, &run_for_query)?;
                let relationships = queries::relationships::by_run_and_status(
                    conn,
                    &run_for_query,
                    RelationshipStatus::Reconciled,
                )?;
                Ok((pois, relationships))
            })
            .await
            .map_err(|e| JobError::retriable(format!("finalized-set read: {e}")))?;

        // Graph-store failures (deadlocks, connection drops) are transient.
        self.graph
            .upsert_nodes(&run_id, &pois)
            .await
            .map_err(|e| JobError::retriable(format!("node upsert: {e}")))?;
        self.graph
            .upsert_edges(&run_id, &relationships)
            .await
            .map_err(|e| JobError::retriable(format!("edge upsert: {e}")))?;

        info!(
            run_id = %run_id,
            nodes = pois.len(),
            edges = relationships.len(),
            "Run ingested into graph store"
        );
        Ok(HandlerOutcome::Done)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use codegraph::models::{Poi, PoiType, ResolvedRelationship};
    use codegraph_broker::JobOptions;
    use codegraph_graph::InMemoryGraphStore;

    async fn fixture() -> (GraphIngestionWorker, Arc<InMemoryGraphStore>, StagingStore) {
        let store = StagingStore::open_in_memory().await.unwrap();
        let graph = Arc::new(InMemoryGraphStore::new());
        let worker = GraphIngestionWorker::new(store.clone(), Arc::clone(&graph) as Arc<dyn GraphStore>);
        (worker, graph, store)
    }

    fn ingestion_job() -> Job {
        Job::new(
            queues::GRAPH_INGESTION,
            serde_json::to_value(GraphIngestionJob {
                run_id: "run-1".to_string(),
            })
            .unwrap(),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_ingests_only_reconciled_relationships() {
        let (worker, graph, store) = fixture().await;
        store
            .transaction(|tx| {
                queries::runs::ensure(tx, "run-1")?;
                queries::pois::insert_batch(
                    tx,
                    &[
                        Poi::from_classifier("a.js", "a", PoiType::FunctionDefinition, 1, 2, true, "run-1"),
                        Poi::from_classifier("b.js", "b", PoiType::FunctionDefinition, 1, 2, true, "run-1"),
                        Poi::from_classifier("c.js", "c", PoiType::FunctionDefinition, 1, 2, true, "run-1"),
                    ],
                )?;
                let a = queries::pois::resolve_id(tx, "run-1", "a")?.unwrap_or(1);
                let b = queries::pois::resolve_id(tx, "run-1", "b")?.unwrap_or(2);
                let c = queries::pois::resolve_id(tx, "run-1", "c")?.unwrap_or(3);
                let reconciled = queries::relationships::insert_pending(
                    tx,
                    &ResolvedRelationship {
                        source_poi_id: b,
                        target_poi_id: a,
                        rel_type: "CALLS".to_string(),
                        file_path: "b.js".to_string(),
                        confidence: 0.9,
                        reason: String::new(),
                        run_id: "run-1".to_string(),
                    },
                )?;
                queries::relationships::set_status(
                    tx,
                    reconciled,
                    RelationshipStatus::Reconciled,
                )?;
                // A rejected sibling must not be ingested.
                let rejected = queries::relationships::insert_pending(
                    tx,
                    &ResolvedRelationship {
                        source_poi_id: c,
                        target_poi_id: a,
                        rel_type: "CALLS".to_string(),
                        file_path: "c.js".to_string(),
                        confidence: 0.1,
                        reason: String::new(),
                        run_id: "run-1".to_string(),
                    },
                )?;
                queries::relationships::set_status(tx, rejected, RelationshipStatus::Rejected)?;
                Ok(())
            })
            .await
            .unwrap();

        worker.handle(&ingestion_job()).await.unwrap();

        assert_eq!(graph.node_count("run-1"), 3);
        assert_eq!(graph.edge_count("run-1"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_job_is_a_no_op() {
        let (worker, graph, store) = fixture().await;
        store
            .transaction(|tx| {
                queries::runs::ensure(tx, "run-1")?;
                queries::pois::insert_batch(
                    tx,
                    &[Poi::from_classifier("a.js", "a", PoiType::FunctionDefinition, 1, 2, true, "run-1")],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        worker.handle(&ingestion_job()).await.unwrap();
        worker.handle(&ingestion_job()).await.unwrap();
        assert_eq!(graph.node_count("run-1"), 1);
    }
}
