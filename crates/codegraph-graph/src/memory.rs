// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-memory graph store for tests and single-process runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use codegraph::models::{Poi, Relationship};

use crate::{GraphError, GraphStore};

type NodeKey = (String, String); // (run_id, hash)
type EdgeKey = (String, i64, i64, String); // (run_id, source, target, type)

/// Process-local [`GraphStore`].
#[derive(Default)]
pub struct InMemoryGraphStore {
    nodes: Mutex<HashMap<NodeKey, Poi>>,
    edges: Mutex<HashSet<EdgeKey>>,
}

impl InMemoryGraphStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Node count for a run.
    #[must_use]
    pub fn node_count(&self, run_id: &str) -> usize {
        self.nodes.lock().keys().filter(|(r, _)| r == run_id).count()
    }

    /// Edge count for a run.
    #[must_use]
    pub fn edge_count(&self, run_id: &str) -> usize {
        self.edges
            .lock()
            .iter()
            .filter(|(r, _, _, _)| r == run_id)
            .count()
    }

    /// True if the edge exists.
    #[must_use]
    pub fn has_edge(&self, run_id: &str, source: i64, target: i64, rel_type: &str) -> bool {
        self.edges.lock().contains(&(
            run_id.to_string(),
            source,
            target,
            rel_type.to_string(),
        ))
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_nodes(&self, run_id: &str, pois: &[Poi]) -> Result<u64, GraphError> {
        let mut nodes = self.nodes.lock();
        let mut created = 0;
        for poi in pois {
            let key = (run_id.to_string(), poi.hash.clone());
            if nodes.insert(key, poi.clone()).is_none() {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn upsert_edges(
        &self,
        run_id: &str,
        relationships: &[Relationship],
    ) -> Result<u64, GraphError> {
        let mut edges = self.edges.lock();
        let mut created = 0;
        for rel in relationships {
            let key = (
                run_id.to_string(),
                rel.source_poi_id,
                rel.target_poi_id,
                rel.rel_type.clone(),
            );
            if edges.insert(key) {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn health_check(&self) -> Result<(), GraphError> {
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use codegraph::models::{PoiType, RelationshipStatus};

    fn poi(name: &str) -> Poi {
        Poi::from_classifier("a.js", name, PoiType::FunctionDefinition, 1, 2, true, "run-1")
    }

    fn relationship(source: i64, target: i64) -> Relationship {
        Relationship {
            id: Some(1),
            source_poi_id: source,
            target_poi_id: target,
            rel_type: "CALLS".to_string(),
            file_path: "a.js".to_string(),
            status: RelationshipStatus::Reconciled,
            confidence: 0.9,
            reason: String::new(),
            run_id: "run-1".to_string(),
            evidence: vec![],
        }
    }

    #[tokio::test]
    async fn test_upserts_are_idempotent() {
        let store = InMemoryGraphStore::new();
        let pois = vec![poi("a"), poi("b")];
        assert_eq!(store.upsert_nodes("run-1", &pois).await.unwrap(), 2);
        assert_eq!(store.upsert_nodes("run-1", &pois).await.unwrap(), 0);
        assert_eq!(store.node_count("run-1"), 2);

        let rels = vec![relationship(1, 2)];
        assert_eq!(store.upsert_edges("run-1", &rels).await.unwrap(), 1);
        assert_eq!(store.upsert_edges("run-1", &rels).await.unwrap(), 0);
        assert!(store.has_edge("run-1", 1, 2, "CALLS"));
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let store = InMemoryGraphStore::new();
        store.upsert_nodes("run-1", &[poi("a")]).await.unwrap();
        store.upsert_nodes("run-2", &[poi("a")]).await.unwrap();
        assert_eq!(store.node_count("run-1"), 1);
        assert_eq!(store.node_count("run-2"), 1);
    }
}
