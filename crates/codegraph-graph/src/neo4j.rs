// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Neo4j-backed graph store.
//!
//! Uses Cypher `MERGE` keyed on `(run_id, hash)` for nodes and
//! `(run_id, source, target, type)` for edges, so replayed ingestion jobs
//! match existing elements instead of creating duplicates.

use async_trait::async_trait;
use neo4rs::{Graph, Query};
use tracing::debug;

use codegraph::models::{Poi, Relationship};

use crate::{GraphError, GraphStore};

/// Connection settings.
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Neo4j [`GraphStore`].
pub struct Neo4jGraphStore {
    graph: Graph,
}

impl Neo4jGraphStore {
    /// Connect to the database.
    pub async fn connect(config: &Neo4jConfig) -> Result<Self, GraphError> {
        let graph = Graph::new(&config.uri, &config.user, &config.password)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;
        Ok(Self { graph })
    }

    async fn run(&self, query: Query) -> Result<(), GraphError> {
        self.graph
            .run(query)
            .await
            .map_err(|e| GraphError::Query(e.to_string()))
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn upsert_nodes(&self, run_id: &str, pois: &[Poi]) -> Result<u64, GraphError> {
        for poi in pois {
            let poi_id = poi.id.ok_or_else(|| {
                GraphError::Input(format!("POI {} has no staging id", poi.semantic_id))
            })?;
            // MERGE on the run-scoped dedup key; poi_id links edges back to
            // staging identifiers.
            let query = Query::new(
                "MERGE (p:Poi {run_id: $run_id, hash: $hash})
                 SET p.poi_id = $poi_id,
                     p.name = $name,
                     p.type = $type,
                     p.file_path = $file_path,
                     p.start_line = $start_line,
                     p.end_line = $end_line,
                     p.is_exported = $is_exported,
                     p.semantic_id = $semantic_id"
                    .to_string(),
            )
            .param("run_id", run_id)
            .param("hash", poi.hash.clone())
            .param("poi_id", poi_id)
            .param("name", poi.name.clone())
            .param("type", poi.poi_type.as_str().to_string())
            .param("file_path", poi.file_path.clone())
            .param("start_line", i64::from(poi.start_line))
            .param("end_line", i64::from(poi.end_line))
            .param("is_exported", poi.is_exported)
            .param("semantic_id", poi.semantic_id.clone());
            self.run(query).await?;
        }
        debug!(run_id, nodes = pois.len(), "Upserted POI nodes");
        // MERGE makes "newly created" unobservable without a second query;
        // report the batch size (callers treat this as "processed").
        Ok(pois.len() as u64)
    }

    async fn upsert_edges(
        &self,
        run_id: &str,
        relationships: &[Relationship],
    ) -> Result<u64, GraphError> {
        for rel in relationships {
            if rel.id.is_none() {
                return Err(GraphError::Input(format!(
                    "relationship {} -> {} has no id",
                    rel.source_poi_id, rel.target_poi_id
                )));
            }
            let query = Query::new(
                "MATCH (s:Poi {run_id: $run_id}), (t:Poi {run_id: $run_id})
                 WHERE s.poi_id = $source AND t.poi_id = $target
                 MERGE (s)-[r:RELATES {run_id: $run_id, type: $type}]->(t)
                 SET r.confidence = $confidence, r.status = $status"
                    .to_string(),
            )
            .param("run_id", run_id)
            .param("source", rel.source_poi_id)
            .param("target", rel.target_poi_id)
            .param("type", rel.rel_type.clone())
            .param("confidence", rel.confidence)
            .param("status", rel.status.as_str());
            self.run(query).await?;
        }
        debug!(run_id, edges = relationships.len(), "Upserted relationship edges");
        Ok(relationships.len() as u64)
    }

    async fn health_check(&self) -> Result<(), GraphError> {
        self.run(Query::new("RETURN 1".to_string())).await
    }
}
