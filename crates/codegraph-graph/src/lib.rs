// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CodeGraph Graph Store
//!
//! Generic interface for the downstream property-graph database. Nodes are
//! POIs keyed by `(run_id, hash)`; edges are relationships keyed by
//! `(run_id, source, target, type)`. Every upsert is idempotent by those
//! keys, so redelivered ingestion jobs are no-ops by design.

mod memory;
mod neo4j;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryGraphStore;
pub use neo4j::{Neo4jConfig, Neo4jGraphStore};

use codegraph::models::{Poi, Relationship};

/// Error types for graph store operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GraphError {
    /// Connection failure (retriable)
    #[error("Graph connection error: {0}")]
    Connection(String),

    /// Query failure (deadlocks are retriable; the caller classifies)
    #[error("Graph query error: {0}")]
    Query(String),

    /// Bad input (missing ids on supposedly finalized rows)
    #[error("Graph input error: {0}")]
    Input(String),
}

/// Generic interface for graph databases.
///
/// # Security Note
///
/// Make sure database credentials are narrowly scoped: ingestion only
/// needs MERGE rights on the run-tagged subgraph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert POIs as nodes. Returns the number of nodes newly created
    /// (existing nodes are matched, not duplicated).
    async fn upsert_nodes(&self, run_id: &str, pois: &[Poi]) -> Result<u64, GraphError>;

    /// Upsert relationships as edges. Returns the number of edges newly
    /// created.
    async fn upsert_edges(
        &self,
        run_id: &str,
        relationships: &[Relationship],
    ) -> Result<u64, GraphError>;

    /// Cheap connectivity check.
    async fn health_check(&self) -> Result<(), GraphError>;
}
