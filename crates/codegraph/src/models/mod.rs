// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The CodeGraph data model.
//!
//! Everything the staging store owns: runs, files, POIs, relationships,
//! outbox events, evidence tracking, and triangulation sessions - plus the
//! tagged job payloads that cross the queue boundary.

mod evidence;
mod file;
mod jobs;
mod outbox;
mod poi;
mod relationship;
mod triangulation;

pub use evidence::{EvidenceSource, EvidenceStatus, RelationshipEvidence};
pub use file::{FileStatus, SourceFile};
pub use jobs::{
    DirectoryAggregationJob, FileAnalysisJob, GraphIngestionJob, ReconciliationJob,
    RelationshipResolutionJob, TriangulationJob, ValidationJob,
};
pub use outbox::{EventPayload, NewOutboxEvent, OutboxEvent, OutboxStatus};
pub use poi::{Poi, PoiType};
pub use relationship::{Relationship, RelationshipCandidate, RelationshipStatus, ResolvedRelationship};
pub use triangulation::{
    AgentAnalysis, AgentRole, ConsensusDecision, FinalDecision, SessionStatus, TriangulationSession,
};

/// Mint a fresh run identifier.
///
/// A run tags every record produced by one end-to-end execution; it is
/// created at start and never mutated or deleted by the pipeline.
#[must_use]
pub fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4())
}
