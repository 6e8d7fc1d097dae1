// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Job payloads that cross the queue boundary.
//!
//! Payloads are opaque JSON to the broker; workers validate them against
//! these types at reserve time. A payload that fails validation is a
//! permanent failure (dead-lettered), never a retry.

use serde::{Deserialize, Serialize};

use super::ResolvedRelationship;

/// One file to analyze. Emitted by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnalysisJob {
    pub file_path: String,
    pub run_id: String,
    pub job_id: String,
}

impl FileAnalysisJob {
    #[must_use]
    pub fn new(file_path: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            run_id: run_id.into(),
            job_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Notification that a file under `directory` finished analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryAggregationJob {
    pub directory: String,
    pub run_id: String,
}

/// A super-batch of resolved relationship candidates awaiting scoring.
/// Carries the idempotency key derived from its outbox events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipResolutionJob {
    pub run_id: String,
    pub relationships: Vec<ResolvedRelationship>,
    pub idempotency_key: String,
}

/// One evidence item for one relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationJob {
    pub run_id: String,
    pub relationship_id: i64,
    pub relationship_hash: String,
    /// Storage form of [`super::EvidenceSource`].
    pub source: String,
    pub confidence: f64,
    /// Distinct evidence sources expected before reconciliation.
    pub expected_count: u32,
}

/// Finalize one fully-evidenced relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationJob {
    pub run_id: String,
    pub relationship_id: i64,
    pub relationship_hash: String,
}

/// Re-analyze one low-confidence relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangulationJob {
    pub run_id: String,
    pub relationship_id: i64,
    pub initial_confidence: f64,
}

/// Drain a run's finalized POIs and relationships into the graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphIngestionJob {
    pub run_id: String,
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_analysis_job_gets_unique_id() {
        let a = FileAnalysisJob::new("a.js", "run-1");
        let b = FileAnalysisJob::new("a.js", "run-1");
        assert_ne!(a.job_id, b.job_id);
    }

    #[test]
    fn test_payload_round_trip() {
        let job = ValidationJob {
            run_id: "run-1".to_string(),
            relationship_id: 7,
            relationship_hash: "abc".to_string(),
            source: "initial_analysis".to_string(),
            confidence: 0.8,
            expected_count: 2,
        };
        let value = serde_json::to_value(&job).unwrap();
        let parsed: ValidationJob = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.relationship_id, 7);
        assert_eq!(parsed.expected_count, 2);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let value = serde_json::json!({ "run_id": "run-1" });
        assert!(serde_json::from_value::<ValidationJob>(value).is_err());
    }
}
