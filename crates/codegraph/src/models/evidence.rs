// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use serde::{Deserialize, Serialize};

/// Where a piece of relationship evidence came from. One evidence item is
/// accumulated per distinct source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    /// The initial analysis pass that produced the candidate.
    InitialAnalysis,
    /// A triangulation agent role.
    SyntacticAgent,
    SemanticAgent,
    ContextualAgent,
    /// Corroboration found while analyzing a different file.
    CrossFile,
}

impl EvidenceSource {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialAnalysis => "initial_analysis",
            Self::SyntacticAgent => "syntactic_agent",
            Self::SemanticAgent => "semantic_agent",
            Self::ContextualAgent => "contextual_agent",
            Self::CrossFile => "cross_file",
        }
    }
}

/// Evidence tracking status. `evidence_count` may only reach
/// `expected_count` at the `Completed` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceStatus {
    Pending,
    Completed,
}

impl EvidenceStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Aggregated evidence for one relationship, keyed by
/// `(run_id, relationship_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipEvidence {
    pub run_id: String,
    pub relationship_hash: String,
    pub evidence_count: u32,
    pub expected_count: u32,
    pub total_confidence: f64,
    pub avg_confidence: f64,
    pub status: EvidenceStatus,
}

impl RelationshipEvidence {
    /// Fresh tracking row expecting `expected_count` evidence items.
    #[must_use]
    pub fn new(run_id: impl Into<String>, relationship_hash: impl Into<String>, expected_count: u32) -> Self {
        Self {
            run_id: run_id.into(),
            relationship_hash: relationship_hash.into(),
            evidence_count: 0,
            expected_count: expected_count.max(1),
            total_confidence: 0.0,
            avg_confidence: 0.0,
            status: EvidenceStatus::Pending,
        }
    }

    /// Fold in one evidence item, completing the row when the expected
    /// count is reached. Returns true on the `Completed` transition.
    pub fn accumulate(&mut self, confidence: f64) -> bool {
        if self.status == EvidenceStatus::Completed {
            return false;
        }
        self.evidence_count += 1;
        self.total_confidence += confidence.clamp(0.0, 1.0);
        self.avg_confidence = self.total_confidence / f64::from(self.evidence_count);
        if self.evidence_count >= self.expected_count {
            self.status = EvidenceStatus::Completed;
            return true;
        }
        false
    }
}
