// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use serde::{Deserialize, Serialize};

/// Triangulation session lifecycle:
/// `Pending` -> `InProgress` -> `Completed` | `Failed`. Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True if `next` is a legal transition from `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::InProgress | Self::Failed),
            Self::InProgress => matches!(next, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }
}

/// The three agent roles that re-analyze a low-confidence relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Syntactic,
    Semantic,
    Contextual,
}

impl AgentRole {
    /// All roles in dispatch order.
    pub const ALL: [Self; 3] = [Self::Syntactic, Self::Semantic, Self::Contextual];

    /// Consensus weight for this role.
    #[must_use]
    pub fn weight(self) -> f64 {
        match self {
            Self::Syntactic => 0.35,
            Self::Semantic => 0.40,
            Self::Contextual => 0.25,
        }
    }

    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntactic => "syntactic",
            Self::Semantic => "semantic",
            Self::Contextual => "contextual",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "syntactic" => Some(Self::Syntactic),
            "semantic" => Some(Self::Semantic),
            "contextual" => Some(Self::Contextual),
            _ => None,
        }
    }
}

/// Final triangulation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalDecision {
    Accept,
    Reject,
    Escalate,
}

impl FinalDecision {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
            Self::Escalate => "ESCALATE",
        }
    }
}

/// One triangulated re-analysis of a relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangulationSession {
    pub session_id: String,
    pub relationship_id: i64,
    pub run_id: String,
    pub status: SessionStatus,
    pub initial_confidence: f64,
    pub final_confidence: Option<f64>,
    pub consensus_score: Option<f64>,
    pub escalated_to_human: bool,
}

impl TriangulationSession {
    /// A fresh session in `Pending` state.
    #[must_use]
    pub fn pending(relationship_id: i64, run_id: impl Into<String>, initial_confidence: f64) -> Self {
        Self {
            session_id: format!("tri-{}", uuid::Uuid::new_v4()),
            relationship_id,
            run_id: run_id.into(),
            status: SessionStatus::Pending,
            initial_confidence,
            final_confidence: None,
            consensus_score: None,
            escalated_to_human: false,
        }
    }
}

/// One agent role's verdict within a session. Exactly one row per
/// `(session_id, agent_type)` once completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAnalysis {
    pub session_id: String,
    pub agent_type: AgentRole,
    pub confidence_score: f64,
    pub evidence_strength: f64,
    pub reasoning: String,
}

/// The combined verdict for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub session_id: String,
    pub weighted_consensus: f64,
    pub agreement_level: f64,
    pub final_decision: FinalDecision,
    pub requires_human_review: bool,
}
