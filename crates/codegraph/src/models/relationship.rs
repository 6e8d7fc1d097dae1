// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use serde::{Deserialize, Serialize};

/// Lifecycle of a relationship. Status only moves toward a terminal state:
/// `Pending` -> `Validated` -> `Reconciled`, or -> `Rejected` at any point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipStatus {
    Pending,
    Validated,
    Reconciled,
    Rejected,
}

impl RelationshipStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Validated => "VALIDATED",
            Self::Reconciled => "RECONCILED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "VALIDATED" => Some(Self::Validated),
            "RECONCILED" => Some(Self::Reconciled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// True if `next` is a legal transition from `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Validated | Self::Reconciled | Self::Rejected),
            Self::Validated => matches!(next, Self::Reconciled | Self::Rejected),
            Self::Reconciled | Self::Rejected => false,
        }
    }
}

/// A relationship candidate as the classifier reports it: endpoints are
/// POI **names or semantic ids**, not database identifiers. The outbox
/// publisher resolves them within the run before any downstream work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    /// Source endpoint: a POI name or semantic id.
    pub source: String,
    /// Target endpoint: a POI name or semantic id.
    pub target: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub file_path: String,
    /// Classifier-reported initial confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

/// A candidate whose endpoints resolved to database identifiers,
/// ready for scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedRelationship {
    pub source_poi_id: i64,
    pub target_poi_id: i64,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub file_path: String,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    pub run_id: String,
}

/// A persisted relationship row.
///
/// `confidence` is monotonic across triangulation passes: it never decreases
/// after an ACCEPT decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Option<i64>,
    pub source_poi_id: i64,
    pub target_poi_id: i64,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub file_path: String,
    pub status: RelationshipStatus,
    pub confidence: f64,
    pub reason: String,
    pub run_id: String,
    /// Accumulated evidence payloads (one entry per distinct source).
    #[serde(default)]
    pub evidence: Vec<serde_json::Value>,
}

impl Relationship {
    /// A freshly resolved relationship in `Pending` state.
    #[must_use]
    pub fn pending(resolved: &ResolvedRelationship) -> Self {
        Self {
            id: None,
            source_poi_id: resolved.source_poi_id,
            target_poi_id: resolved.target_poi_id,
            rel_type: resolved.rel_type.clone(),
            file_path: resolved.file_path.clone(),
            status: RelationshipStatus::Pending,
            confidence: resolved.confidence.clamp(0.0, 1.0),
            reason: resolved.reason.clone(),
            run_id: resolved.run_id.clone(),
            evidence: Vec::new(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            RelationshipStatus::Pending,
            RelationshipStatus::Validated,
            RelationshipStatus::Reconciled,
            RelationshipStatus::Rejected,
        ] {
            assert_eq!(RelationshipStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_states_do_not_transition() {
        assert!(!RelationshipStatus::Reconciled.can_transition_to(RelationshipStatus::Pending));
        assert!(!RelationshipStatus::Rejected.can_transition_to(RelationshipStatus::Validated));
        assert!(RelationshipStatus::Pending.can_transition_to(RelationshipStatus::Rejected));
        assert!(RelationshipStatus::Validated.can_transition_to(RelationshipStatus::Reconciled));
    }

    #[test]
    fn test_pending_clamps_confidence() {
        let resolved = ResolvedRelationship {
            source_poi_id: 1,
            target_poi_id: 2,
            rel_type: "CALLS".to_string(),
            file_path: "b.js".to_string(),
            confidence: 1.7,
            reason: String::new(),
            run_id: "run-1".to_string(),
        };
        let rel = Relationship::pending(&resolved);
        assert!((rel.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(rel.status, RelationshipStatus::Pending);
    }

    #[test]
    fn test_candidate_serde_type_tag() {
        let json = serde_json::json!({
            "source": "validateUser",
            "target": "createUser",
            "type": "CALLS",
            "file_path": "b.js",
            "confidence": 0.8
        });
        let candidate: RelationshipCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(candidate.rel_type, "CALLS");
        assert_eq!(candidate.reason, "");
    }
}
