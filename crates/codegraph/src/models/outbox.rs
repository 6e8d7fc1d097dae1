// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Poi, RelationshipCandidate};

/// Lifecycle of an outbox event. Once `Published`, a row never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PUBLISHED" => Some(Self::Published),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Typed outbox payload, tagged by event type at the serialization boundary.
///
/// Two event types drive downstream work. A finding may carry relationship
/// candidates alongside its POIs; the publisher persists the POIs first and
/// then treats the candidates exactly like a relationship-creation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "kebab-case")]
pub enum EventPayload {
    /// POIs (and optionally relationship candidates) discovered for one file.
    FileAnalysisFinding {
        run_id: String,
        file_path: String,
        pois: Vec<Poi>,
        #[serde(default)]
        relationships: Vec<RelationshipCandidate>,
    },
    /// Relationship candidates referencing POIs by name or semantic id.
    RelationshipCreation {
        run_id: String,
        file_path: String,
        relationships: Vec<RelationshipCandidate>,
    },
}

impl EventPayload {
    /// The event-type tag as stored in the `event_type` column.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::FileAnalysisFinding { .. } => "file-analysis-finding",
            Self::RelationshipCreation { .. } => "relationship-creation",
        }
    }

    /// The run this payload belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::FileAnalysisFinding { run_id, .. } | Self::RelationshipCreation { run_id, .. } => {
                run_id
            }
        }
    }
}

/// An outbox row not yet persisted.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub run_id: String,
    pub payload: EventPayload,
}

impl NewOutboxEvent {
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            run_id: payload.run_id().to_string(),
            payload,
        }
    }
}

/// A persisted outbox row. FIFO per `run_id` by ascending `id`.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: i64,
    pub run_id: String,
    pub event_type: String,
    pub payload: EventPayload,
    pub status: OutboxStatus,
    /// Resolution attempts consumed so far (relationship events only).
    pub resolution_attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PoiType;

    #[test]
    fn test_payload_tagging() {
        let payload = EventPayload::FileAnalysisFinding {
            run_id: "run-1".to_string(),
            file_path: "a.js".to_string(),
            pois: vec![Poi::from_classifier(
                "a.js",
                "createUser",
                PoiType::FunctionDefinition,
                1,
                5,
                true,
                "run-1",
            )],
            relationships: Vec::new(),
        };
        assert_eq!(payload.event_type(), "file-analysis-finding");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event_type"], "file-analysis-finding");

        let parsed: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.run_id(), "run-1");
    }

    #[test]
    fn test_finding_relationships_default_empty() {
        let json = serde_json::json!({
            "event_type": "file-analysis-finding",
            "run_id": "run-1",
            "file_path": "a.js",
            "pois": []
        });
        let payload: EventPayload = serde_json::from_value(json).unwrap();
        match payload {
            EventPayload::FileAnalysisFinding { relationships, .. } => {
                assert!(relationships.is_empty());
            }
            EventPayload::RelationshipCreation { .. } => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [OutboxStatus::Pending, OutboxStatus::Published, OutboxStatus::Failed] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
    }
}
