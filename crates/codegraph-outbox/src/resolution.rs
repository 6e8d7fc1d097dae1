// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! POI reference resolution.
//!
//! Relationship candidates reference endpoints by name or semantic id. An
//! unresolved endpoint is not an error: the target POI legitimately arrives
//! in a later file's event, so the caller holds the event and retries.

use rusqlite::Connection;

use codegraph::models::{RelationshipCandidate, ResolvedRelationship};
use codegraph_store::{queries, StoreResult};

/// Outcome of resolving one event's candidates.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    /// Candidates whose both endpoints resolved.
    pub resolved: Vec<ResolvedRelationship>,
    /// References that did not resolve (named for the diagnostic).
    pub unresolved: Vec<String>,
}

impl ResolutionOutcome {
    /// True when every candidate resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Resolve every candidate against the run's POI table.
///
/// All-or-nothing per event: if any endpoint is missing the event is held,
/// so partially published events never exist.
pub fn resolve_candidates(
    conn: &Connection,
    run_id: &str,
    candidates: &[RelationshipCandidate],
) -> StoreResult<ResolutionOutcome> {
    let mut outcome = ResolutionOutcome::default();
    for candidate in candidates {
        let source = queries::pois::resolve_id(conn, run_id, &candidate.source)?;
        let target = queries::pois::resolve_id(conn, run_id, &candidate.target)?;
        match (source, target) {
            (Some(source_poi_id), Some(target_poi_id)) => {
                outcome.resolved.push(ResolvedRelationship {
                    source_poi_id,
                    target_poi_id,
                    rel_type: candidate.rel_type.clone(),
                    file_path: candidate.file_path.clone(),
                    confidence: candidate.confidence.clamp(0.0, 1.0),
                    reason: candidate.reason.clone(),
                    run_id: run_id.to_string(),
                });
            }
            (source, target) => {
                if source.is_none() {
                    outcome.unresolved.push(candidate.source.clone());
                }
                if target.is_none() {
                    outcome.unresolved.push(candidate.target.clone());
                }
            }
        }
    }
    Ok(outcome)
}
