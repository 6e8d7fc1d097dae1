// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Super-batching: coalesce resolved relationship events into as few
//! downstream jobs as possible to amortize dispatch.
//!
//! Events are atomic units - all of an event's relationships land in the
//! same batch, so marking events PUBLISHED per batch is exact. Batches
//! never mix runs, and id order is preserved within a run.

use codegraph::models::ResolvedRelationship;

/// One fully resolved outbox event.
#[derive(Debug, Clone)]
pub struct ReadyEvent {
    pub event_id: i64,
    pub run_id: String,
    pub relationships: Vec<ResolvedRelationship>,
}

/// One downstream job's worth of relationships.
#[derive(Debug, Clone)]
pub struct SuperBatch {
    pub run_id: String,
    /// Contributing outbox event ids, ascending.
    pub event_ids: Vec<i64>,
    pub relationships: Vec<ResolvedRelationship>,
}

/// Coalesce ready events into batches of at most `max_relationships` each.
/// An event larger than the cap still ships (as its own batch) rather than
/// being split or stuck.
#[must_use]
pub fn coalesce(mut ready: Vec<ReadyEvent>, max_relationships: usize) -> Vec<SuperBatch> {
    let cap = max_relationships.max(1);
    ready.sort_by_key(|event| event.event_id);

    let mut batches: Vec<SuperBatch> = Vec::new();
    for event in ready {
        let fits = batches.last().is_some_and(|batch| {
            batch.run_id == event.run_id
                && batch.relationships.len() + event.relationships.len() <= cap
        });
        if fits {
            #[allow(clippy::expect_used)] // is_some_and above guarantees a last batch
            let batch = batches.last_mut().expect("batch exists");
            batch.event_ids.push(event.event_id);
            batch.relationships.extend(event.relationships);
        } else {
            batches.push(SuperBatch {
                run_id: event.run_id,
                event_ids: vec![event.event_id],
                relationships: event.relationships,
            });
        }
    }
    batches
}
