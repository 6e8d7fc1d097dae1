// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Relationship confidence scoring.
//!
//! The scorer is a pure function over a relationship's factor evidence.
//! All persistence and escalation side effects belong to the caller.

mod scorer;
mod types;

pub use scorer::{ConfidenceScorer, ScorerConfig};
pub use types::{
    ConfidenceBreakdown, ConfidenceLevel, ConfidenceScore, EvidenceItem, Penalty,
};
