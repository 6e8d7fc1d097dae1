// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The authoritative queue registry.
//!
//! Every queue the pipeline touches is named here, once. Admin tooling and the
//! cleanup manager iterate [`ALL_QUEUES`]; nothing else in the workspace spells
//! a queue name as a string literal. Each queue has an automatically
//! provisioned `{queue}-dead-letter` companion.

/// File analysis jobs emitted by discovery.
pub const FILE_ANALYSIS: &str = "file-analysis";
/// Per-directory aggregation notifications emitted after each processed file.
pub const DIRECTORY_AGGREGATION: &str = "directory-aggregation";
/// Directory-level resolution passes (consumed by the aggregation subsystem).
pub const DIRECTORY_RESOLUTION: &str = "directory-resolution";
/// Relationship candidates published by the outbox, batched for scoring.
pub const RELATIONSHIP_RESOLUTION: &str = "relationship-resolution";
/// Evidence accumulation for scored relationships.
pub const VALIDATION: &str = "validation";
/// Finalization of fully-evidenced relationships.
pub const RECONCILIATION: &str = "reconciliation";
/// Run-wide resolution passes (consumed by the aggregation subsystem).
pub const GLOBAL_RESOLUTION: &str = "global-resolution";
/// Low-confidence relationships re-analyzed by agent roles.
pub const TRIANGULATED_ANALYSIS: &str = "triangulated-analysis";
/// Finalized POIs/relationships drained into the graph store.
pub const GRAPH_INGESTION: &str = "graph-ingestion";

/// Suffix appended to a queue name to form its dead-letter companion.
pub const DEAD_LETTER_SUFFIX: &str = "-dead-letter";

/// All pipeline queues, in data-flow order.
pub const ALL_QUEUES: &[&str] = &[
    FILE_ANALYSIS,
    DIRECTORY_AGGREGATION,
    DIRECTORY_RESOLUTION,
    RELATIONSHIP_RESOLUTION,
    VALIDATION,
    RECONCILIATION,
    GLOBAL_RESOLUTION,
    TRIANGULATED_ANALYSIS,
    GRAPH_INGESTION,
];

/// Dead-letter queue name for `queue`.
#[must_use]
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// True if `name` is a registered pipeline queue (dead-letter names excluded).
#[must_use]
pub fn is_registered(name: &str) -> bool {
    ALL_QUEUES.contains(&name)
}

/// Upper-snake form of a queue name, used to derive per-stage env vars
/// such as `FILE_ANALYSIS_CONCURRENCY`.
#[must_use]
pub fn env_prefix(queue: &str) -> String {
    queue.replace('-', "_").to_uppercase()
}
