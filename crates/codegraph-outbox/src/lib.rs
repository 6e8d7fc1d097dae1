// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CodeGraph Outbox Publisher
//!
//! The strongest correctness boundary in the pipeline. The rule: **no
//! downstream job exists without its outbox rows marked PUBLISHED**, and
//! redelivery after a crash is made safe by idempotency keys derived from
//! the contributing event ids.
//!
//! One cooperative polling task per process preserves per-run FIFO order.
//! Relationship payloads reference POIs by name or semantic id; the
//! publisher resolves them to database identifiers within the run, holds
//! events whose endpoints have not arrived yet, and coalesces resolved
//! events into super-batched downstream jobs.

mod publisher;
mod resolution;
mod super_batch;

pub use publisher::{OutboxPublisher, OutboxPublisherConfig, PublisherStats, TickSummary};
pub use resolution::{resolve_candidates, ResolutionOutcome};
pub use super_batch::{coalesce, ReadyEvent, SuperBatch};
