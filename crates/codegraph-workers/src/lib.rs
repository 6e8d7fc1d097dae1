// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CodeGraph Workers
//!
//! The queue consumers that make up the pipeline, plus the runtime that
//! drives them: each consumer is a long-lived task that reserves a job,
//! requests an admission slot from the worker pool, runs the handler, and
//! acks or fails the job. Rejections from the pool (rate limit, open
//! circuit) go back to the broker as retriable failures carrying the exact
//! wait.
//!
//! Data flow: `file-analysis` -> staging store + outbox ->
//! `relationship-resolution` (scoring) -> `triangulated-analysis` for
//! low-confidence candidates -> `validation` -> `reconciliation` ->
//! `graph-ingestion`.

pub mod file_analysis;
pub mod graph_ingestion;
pub mod pipeline;
pub mod reconciliation;
pub mod relationship_resolution;
pub mod runtime;
pub mod triangulation;
pub mod validation;

pub use runtime::{run_consumer, HandlerOutcome, JobHandler};
