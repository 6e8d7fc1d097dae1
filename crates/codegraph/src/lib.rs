// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CodeGraph Core
//!
//! Shared foundation for the CodeGraph analysis pipeline: the data model
//! (runs, files, POIs, relationships, outbox events, triangulation sessions),
//! environment-driven configuration, the queue registry, and the pure
//! confidence scorer.
//!
//! The pipeline itself lives in the sibling crates:
//!
//! - `codegraph-broker` - durable job queues (Redis) with dead-letter handling
//! - `codegraph-pool` - concurrency caps, rate limits, circuit breakers
//! - `codegraph-store` - SQLite staging store with a batched writer
//! - `codegraph-classifier` - the external LLM classifier client
//! - `codegraph-outbox` - the transactional outbox publisher
//! - `codegraph-graph` - property-graph ingestion target
//! - `codegraph-workers` - queue consumers and pipeline wiring

pub mod config;
pub mod env_vars;
pub mod errors;
pub mod hashing;
pub mod metrics_constants;
pub mod metrics_utils;
pub mod models;
pub mod queues;
pub mod scoring;

pub use config::PipelineConfig;
pub use errors::{Error, JobError, Result};
