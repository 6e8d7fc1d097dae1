// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CodeGraph Queue Broker
//!
//! Thin abstraction over durable job queues: enqueue with retry options,
//! reserve/ack/fail, scheduled delays, per-state counts, and automatic
//! dead-letter queues.
//!
//! Two implementations ship here:
//!
//! - [`RedisBroker`] - durable lists + sorted sets with Lua-scripted atomic
//!   state transitions; the production backend shared across processes.
//! - [`InMemoryBroker`] - a process-local backend with identical semantics
//!   for tests and single-process runs.
//!
//! The broker provides at-least-once delivery; idempotency keys on enqueue
//! make redelivery after a crash safe for downstream consumers.

mod broker;
mod cleanup;
mod dead_letter;
mod job;
mod memory;
mod redis_broker;

pub use broker::{BrokerError, BrokerResult, EnqueueOutcome, FailOutcome, JobState, QueueBroker, QueueCounts};
pub use cleanup::{CleanupConfig, CleanupManager, CleanupReport, EMERGENCY_DRAIN_CONFIRMATION};
pub use dead_letter::DeadLetterRecord;
pub use job::{BackoffPolicy, Job, JobOptions};
pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;
