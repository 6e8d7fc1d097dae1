// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CodeGraph Worker Pool
//!
//! System-wide resource limits with a per-stage share: a global in-flight
//! slot cap, per-worker-type concurrency, continuous token-bucket rate
//! limiting, three-state circuit breakers, adaptive scaling hints, and the
//! dependency health registry backing the health endpoint.
//!
//! The two rejection kinds are retriable by construction: a rate-limit
//! rejection carries the bucket refill time and a circuit-open rejection
//! carries the remaining reset timeout, so callers can hand either straight
//! to the broker as a retry delay.

mod circuit;
mod health;
mod pool;
mod rate_limit;
mod scaling;

pub use circuit::{CircuitBreaker, CircuitState};
pub use health::{DependencyHealth, HealthRegistry, HealthSnapshot};
pub use pool::{SlotError, SlotGuard, WorkerLimits, WorkerPool, WorkerStats};
pub use rate_limit::TokenBucket;
pub use scaling::{AdaptiveScaler, ProcProbe, ResourceProbe, ResourceSample, ScalingConfig};
