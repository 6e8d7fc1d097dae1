// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Centralized environment variable names and typed helpers for CodeGraph.
//!
//! Every crate in the workspace reads configuration through these constants
//! so that names stay consistent across binaries and no crate grows its own
//! ad-hoc `std::env::var` strings.

// =============================================================================
// Environment Variable Name Constants
// =============================================================================

/// Redis connection string for the queue broker.
pub const REDIS_URL: &str = "REDIS_URL";
/// Path to the SQLite staging store file.
pub const SQLITE_PATH: &str = "SQLITE_PATH";
/// Bolt URI of the graph store.
pub const NEO4J_URI: &str = "NEO4J_URI";
/// Graph store username.
pub const NEO4J_USER: &str = "NEO4J_USER";
/// Graph store password.
pub const NEO4J_PASSWORD: &str = "NEO4J_PASSWORD";

/// Base URL of the external classifier (OpenAI-compatible chat endpoint).
pub const CLASSIFIER_API_URL: &str = "CLASSIFIER_API_URL";
/// API key for the external classifier.
pub const CLASSIFIER_API_KEY: &str = "CLASSIFIER_API_KEY";
/// Model name sent with classifier requests.
pub const CLASSIFIER_MODEL: &str = "CLASSIFIER_MODEL";

/// Global in-flight worker slot cap across all stages.
pub const TOTAL_WORKER_CONCURRENCY: &str = "TOTAL_WORKER_CONCURRENCY";
/// Per-stage concurrency override, e.g. `FILE_ANALYSIS_CONCURRENCY`.
/// Stage names are upper-snake forms of the queue names in [`crate::queues`].
pub const CONCURRENCY_SUFFIX: &str = "_CONCURRENCY";

/// Maximum rows the batched writer coalesces before flushing (default: 100).
pub const DB_BATCH_SIZE: &str = "DB_BATCH_SIZE";
/// Maximum milliseconds the batched writer waits before flushing (default: 1000).
pub const DB_FLUSH_INTERVAL: &str = "DB_FLUSH_INTERVAL";
/// Milliseconds between outbox poll cycles (default: 1000).
pub const OUTBOX_POLLING_INTERVAL: &str = "OUTBOX_POLLING_INTERVAL";
/// PENDING rows reserved per outbox poll cycle (default: 200).
pub const OUTBOX_BATCH_SIZE: &str = "OUTBOX_BATCH_SIZE";
/// Relationships coalesced into one downstream job (default: 1000).
pub const OUTBOX_SUPER_BATCH_SIZE: &str = "OUTBOX_SUPER_BATCH_SIZE";
/// Resolution attempts before an outbox row is marked FAILED (default: 5).
pub const MAX_RESOLUTION_ATTEMPTS: &str = "MAX_RESOLUTION_ATTEMPTS";

/// Classifier client concurrency cap per process (default: 4).
pub const LLM_MAX_CONCURRENCY: &str = "LLM_MAX_CONCURRENCY";
/// Classifier request timeout in milliseconds (default: 30000).
pub const LLM_TIMEOUT_MS: &str = "LLM_TIMEOUT_MS";
/// Classifier retry attempts for transient failures (default: 3).
pub const LLM_MAX_RETRIES: &str = "LLM_MAX_RETRIES";
/// Base delay for classifier retry backoff in milliseconds (default: 1000).
pub const LLM_RETRY_DELAY_MS: &str = "LLM_RETRY_DELAY_MS";
/// Global classifier request rate in requests per second (default: 25).
pub const API_RATE_LIMIT: &str = "API_RATE_LIMIT";

/// Confidence at or below which a relationship escalates (default: 0.45).
pub const CONFIDENCE_ESCALATION_THRESHOLD: &str = "CONFIDENCE_ESCALATION_THRESHOLD";
/// Weighted consensus at or above which triangulation accepts (default: 0.65).
pub const CONSENSUS_ACCEPT: &str = "CONSENSUS_ACCEPT";
/// Weighted consensus at or below which triangulation rejects (default: 0.35).
pub const CONSENSUS_REJECT: &str = "CONSENSUS_REJECT";
/// Minimum agreement level for a non-escalated decision (default: 0.67).
pub const AGREEMENT_MIN: &str = "AGREEMENT_MIN";

/// Triangulation coordination mode: `parallel` or `sequential`.
pub const TRIANGULATION_MODE: &str = "TRIANGULATION_MODE";
/// Concurrent agent roles in parallel mode (default: 3).
pub const MAX_PARALLEL_AGENTS: &str = "MAX_PARALLEL_AGENTS";
/// Per-agent timeout in milliseconds (default: 30000).
pub const AGENT_TIMEOUT_MS: &str = "AGENT_TIMEOUT_MS";
/// Per-session timeout in milliseconds (default: 120000).
pub const SESSION_TIMEOUT_MS: &str = "SESSION_TIMEOUT_MS";

/// Files at or below this size (bytes) are eligible for batching (default: 10240).
pub const SMALL_FILE_THRESHOLD: &str = "SMALL_FILE_THRESHOLD";
/// Maximum files per classifier batch call (default: 20).
pub const MAX_FILES_PER_BATCH: &str = "MAX_FILES_PER_BATCH";
/// Maximum cumulative characters per classifier batch call (default: 60000).
pub const MAX_BATCH_CHARS: &str = "MAX_BATCH_CHARS";
/// Milliseconds between pending-batch flusher passes (default: 4000).
pub const BATCH_FLUSH_INTERVAL_MS: &str = "BATCH_FLUSH_INTERVAL_MS";

/// Terminal jobs older than this many milliseconds are removed (default: 24h).
pub const MAX_JOB_AGE: &str = "MAX_JOB_AGE";
/// Active jobs older than this many milliseconds are failed as stuck (default: 10m).
pub const MAX_STALE_AGE: &str = "MAX_STALE_AGE";
/// Failed jobs retained per queue after cleanup (default: 1000).
pub const MAX_FAILED_JOB_RETENTION: &str = "MAX_FAILED_JOB_RETENTION";
/// Completed jobs retained per queue after cleanup (default: 100).
pub const MAX_COMPLETED_JOB_RETENTION: &str = "MAX_COMPLETED_JOB_RETENTION";

/// Health endpoint port (default: 8080; 0 disables the endpoint).
pub const HEALTH_PORT: &str = "HEALTH_PORT";
/// Grace period for in-flight jobs during shutdown, in milliseconds (default: 30000).
pub const SHUTDOWN_GRACE_MS: &str = "SHUTDOWN_GRACE_MS";
/// WAL size ceiling in bytes used by the store health check (default: 64 MiB).
pub const WAL_SIZE_LIMIT_BYTES: &str = "WAL_SIZE_LIMIT_BYTES";

// =============================================================================
// Typed helpers
// =============================================================================

/// Reads an environment variable as a string, returning `None` if unset.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Reads an environment variable as a string, returning `default` if unset.
#[must_use]
pub fn env_string_or_default(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads an environment variable as a `u64`, returning `default` if unset or invalid.
#[must_use]
pub fn env_u64_or_default(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as a `u32`, returning `default` if unset or invalid.
#[must_use]
pub fn env_u32_or_default(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as a `usize`, returning `default` if unset or invalid.
#[must_use]
pub fn env_usize_or_default(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as an `f64`, returning `default` if unset,
/// invalid, or non-finite.
#[must_use]
pub fn env_f64_or_default(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// Reads a required environment variable, returning a config error if unset.
pub fn env_required(name: &str) -> crate::Result<String> {
    std::env::var(name).map_err(|_| crate::Error::Config(format!("{name} is required")))
}
