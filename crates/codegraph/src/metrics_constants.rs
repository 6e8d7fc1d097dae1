// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Prometheus metric name constants for the CodeGraph pipeline.
//!
//! All metric names are defined here to prevent duplication and typos.
//! Naming follows Prometheus conventions: counters end in `_total`,
//! histograms carry a unit suffix, gauges carry neither.

// ============================================================================
// Counter Metrics (_total suffix)
// ============================================================================

/// Total jobs enqueued, labeled by queue.
pub const METRIC_JOBS_ENQUEUED_TOTAL: &str = "codegraph_jobs_enqueued_total";
/// Total jobs completed, labeled by queue.
pub const METRIC_JOBS_COMPLETED_TOTAL: &str = "codegraph_jobs_completed_total";
/// Total jobs failed (after retries), labeled by queue.
pub const METRIC_JOBS_FAILED_TOTAL: &str = "codegraph_jobs_failed_total";
/// Total jobs retried, labeled by queue.
pub const METRIC_JOBS_RETRIED_TOTAL: &str = "codegraph_jobs_retried_total";
/// Total jobs moved to a dead-letter queue, labeled by queue.
pub const METRIC_JOBS_DEAD_LETTERED_TOTAL: &str = "codegraph_jobs_dead_lettered_total";
/// Total duplicate enqueues rejected by idempotency key, labeled by queue.
pub const METRIC_JOBS_DEDUPLICATED_TOTAL: &str = "codegraph_jobs_deduplicated_total";

/// Total slot requests rejected by the rate limiter, labeled by worker type.
pub const METRIC_SLOTS_RATE_LIMITED_TOTAL: &str = "codegraph_slots_rate_limited_total";
/// Total slot requests rejected by an open circuit, labeled by worker type.
pub const METRIC_SLOTS_CIRCUIT_OPEN_TOTAL: &str = "codegraph_slots_circuit_open_total";
/// Total slots granted, labeled by worker type.
pub const METRIC_SLOTS_GRANTED_TOTAL: &str = "codegraph_slots_granted_total";

/// Total classifier requests, labeled by kind (single/batch/role).
pub const METRIC_CLASSIFIER_REQUESTS_TOTAL: &str = "codegraph_classifier_requests_total";
/// Total classifier request retries.
pub const METRIC_CLASSIFIER_RETRIES_TOTAL: &str = "codegraph_classifier_retries_total";
/// Total classifier failures after all retries.
pub const METRIC_CLASSIFIER_FAILURES_TOTAL: &str = "codegraph_classifier_failures_total";

/// Total outbox events published.
pub const METRIC_OUTBOX_PUBLISHED_TOTAL: &str = "codegraph_outbox_published_total";
/// Total outbox events held for later resolution.
pub const METRIC_OUTBOX_HELD_TOTAL: &str = "codegraph_outbox_held_total";
/// Total outbox events failed after exhausting resolution attempts.
pub const METRIC_OUTBOX_FAILED_TOTAL: &str = "codegraph_outbox_failed_total";

/// Total files analyzed through a batched classifier call.
pub const METRIC_FILES_BATCHED_TOTAL: &str = "codegraph_files_batched_total";
/// Total files analyzed through the single-file path (including fallbacks).
pub const METRIC_FILES_INDIVIDUAL_TOTAL: &str = "codegraph_files_individual_total";
/// Total batches that fell back to per-file processing.
pub const METRIC_BATCH_FALLBACKS_TOTAL: &str = "codegraph_batch_fallbacks_total";

/// Total triangulation decisions, labeled by decision (accept/reject/escalate).
pub const METRIC_TRIANGULATION_DECISIONS_TOTAL: &str = "codegraph_triangulation_decisions_total";

/// Total batched-writer flushes.
pub const METRIC_WRITER_FLUSHES_TOTAL: &str = "codegraph_writer_flushes_total";

// ============================================================================
// Histogram Metrics (unit suffix)
// ============================================================================

/// Job handler duration, labeled by queue.
pub const METRIC_JOB_DURATION_MS: &str = "codegraph_job_duration_ms";
/// Classifier round-trip latency, labeled by kind.
pub const METRIC_CLASSIFIER_LATENCY_MS: &str = "codegraph_classifier_latency_ms";
/// Rows written per batched-writer flush.
pub const METRIC_WRITER_FLUSH_ROWS_COUNT: &str = "codegraph_writer_flush_rows_count";

// ============================================================================
// Gauge Metrics
// ============================================================================

/// In-flight worker slots across all stages.
pub const METRIC_SLOTS_IN_FLIGHT: &str = "codegraph_slots_in_flight";
