// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Pipeline configuration assembled once at startup.
//!
//! All knobs are environment-driven (names in [`crate::env_vars`]) with the
//! defaults from the pipeline design. The struct is built at process start
//! and passed explicitly to every service; there is no module-level mutable
//! state.

use std::collections::HashMap;
use std::time::Duration;

use crate::env_vars::{self, env_f64_or_default, env_string, env_u32_or_default, env_u64_or_default, env_usize_or_default};
use crate::queues;

/// Triangulation coordination mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangulationMode {
    /// Roles run concurrently up to `max_parallel_agents`.
    Parallel,
    /// Roles run one after another, each seeing the previous role's output.
    Sequential,
}

/// Every tunable the pipeline reads, resolved from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Connections
    pub redis_url: String,
    pub sqlite_path: String,
    pub neo4j_uri: Option<String>,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub classifier_api_url: Option<String>,
    pub classifier_api_key: String,
    pub classifier_model: String,

    // Concurrency
    pub total_worker_concurrency: usize,
    pub stage_concurrency: HashMap<String, usize>,

    // Batched writer / outbox
    pub db_batch_size: usize,
    pub db_flush_interval: Duration,
    pub outbox_polling_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_super_batch_size: usize,
    pub max_resolution_attempts: u32,

    // Classifier client
    pub llm_max_concurrency: usize,
    pub llm_timeout: Duration,
    pub llm_max_retries: u32,
    pub llm_retry_delay: Duration,
    pub api_rate_limit: f64,

    // Thresholds
    pub escalation_threshold: f64,
    pub consensus_accept: f64,
    pub consensus_reject: f64,
    pub agreement_min: f64,

    // Triangulation
    pub triangulation_mode: TriangulationMode,
    pub max_parallel_agents: usize,
    pub agent_timeout: Duration,
    pub session_timeout: Duration,

    // File batching
    pub small_file_threshold: u64,
    pub max_files_per_batch: usize,
    pub max_batch_chars: usize,
    pub batch_flush_interval: Duration,
    pub max_input_chars: usize,

    // Cleanup
    pub max_job_age: Duration,
    pub max_stale_age: Duration,
    pub max_failed_job_retention: usize,
    pub max_completed_job_retention: usize,

    // Process
    pub health_port: u16,
    pub shutdown_grace: Duration,
    pub wal_size_limit_bytes: u64,
}

impl PipelineConfig {
    /// Resolve configuration from the environment.
    ///
    /// Connection strings default to local development endpoints; everything
    /// else defaults to the documented pipeline values. Missing credentials
    /// are only an error at the point a component actually dials out, so a
    /// test process can build a config without a live stack.
    #[must_use]
    pub fn from_env() -> Self {
        let mut stage_concurrency = HashMap::new();
        for queue in queues::ALL_QUEUES {
            let var = format!("{}{}", queues::env_prefix(queue), env_vars::CONCURRENCY_SUFFIX);
            if let Some(n) = env_string(&var).and_then(|v| v.parse::<usize>().ok()) {
                stage_concurrency.insert((*queue).to_string(), n.max(1));
            }
        }

        Self {
            redis_url: env_vars::env_string_or_default(env_vars::REDIS_URL, "redis://127.0.0.1:6379"),
            sqlite_path: env_vars::env_string_or_default(env_vars::SQLITE_PATH, "codegraph.db"),
            neo4j_uri: env_string(env_vars::NEO4J_URI),
            neo4j_user: env_vars::env_string_or_default(env_vars::NEO4J_USER, "neo4j"),
            neo4j_password: env_vars::env_string_or_default(env_vars::NEO4J_PASSWORD, ""),
            classifier_api_url: env_string(env_vars::CLASSIFIER_API_URL),
            classifier_api_key: env_vars::env_string_or_default(env_vars::CLASSIFIER_API_KEY, ""),
            classifier_model: env_vars::env_string_or_default(
                env_vars::CLASSIFIER_MODEL,
                "deepseek-chat",
            ),

            total_worker_concurrency: env_usize_or_default(env_vars::TOTAL_WORKER_CONCURRENCY, 100),
            stage_concurrency,

            db_batch_size: env_usize_or_default(env_vars::DB_BATCH_SIZE, 100),
            db_flush_interval: Duration::from_millis(env_u64_or_default(
                env_vars::DB_FLUSH_INTERVAL,
                1_000,
            )),
            outbox_polling_interval: Duration::from_millis(env_u64_or_default(
                env_vars::OUTBOX_POLLING_INTERVAL,
                1_000,
            )),
            outbox_batch_size: env_usize_or_default(env_vars::OUTBOX_BATCH_SIZE, 200),
            outbox_super_batch_size: env_usize_or_default(env_vars::OUTBOX_SUPER_BATCH_SIZE, 1_000),
            max_resolution_attempts: env_u32_or_default(env_vars::MAX_RESOLUTION_ATTEMPTS, 5),

            llm_max_concurrency: env_usize_or_default(env_vars::LLM_MAX_CONCURRENCY, 4),
            llm_timeout: Duration::from_millis(env_u64_or_default(env_vars::LLM_TIMEOUT_MS, 30_000)),
            llm_max_retries: env_u32_or_default(env_vars::LLM_MAX_RETRIES, 3),
            llm_retry_delay: Duration::from_millis(env_u64_or_default(
                env_vars::LLM_RETRY_DELAY_MS,
                1_000,
            )),
            api_rate_limit: env_f64_or_default(env_vars::API_RATE_LIMIT, 25.0),

            escalation_threshold: env_f64_or_default(env_vars::CONFIDENCE_ESCALATION_THRESHOLD, 0.45),
            consensus_accept: env_f64_or_default(env_vars::CONSENSUS_ACCEPT, 0.65),
            consensus_reject: env_f64_or_default(env_vars::CONSENSUS_REJECT, 0.35),
            agreement_min: env_f64_or_default(env_vars::AGREEMENT_MIN, 0.67),

            triangulation_mode: match env_vars::env_string_or_default(
                env_vars::TRIANGULATION_MODE,
                "parallel",
            )
            .to_lowercase()
            .as_str()
            {
                "sequential" => TriangulationMode::Sequential,
                _ => TriangulationMode::Parallel,
            },
            max_parallel_agents: env_usize_or_default(env_vars::MAX_PARALLEL_AGENTS, 3),
            agent_timeout: Duration::from_millis(env_u64_or_default(
                env_vars::AGENT_TIMEOUT_MS,
                30_000,
            )),
            session_timeout: Duration::from_millis(env_u64_or_default(
                env_vars::SESSION_TIMEOUT_MS,
                120_000,
            )),

            small_file_threshold: env_u64_or_default(env_vars::SMALL_FILE_THRESHOLD, 10 * 1024),
            max_files_per_batch: env_usize_or_default(env_vars::MAX_FILES_PER_BATCH, 20),
            max_batch_chars: env_usize_or_default(env_vars::MAX_BATCH_CHARS, 60_000),
            batch_flush_interval: Duration::from_millis(env_u64_or_default(
                env_vars::BATCH_FLUSH_INTERVAL_MS,
                4_000,
            )),
            max_input_chars: 60_000,

            max_job_age: Duration::from_millis(env_u64_or_default(
                env_vars::MAX_JOB_AGE,
                24 * 60 * 60 * 1_000,
            )),
            max_stale_age: Duration::from_millis(env_u64_or_default(
                env_vars::MAX_STALE_AGE,
                10 * 60 * 1_000,
            )),
            max_failed_job_retention: env_usize_or_default(env_vars::MAX_FAILED_JOB_RETENTION, 1_000),
            max_completed_job_retention: env_usize_or_default(
                env_vars::MAX_COMPLETED_JOB_RETENTION,
                100,
            ),

            health_port: env_u64_or_default(env_vars::HEALTH_PORT, 8080) as u16,
            shutdown_grace: Duration::from_millis(env_u64_or_default(
                env_vars::SHUTDOWN_GRACE_MS,
                30_000,
            )),
            wal_size_limit_bytes: env_u64_or_default(
                env_vars::WAL_SIZE_LIMIT_BYTES,
                64 * 1024 * 1024,
            ),
        }
    }

    /// Effective concurrency for a stage: the per-stage override if present,
    /// otherwise a small default share.
    #[must_use]
    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.stage_concurrency.get(queue).copied().unwrap_or(4)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_design() {
        let config = PipelineConfig::from_env();
        assert_eq!(config.db_batch_size, 100);
        assert_eq!(config.outbox_batch_size, 200);
        assert_eq!(config.outbox_super_batch_size, 1_000);
        assert_eq!(config.max_resolution_attempts, 5);
        assert_eq!(config.llm_timeout, Duration::from_secs(30));
        assert!((config.escalation_threshold - 0.45).abs() < f64::EPSILON);
        assert!((config.consensus_accept - 0.65).abs() < f64::EPSILON);
        assert!((config.consensus_reject - 0.35).abs() < f64::EPSILON);
        assert!((config.agreement_min - 0.67).abs() < f64::EPSILON);
        assert_eq!(config.max_files_per_batch, 20);
        assert_eq!(config.max_input_chars, 60_000);
        assert_eq!(config.session_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_stage_concurrency_override() {
        std::env::set_var("FILE_ANALYSIS_CONCURRENCY", "12");
        let config = PipelineConfig::from_env();
        assert_eq!(config.concurrency_for(crate::queues::FILE_ANALYSIS), 12);
        assert_eq!(config.concurrency_for(crate::queues::VALIDATION), 4);
        std::env::remove_var("FILE_ANALYSIS_CONCURRENCY");
    }
}
