// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Periodic queue hygiene.
//!
//! Removes aged terminal jobs, fails jobs stuck in `active` past the stale
//! threshold (with a timeout reason), and offers an emergency drain that
//! refuses to run without an explicit confirmation token.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use codegraph::queues;

use crate::broker::{JobState, QueueBroker};
use crate::BrokerResult;

/// Token the caller must pass to [`CleanupManager::emergency_drain`].
pub const EMERGENCY_DRAIN_CONFIRMATION: &str = "DRAIN-ALL-QUEUES";

/// Cleanup thresholds, usually sourced from [`codegraph::PipelineConfig`].
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Terminal jobs older than this are removed.
    pub max_job_age: Duration,
    /// Active jobs reserved longer ago than this are failed as stuck.
    pub max_stale_age: Duration,
    /// Interval between cleanup passes.
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_job_age: Duration::from_secs(24 * 60 * 60),
            max_stale_age: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(60),
        }
    }
}

/// What one cleanup pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed_removed: u64,
    pub failed_removed: u64,
    pub stuck_failed: u64,
}

/// Periodic cleanup over the registered queue set.
pub struct CleanupManager {
    broker: Arc<dyn QueueBroker>,
    config: CleanupConfig,
}

impl CleanupManager {
    #[must_use]
    pub fn new(broker: Arc<dyn QueueBroker>, config: CleanupConfig) -> Self {
        Self { broker, config }
    }

    /// One pass over every registered queue.
    pub async fn run_once(&self) -> BrokerResult<CleanupReport> {
        let mut report = CleanupReport::default();
        for queue in queues::ALL_QUEUES {
            report.completed_removed += self
                .broker
                .clean(queue, self.config.max_job_age, JobState::Completed)
                .await?;
            report.failed_removed += self
                .broker
                .clean(queue, self.config.max_job_age, JobState::Failed)
                .await?;

            // Jobs stuck in active past the stale threshold: fail them with a
            // timeout reason so the broker's retry policy decides their fate.
            let stale = self
                .broker
                .stale_active(queue, self.config.max_stale_age)
                .await?;
            for job in stale {
                warn!(
                    queue,
                    job_id = %job.id,
                    attempts = job.attempts_made,
                    "Failing stuck active job"
                );
                self.broker
                    .fail(
                        &job,
                        &format!(
                            "stale timeout: active longer than {}s",
                            self.config.max_stale_age.as_secs()
                        ),
                        true,
                        None,
                    )
                    .await?;
                report.stuck_failed += 1;
            }
        }
        if report != CleanupReport::default() {
            info!(
                completed_removed = report.completed_removed,
                failed_removed = report.failed_removed,
                stuck_failed = report.stuck_failed,
                "Queue cleanup pass finished"
            );
        }
        Ok(report)
    }

    /// Run cleanup passes until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Queue cleanup pass failed; will retry next interval");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Drain every registered queue. Destructive; requires the literal
    /// confirmation token [`EMERGENCY_DRAIN_CONFIRMATION`].
    pub async fn emergency_drain(&self, confirmation: &str) -> BrokerResult<u64> {
        if confirmation != EMERGENCY_DRAIN_CONFIRMATION {
            return Err(crate::BrokerError::Backend(format!(
                "emergency drain refused: confirmation token mismatch (expected {EMERGENCY_DRAIN_CONFIRMATION:?})"
            )));
        }
        let mut total = 0;
        for queue in queues::ALL_QUEUES {
            total += self.broker.drain(queue).await?;
        }
        warn!(jobs_removed = total, "Emergency drain executed");
        Ok(total)
    }
}
