// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Dependency health tracking for the health endpoint.
//!
//! Each dependency (staging store, queue broker, graph store, classifier,
//! worker pool) records successes and failures; `overall` is healthy iff
//! every dependency's consecutive failure count is below its threshold.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Per-dependency health view.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

/// Snapshot returned by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: bool,
    pub dependencies: Vec<DependencyHealth>,
}

#[derive(Debug)]
struct DepState {
    consecutive_failures: u32,
    failure_threshold: u32,
    last_error: Option<String>,
    last_check: Option<DateTime<Utc>>,
}

/// Registry of dependency health states.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    deps: DashMap<String, DepState>,
}

impl HealthRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency with its consecutive-failure threshold.
    pub fn register(&self, name: &str, failure_threshold: u32) {
        self.deps.insert(
            name.to_string(),
            DepState {
                consecutive_failures: 0,
                failure_threshold: failure_threshold.max(1),
                last_error: None,
                last_check: None,
            },
        );
    }

    /// Record a successful check or operation.
    pub fn record_success(&self, name: &str) {
        if let Some(mut dep) = self.deps.get_mut(name) {
            dep.consecutive_failures = 0;
            dep.last_error = None;
            dep.last_check = Some(Utc::now());
        }
    }

    /// Record a failed check or operation.
    pub fn record_failure(&self, name: &str, error: &str) {
        if let Some(mut dep) = self.deps.get_mut(name) {
            dep.consecutive_failures += 1;
            dep.last_error = Some(error.to_string());
            dep.last_check = Some(Utc::now());
        }
    }

    /// Point-in-time snapshot of every registered dependency.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut dependencies: Vec<DependencyHealth> = self
            .deps
            .iter()
            .map(|entry| {
                let dep = entry.value();
                DependencyHealth {
                    name: entry.key().clone(),
                    healthy: dep.consecutive_failures < dep.failure_threshold,
                    consecutive_failures: dep.consecutive_failures,
                    failure_threshold: dep.failure_threshold,
                    last_error: dep.last_error.clone(),
                    last_check: dep.last_check,
                }
            })
            .collect();
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));
        HealthSnapshot {
            overall: dependencies.iter().all(|d| d.healthy),
            dependencies,
        }
    }
}
