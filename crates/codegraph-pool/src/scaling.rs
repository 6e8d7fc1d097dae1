// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Adaptive concurrency scaling.
//!
//! Samples process CPU and heap pressure on an interval. After N
//! consecutive high samples (CPU > 85% or heap > 80%), every worker type's
//! effective concurrency steps down toward its minimum; once pressure
//! clears, concurrency steps back up toward the registered maximum.
//!
//! Probing is platform-dependent, so the sampler takes a [`ResourceProbe`]
//! trait object; [`ProcProbe`] reads `/proc` on Linux, and tests drive
//! synthetic samples.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::pool::WorkerPool;

/// One utilization sample, both fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_fraction: f64,
    pub heap_fraction: f64,
}

/// Source of utilization samples.
pub trait ResourceProbe: Send + Sync {
    /// Take a sample, or `None` when probing is unavailable on this platform.
    fn sample(&self) -> Option<ResourceSample>;
}

/// Scaling thresholds.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub high_cpu: f64,
    pub high_heap: f64,
    /// Consecutive high samples before throttling starts.
    pub consecutive_samples: u32,
    pub interval: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            high_cpu: 0.85,
            high_heap: 0.80,
            consecutive_samples: 3,
            interval: Duration::from_secs(5),
        }
    }
}

/// Periodic scaler over a shared pool.
pub struct AdaptiveScaler {
    pool: Arc<WorkerPool>,
    probe: Arc<dyn ResourceProbe>,
    config: ScalingConfig,
    high_streak: u32,
}

impl AdaptiveScaler {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, probe: Arc<dyn ResourceProbe>, config: ScalingConfig) -> Self {
        Self {
            pool,
            probe,
            config,
            high_streak: 0,
        }
    }

    /// Feed one sample through the scaling policy. Exposed for tests;
    /// [`AdaptiveScaler::run`] calls this on the configured interval.
    pub fn observe(&mut self, sample: ResourceSample) {
        let high =
            sample.cpu_fraction > self.config.high_cpu || sample.heap_fraction > self.config.high_heap;
        if high {
            self.high_streak += 1;
            if self.high_streak >= self.config.consecutive_samples {
                let mut throttled = 0;
                for worker_type in self.pool.worker_types() {
                    if self.pool.throttle(&worker_type) {
                        throttled += 1;
                    }
                }
                if throttled > 0 {
                    info!(
                        cpu = sample.cpu_fraction,
                        heap = sample.heap_fraction,
                        worker_types_throttled = throttled,
                        "Sustained resource pressure; reducing concurrency"
                    );
                }
            }
        } else {
            if self.high_streak >= self.config.consecutive_samples {
                let mut restored = 0;
                for worker_type in self.pool.worker_types() {
                    if self.pool.restore(&worker_type) {
                        restored += 1;
                    }
                }
                if restored > 0 {
                    debug!(worker_types_restored = restored, "Pressure cleared; restoring concurrency");
                }
            } else if self.high_streak == 0 {
                // Steady state: keep restoring any residual throttling.
                for worker_type in self.pool.worker_types() {
                    self.pool.restore(&worker_type);
                }
            }
            self.high_streak = 0;
        }
    }

    /// Sample-and-scale until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.probe.sample() {
                        Some(sample) => self.observe(sample),
                        None => {
                            // Unsupported platform: scaling stays inert.
                        }
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
}

/// `/proc`-based probe (Linux only). CPU fraction is the process's share of
/// all cores since the previous sample; heap fraction is resident set size
/// against a configured ceiling.
pub struct ProcProbe {
    heap_limit_bytes: u64,
    cores: f64,
    last_cpu: parking_lot::Mutex<Option<(std::time::Instant, u64)>>,
}

impl ProcProbe {
    #[must_use]
    pub fn new(heap_limit_bytes: u64) -> Self {
        Self {
            heap_limit_bytes: heap_limit_bytes.max(1),
            cores: std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(1.0),
            last_cpu: parking_lot::Mutex::new(None),
        }
    }

    #[cfg(target_os = "linux")]
    fn read_cpu_jiffies() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // Fields 14/15 (utime/stime), counted after the parenthesized comm.
        let rest = stat.rsplit(')').next()?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    #[cfg(target_os = "linux")]
    fn read_resident_bytes() -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
}

impl ResourceProbe for ProcProbe {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> Option<ResourceSample> {
        const JIFFIES_PER_SEC: f64 = 100.0;

        let now = std::time::Instant::now();
        let jiffies = Self::read_cpu_jiffies()?;
        let resident = Self::read_resident_bytes()?;

        let mut last = self.last_cpu.lock();
        let cpu_fraction = match last.replace((now, jiffies)) {
            Some((prev_at, prev_jiffies)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed <= 0.0 {
                    0.0
                } else {
                    let used = (jiffies.saturating_sub(prev_jiffies)) as f64 / JIFFIES_PER_SEC;
                    (used / (elapsed * self.cores)).clamp(0.0, 1.0)
                }
            }
            // First sample has no baseline.
            None => 0.0,
        };

        Some(ResourceSample {
            cpu_fraction,
            heap_fraction: (resident as f64 / self.heap_limit_bytes as f64).clamp(0.0, 1.0),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> Option<ResourceSample> {
        tracing::warn!("Resource probing unsupported on this platform; adaptive scaling inert");
        None
    }
}
