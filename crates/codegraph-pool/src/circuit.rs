// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Three-state circuit breaker.
//!
//! CLOSED -> OPEN after `failure_threshold` consecutive failures;
//! OPEN -> HALF-OPEN after `reset_timeout`; in HALF-OPEN exactly one trial
//! request is admitted, and its outcome decides CLOSED or re-OPEN.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// A circuit breaker guarding one worker type's dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Admit a request, or report how long until the next probe window.
    ///
    /// In HALF-OPEN only a single trial is admitted; concurrent callers are
    /// rejected until the trial reports an outcome.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.reset_timeout {
                    info!(breaker = %self.name, "Circuit half-open; admitting trial request");
                    *inner = Inner::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(())
                } else {
                    Err(self.reset_timeout - elapsed)
                }
            }
            Inner::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Err(self.reset_timeout)
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => *consecutive_failures = 0,
            Inner::HalfOpen { .. } => {
                info!(breaker = %self.name, "Trial succeeded; circuit closed");
                *inner = Inner::Closed {
                    consecutive_failures: 0,
                };
            }
            // A success racing the open transition changes nothing.
            Inner::Open { .. } => {}
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = *consecutive_failures,
                        "Failure threshold reached; circuit open"
                    );
                    *inner = Inner::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!(breaker = %self.name, "Trial failed; circuit re-opened");
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match &*self.inner.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}
