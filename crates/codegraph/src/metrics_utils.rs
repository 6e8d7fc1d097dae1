// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

// Allow expect() in this module: used for fallback metric creation where
// the fallback name is guaranteed to be valid (e.g., "{name}_invalid").
#![allow(clippy::expect_used)]

//! Safe Prometheus metric registration helpers.
//!
//! CodeGraph crates are libraries linked into multiple binaries. When two
//! components register the same metric name, the default Prometheus registry
//! returns an error and the upstream `register_*` macros panic on it. These
//! helpers log and continue instead, returning the already-registered metric
//! (or an unregistered fallback) so metric registration can never take a
//! worker down.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts};
use std::sync::LazyLock;
use tracing::{debug, warn};

#[derive(Clone)]
struct CounterEntry {
    help: String,
    metric: Counter,
}

#[derive(Clone)]
struct GaugeEntry {
    help: String,
    metric: Gauge,
}

#[derive(Clone)]
struct HistogramEntry {
    help: String,
    metric: Histogram,
}

#[derive(Clone)]
struct CounterVecEntry {
    help: String,
    labels: Vec<String>,
    metric: CounterVec,
}

#[derive(Clone)]
struct HistogramVecEntry {
    labels: Vec<String>,
    metric: HistogramVec,
}

static COUNTERS: LazyLock<DashMap<String, CounterEntry>> = LazyLock::new(DashMap::new);
static GAUGES: LazyLock<DashMap<String, GaugeEntry>> = LazyLock::new(DashMap::new);
static HISTOGRAMS: LazyLock<DashMap<String, HistogramEntry>> = LazyLock::new(DashMap::new);
static COUNTER_VECS: LazyLock<DashMap<String, CounterVecEntry>> = LazyLock::new(DashMap::new);
static HISTOGRAM_VECS: LazyLock<DashMap<String, HistogramVecEntry>> = LazyLock::new(DashMap::new);

fn register(metric: Box<dyn prometheus::core::Collector>, name: &str) {
    if let Err(e) = prometheus::default_registry().register(metric) {
        match e {
            prometheus::Error::AlreadyReg => {
                debug!(metric = name, "Metric already registered; continuing");
            }
            other => {
                warn!(
                    metric = name,
                    error = %other,
                    "Metric registration failed; continuing without global registration"
                );
            }
        }
    }
}

/// Create (or fetch) a registered counter. Counter names must end in `_total`.
pub fn counter(name: &str, help: &str) -> Counter {
    if !name.ends_with("_total") {
        warn!(
            metric = name,
            "Counter metric name should end with '_total' per Prometheus conventions"
        );
    }

    match COUNTERS.entry(name.to_string()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let metric = Counter::new(name, help).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "Failed to create Counter");
                Counter::new(format!("{name}_invalid"), help)
                    .expect("fallback counter name should be valid")
            });
            register(Box::new(metric.clone()), name);
            entry.insert(CounterEntry {
                help: help.to_string(),
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Create (or fetch) a registered gauge.
pub fn gauge(name: &str, help: &str) -> Gauge {
    match GAUGES.entry(name.to_string()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let metric = Gauge::new(name, help).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "Failed to create Gauge");
                Gauge::new(format!("{name}_invalid"), help)
                    .expect("fallback gauge name should be valid")
            });
            register(Box::new(metric.clone()), name);
            entry.insert(GaugeEntry {
                help: help.to_string(),
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Create (or fetch) a registered histogram.
pub fn histogram(opts: HistogramOpts) -> Histogram {
    let name = opts.common_opts.name.clone();
    let help = opts.common_opts.help.clone();

    match HISTOGRAMS.entry(name.clone()) {
        Entry::Occupied(entry) => {
            if entry.get().help != help {
                warn!(metric = %name, "Histogram help mismatch; reusing existing metric");
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = Histogram::with_opts(opts).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "Failed to create Histogram");
                Histogram::with_opts(HistogramOpts::new(
                    format!("{name}_invalid"),
                    "invalid histogram",
                ))
                .expect("fallback histogram should be valid")
            });
            register(Box::new(metric.clone()), &name);
            entry.insert(HistogramEntry {
                help,
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Create (or fetch) a registered counter vec.
pub fn counter_vec(opts: Opts, labels: &[&str]) -> CounterVec {
    let name = opts.name.clone();
    let help = opts.help.clone();
    let requested_labels: Vec<String> = labels.iter().map(|s| (*s).to_string()).collect();

    match COUNTER_VECS.entry(name.clone()) {
        Entry::Occupied(entry) => {
            if entry.get().labels != requested_labels {
                warn!(metric = %name, "CounterVec label names mismatch; using a fallback metric");
                let fallback_name = format!("{name}_invalid");
                let metric =
                    CounterVec::new(Opts::new(fallback_name.clone(), "invalid counter vec"), labels)
                        .expect("fallback counter vec should be valid");
                register(Box::new(metric.clone()), &fallback_name);
                return metric;
            }
            if entry.get().help != help {
                warn!(metric = %name, "CounterVec help mismatch; reusing existing metric");
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = CounterVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "Failed to create CounterVec");
                CounterVec::new(
                    Opts::new(format!("{name}_invalid"), "invalid counter vec"),
                    labels,
                )
                .expect("fallback counter vec should be valid")
            });
            register(Box::new(metric.clone()), &name);
            entry.insert(CounterVecEntry {
                help,
                labels: requested_labels,
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Create (or fetch) a registered histogram vec.
pub fn histogram_vec(opts: HistogramOpts, labels: &[&str]) -> HistogramVec {
    let name = opts.common_opts.name.clone();
    let requested_labels: Vec<String> = labels.iter().map(|s| (*s).to_string()).collect();

    match HISTOGRAM_VECS.entry(name.clone()) {
        Entry::Occupied(entry) => {
            if entry.get().labels != requested_labels {
                warn!(metric = %name, "HistogramVec label names mismatch; using a fallback metric");
                let fallback_name = format!("{name}_invalid");
                let metric = HistogramVec::new(
                    HistogramOpts::new(fallback_name.clone(), "invalid histogram vec"),
                    labels,
                )
                .expect("fallback histogram vec should be valid");
                register(Box::new(metric.clone()), &fallback_name);
                return metric;
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = HistogramVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "Failed to create HistogramVec");
                HistogramVec::new(
                    HistogramOpts::new(format!("{name}_invalid"), "invalid histogram vec"),
                    labels,
                )
                .expect("fallback histogram vec should be valid")
            });
            register(Box::new(metric.clone()), &name);
            entry.insert(HistogramVecEntry {
                labels: requested_labels,
                metric: metric.clone(),
            });
            metric
        }
    }
}
