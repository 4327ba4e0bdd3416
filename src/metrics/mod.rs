//! Prometheus metrics for the feed watcher
//!
//! This module provides metrics tracking for:
//! - Worker cycles: classified outcomes, new items, fetch latency
//! - Fleet state: channel, due, item and discovery counts
//! - Dispatcher health: failed ticks
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

pub mod progress;

pub use progress::{
    JsonFileSink, ProgressReporter, ProgressSink, ProgressSnapshot, PrometheusSink, TracingSink,
};

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

use crate::models::HttpClass;

/// Container for all watcher metrics
struct WatchMetrics {
    outcomes: CounterVec,
    new_items: Counter,
    fetch_duration: HistogramVec,
    tick_failures: Counter,
    channels_total: Gauge,
    channels_due: Gauge,
    items_total: Gauge,
    discoveries_total: Gauge,
}

/// Global storage for watcher metrics
static WATCH_METRICS: OnceLock<WatchMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

/// Serializes concurrent `init_metrics` calls
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all Prometheus metrics
///
/// Registration happens at most once per process; later calls return `Ok`.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = WatchMetrics {
        outcomes: register_counter_vec!(
            "feedwatch_cycle_outcomes_total",
            "Channel cycles by classified outcome",
            &["outcome"]
        )?,
        new_items: register_counter!(
            "feedwatch_new_items_total",
            "Items observed for the first time"
        )?,
        fetch_duration: register_histogram_vec!(
            "feedwatch_fetch_duration_seconds",
            "Conditional fetch latency in seconds",
            &["outcome"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0]
        )?,
        tick_failures: register_counter!(
            "feedwatch_tick_failures_total",
            "Dispatcher ticks that could not reserve channels"
        )?,
        channels_total: register_gauge!(
            "feedwatch_channels_total",
            "Registered channels"
        )?,
        channels_due: register_gauge!(
            "feedwatch_channels_due",
            "Channels due and not reserved"
        )?,
        items_total: register_gauge!("feedwatch_items_total", "Rows in the item table")?,
        discoveries_total: register_gauge!(
            "feedwatch_discoveries_total",
            "Rows in the discovery log"
        )?,
    };

    if WATCH_METRICS.set(metrics).is_err() {
        tracing::warn!("Watcher metrics already initialized");
    }

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one finished channel cycle
pub fn record_outcome(class: HttpClass, new_items: u64) {
    let Some(m) = WATCH_METRICS.get() else {
        return;
    };

    m.outcomes.with_label_values(&[class.as_str()]).inc();
    if new_items > 0 {
        m.new_items.inc_by(new_items as f64);
    }
}

/// Record the latency of one fetch
pub fn observe_fetch(class: HttpClass, duration_secs: f64) {
    if let Some(m) = WATCH_METRICS.get() {
        m.fetch_duration
            .with_label_values(&[class.as_str()])
            .observe(duration_secs);
    }
}

/// Record a dispatcher tick that failed to reserve work
pub fn record_tick_failure() {
    if let Some(m) = WATCH_METRICS.get() {
        m.tick_failures.inc();
    }
}

/// Publish fleet-wide counts
pub fn update_fleet_gauges(total: u64, due: u64, items: u64, discoveries: u64) {
    if let Some(m) = WATCH_METRICS.get() {
        m.channels_total.set(total as f64);
        m.channels_due.set(due as f64);
        m.items_total.set(items as f64);
        m.discoveries_total.set(discoveries as f64);
    }
}
