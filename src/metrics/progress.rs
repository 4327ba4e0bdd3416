//! Fleet progress snapshots and the sinks they are published to
//!
//! A snapshot is computed from registry and store state plus the outcome
//! counters accumulated since the previous report. Reporting never mutates
//! scheduling state.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crawler::pipeline::OutcomeCounts;
use crate::error::Result;
use crate::storage::{ChannelRegistry, ItemStore};

/// One published progress record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub updated_at: DateTime<Utc>,
    /// Fleet counts; `None` when storage could not be read
    pub total_channels: Option<u64>,
    pub due_now: Option<u64>,
    pub items: Option<u64>,
    pub discoveries: Option<u64>,
    /// Outcomes since the previous snapshot
    pub last_batch: OutcomeCounts,
    /// Consecutive dispatcher ticks that failed to reserve work
    pub tick_failures: u64,
    pub last_error: Option<String>,
}

/// Destination for progress snapshots
pub trait ProgressSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn publish(&self, snapshot: &ProgressSnapshot) -> Result<()>;
}

/// Writes the latest snapshot as pretty JSON, replacing the file atomically
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressSink for JsonFileSink {
    fn name(&self) -> &'static str {
        "json_file"
    }

    fn publish(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            serde_json::to_writer_pretty(&mut writer, snapshot)?;
            writer.flush()?;
        }
        fs::rename(&temp_path, &self.path)?;

        tracing::debug!(path = %self.path.display(), "Progress snapshot written");
        Ok(())
    }
}

/// Logs each snapshot as a structured `info` event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn publish(&self, s: &ProgressSnapshot) -> Result<()> {
        tracing::info!(
            total = ?s.total_channels,
            due = ?s.due_now,
            items = ?s.items,
            discoveries = ?s.discoveries,
            success = s.last_batch.success,
            not_modified = s.last_batch.not_modified,
            new_items = s.last_batch.new_items,
            rate_limited = s.last_batch.rate_limited,
            gone = s.last_batch.gone,
            error = s.last_batch.error,
            tick_failures = s.tick_failures,
            "Progress"
        );
        Ok(())
    }
}

/// Mirrors fleet counts into Prometheus gauges
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl ProgressSink for PrometheusSink {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn publish(&self, s: &ProgressSnapshot) -> Result<()> {
        if let (Some(total), Some(due), Some(items), Some(discoveries)) =
            (s.total_channels, s.due_now, s.items, s.discoveries)
        {
            super::update_fleet_gauges(total, due, items, discoveries);
        }
        Ok(())
    }
}

/// Computes snapshots and fans them out to sinks
pub struct ProgressReporter {
    registry: ChannelRegistry,
    items: ItemStore,
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl ProgressReporter {
    pub fn new(registry: ChannelRegistry, items: ItemStore) -> Self {
        Self {
            registry,
            items,
            sinks: Vec::new(),
        }
    }

    /// Add a sink
    pub fn with_sink(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Compute a snapshot without publishing it
    pub fn snapshot(
        &self,
        last_batch: OutcomeCounts,
        tick_failures: u64,
        tick_error: Option<String>,
    ) -> ProgressSnapshot {
        let now = Utc::now();
        let counts = (|| -> Result<(u64, u64, u64, u64)> {
            Ok((
                self.registry.total_count()?,
                self.registry.due_count_at(now)?,
                self.items.item_count()?,
                self.items.discovery_count()?,
            ))
        })();

        match counts {
            Ok((total, due, items, discoveries)) => ProgressSnapshot {
                updated_at: now,
                total_channels: Some(total),
                due_now: Some(due),
                items: Some(items),
                discoveries: Some(discoveries),
                last_batch,
                tick_failures,
                last_error: tick_error,
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to read fleet counts");
                ProgressSnapshot {
                    updated_at: now,
                    total_channels: None,
                    due_now: None,
                    items: None,
                    discoveries: None,
                    last_batch,
                    tick_failures,
                    last_error: Some(tick_error.unwrap_or_else(|| e.to_string())),
                }
            }
        }
    }

    /// Compute a snapshot and publish it to every sink
    ///
    /// A failing sink is logged and does not stop the others.
    pub fn report(
        &self,
        last_batch: OutcomeCounts,
        tick_failures: u64,
        tick_error: Option<String>,
    ) -> ProgressSnapshot {
        let snapshot = self.snapshot(last_batch, tick_failures, tick_error);
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&snapshot) {
                tracing::warn!(sink = sink.name(), error = %e, "Failed to publish progress");
            }
        }
        snapshot
    }
}
