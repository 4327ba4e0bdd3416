//! Windowed NDJSON export of discoveries
//!
//! Each run covers `[end - window, end)` with `end` floored to the minute and
//! writes `rss_discovered_YYYYMMDDTHHMM.jsonl` named after `end` (UTC).
//! Re-running the same window rewrites the same file with the same content.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use super::ItemStore;
use crate::error::Result;
use crate::utils::format_timestamp;

/// Options for one export run
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub out_dir: PathBuf,
    pub window_minutes: u32,
    /// Window end; `None` means now
    pub end_time: Option<DateTime<Utc>>,
    /// Skip items published more than this many hours before the window end (0 disables)
    pub min_published_hours: u32,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("exports"),
            window_minutes: 10,
            end_time: None,
            min_published_hours: 48,
        }
    }
}

/// Result of one export run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub written: usize,
    pub skipped_old: usize,
    /// `None` when the window was empty and no file was created
    pub path: Option<PathBuf>,
}

#[derive(Serialize)]
struct ExportLine<'a> {
    item_id: &'a str,
    feed_id: &'a str,
    title: &'a str,
    discovered_at: String,
    published_at: Option<String>,
}

/// Export one window of discoveries
pub fn export_window(store: &ItemStore, options: &ExportOptions) -> Result<ExportSummary> {
    let end = floor_to_minute(options.end_time.unwrap_or_else(Utc::now));
    let start = end - Duration::minutes(i64::from(options.window_minutes));
    let threshold = (options.min_published_hours > 0)
        .then(|| end - Duration::hours(i64::from(options.min_published_hours)));

    let records = store.discoveries_between(start, end)?;

    let mut seen = HashSet::new();
    let mut skipped_old = 0;
    let mut lines = Vec::new();
    for record in &records {
        if !seen.insert(record.item_id.as_str()) {
            continue;
        }
        if let (Some(threshold), Some(published)) = (threshold, record.published_at) {
            if published < threshold {
                skipped_old += 1;
                continue;
            }
        }
        lines.push(ExportLine {
            item_id: &record.item_id,
            feed_id: &record.feed_id,
            title: record.title.as_deref().unwrap_or(""),
            discovered_at: format_timestamp(record.discovered_at),
            published_at: record.published_at.map(format_timestamp),
        });
    }

    let mut summary = ExportSummary {
        window_start: start,
        window_end: end,
        written: lines.len(),
        skipped_old,
        path: None,
    };

    if lines.is_empty() {
        tracing::info!(
            start = %format_timestamp(start),
            end = %format_timestamp(end),
            "No discoveries in window, skipping file"
        );
        return Ok(summary);
    }

    fs::create_dir_all(&options.out_dir)?;
    let filename = format!("rss_discovered_{}.jsonl", end.format("%Y%m%dT%H%M"));
    let path = options.out_dir.join(&filename);
    let temp_path = options.out_dir.join(format!("{filename}.tmp"));

    {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        for line in &lines {
            serde_json::to_writer(&mut writer, line)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    fs::rename(&temp_path, &path)?;

    tracing::info!(written = summary.written, path = %path.display(), "Discovery export written");
    summary.path = Some(path);
    Ok(summary)
}

/// Next window boundary at or after `now`, aligned to `window_minutes` past the hour
pub fn next_window_end(now: DateTime<Utc>, window_minutes: u32) -> DateTime<Utc> {
    let window = Duration::minutes(i64::from(window_minutes.max(1)));
    let floored = now.duration_trunc(window).unwrap_or_else(|_| floor_to_minute(now));
    if floored == now {
        now
    } else {
        floored + window
    }
}

fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts)
}
