//! Channel registry: one scheduling row per watched feed
//!
//! The registry owns the per-channel state machine. Workers never touch the
//! `inflight` flag directly; it is set by [`ChannelRegistry::reserve_due_at`]
//! and cleared by exactly one of [`finalize`](ChannelRegistry::finalize),
//! [`mark_error`](ChannelRegistry::mark_error) or
//! [`release`](ChannelRegistry::release).
//!
//! Every reservation carries the time it was taken (`reserved_at`). A
//! reservation that outlives the lease is presumed abandoned by a crashed
//! process and may be reclaimed with
//! [`release_expired_at`](ChannelRegistry::release_expired_at); younger
//! reservations belong to a live worker and are never touched.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{count_rows, insert_if_absent, Database};
use crate::error::Result;
use crate::models::{Channel, ChannelOutcome, DueChannel, HttpClass, DEFAULT_POLL_INTERVAL_SECS};
use crate::utils::error::StorageError;
use crate::utils::{format_timestamp, parse_timestamp};

/// Upper bound of the random delay given to newly registered channels
const REGISTER_JITTER_SECS: i64 = 600;

/// Channel registry backed by SQLite
#[derive(Clone)]
pub struct ChannelRegistry {
    db: Arc<Database>,
}

impl ChannelRegistry {
    /// Create a registry handle over a shared database
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register a feed, first due within the next ten minutes
    ///
    /// Returns `false` if the feed was already registered; the existing row
    /// is left untouched.
    pub fn register(&self, feed_id: &str) -> Result<bool> {
        let jitter = rand::thread_rng().gen_range(0..=REGISTER_JITTER_SECS);
        self.register_at(feed_id, Utc::now() + Duration::seconds(jitter))
    }

    /// Register a feed with an explicit first poll time
    pub fn register_at(&self, feed_id: &str, next_poll_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.conn()?;
        let inserted = insert_channel(&conn, feed_id, next_poll_at)?;
        Ok(inserted)
    }

    /// Register many feeds in one transaction, returning how many were new
    pub fn register_many<I, S>(&self, feed_ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Utc::now();
        let mut rng = rand::thread_rng();
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let mut inserted = 0;
        for feed_id in feed_ids {
            let jitter = Duration::seconds(rng.gen_range(0..=REGISTER_JITTER_SECS));
            if insert_channel(&tx, feed_id.as_ref(), now + jitter)? {
                inserted += 1;
            }
        }
        tx.commit()?;

        tracing::info!(inserted, "Registered channels");
        Ok(inserted)
    }

    /// Reserve up to `limit` channels that are due now
    pub fn reserve_due(&self, limit: usize) -> Result<Vec<DueChannel>> {
        self.reserve_due_at(limit, Utc::now())
    }

    /// Reserve up to `limit` channels due at `now`, oldest-due first
    ///
    /// Selection and flagging happen inside one immediate transaction while
    /// holding the connection lock, so two concurrent callers can never both
    /// reserve the same channel.
    pub fn reserve_due_at(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<DueChannel>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let due = {
            let mut stmt = tx.prepare_cached(
                "SELECT feed_id, freshness_token, freshness_timestamp, poll_interval_sec,
                        failures, last_seen_published_at
                 FROM channels
                 WHERE disabled = 0 AND inflight = 0 AND next_poll_at <= ?1
                 ORDER BY next_poll_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![format_timestamp(now), limit as i64],
                |row| {
                    Ok(DueChannel {
                        feed_id: row.get(0)?,
                        freshness_token: row.get(1)?,
                        freshness_timestamp: row.get(2)?,
                        poll_interval_sec: row.get::<_, i64>(3)?.max(0) as u64,
                        failures: row.get::<_, i64>(4)?.max(0) as u32,
                        last_seen_published_at: row
                            .get::<_, Option<String>>(5)?
                            .as_deref()
                            .and_then(parse_timestamp),
                    })
                },
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        {
            let reserved_at = format_timestamp(now);
            let mut flag = tx.prepare_cached(
                "UPDATE channels SET inflight = 1, reserved_at = ?1 WHERE feed_id = ?2",
            )?;
            for channel in &due {
                flag.execute(params![reserved_at, channel.feed_id])?;
            }
        }
        tx.commit()?;

        if !due.is_empty() {
            tracing::debug!(count = due.len(), "Reserved due channels");
        }
        Ok(due)
    }

    /// Apply a successful or not-modified cycle and release the reservation
    ///
    /// Resets `failures`, refreshes validators and the watermark when the
    /// outcome carries new ones, and schedules the next poll at
    /// `checked_at + next_interval_sec`.
    pub fn finalize(&self, feed_id: &str, outcome: &ChannelOutcome) -> Result<()> {
        let checked_at = format_timestamp(outcome.checked_at);
        let next_poll_at = format_timestamp(
            outcome.checked_at + Duration::seconds(outcome.next_interval_sec as i64),
        );
        let (seen_id, seen_published) = match &outcome.watermark {
            Some(w) => (Some(w.item_id.as_str()), w.published_at.map(format_timestamp)),
            None => (None, None),
        };

        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE channels
             SET freshness_token = COALESCE(?1, freshness_token),
                 freshness_timestamp = COALESCE(?2, freshness_timestamp),
                 last_checked_at = ?3,
                 last_success_at = ?3,
                 last_http_status = ?4,
                 last_http_class = ?5,
                 failures = 0,
                 last_seen_item_id = COALESCE(?6, last_seen_item_id),
                 last_seen_published_at = CASE WHEN ?6 IS NULL
                                               THEN last_seen_published_at ELSE ?7 END,
                 next_poll_at = ?8,
                 poll_interval_sec = ?9,
                 inflight = 0,
                 reserved_at = NULL
             WHERE feed_id = ?10",
            params![
                outcome.freshness_token,
                outcome.freshness_timestamp,
                checked_at,
                outcome.http_status,
                outcome.http_class.as_str(),
                seen_id,
                seen_published,
                next_poll_at,
                outcome.next_interval_sec as i64,
                feed_id,
            ],
        )?;

        ensure_row(changed, feed_id)
    }

    /// Record a failed cycle and release the reservation
    pub fn mark_error(
        &self,
        feed_id: &str,
        http_class: HttpClass,
        http_status: Option<u16>,
        backoff_secs: u64,
    ) -> Result<()> {
        self.mark_error_at(feed_id, http_class, http_status, backoff_secs, Utc::now())
    }

    /// Record a failed cycle observed at `now`
    ///
    /// Validators and the watermark are left untouched. The failure counter
    /// is bumped unless the class is remote throttling.
    pub fn mark_error_at(
        &self,
        feed_id: &str,
        http_class: HttpClass,
        http_status: Option<u16>,
        backoff_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let increment: i64 = if http_class.counts_as_failure() { 1 } else { 0 };
        let next_poll_at = format_timestamp(now + Duration::seconds(backoff_secs as i64));

        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE channels
             SET failures = failures + ?1,
                 last_checked_at = ?2,
                 last_http_status = ?3,
                 last_http_class = ?4,
                 next_poll_at = ?5,
                 inflight = 0,
                 reserved_at = NULL
             WHERE feed_id = ?6",
            params![
                increment,
                format_timestamp(now),
                http_status,
                http_class.as_str(),
                next_poll_at,
                feed_id,
            ],
        )?;

        ensure_row(changed, feed_id)
    }

    /// Drop a reservation without recording anything
    pub fn release(&self, feed_id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE channels SET inflight = 0, reserved_at = NULL WHERE feed_id = ?1",
            params![feed_id],
        )?;
        ensure_row(changed, feed_id)
    }

    /// Clear reservations older than `lease`
    pub fn release_expired(&self, lease: StdDuration) -> Result<usize> {
        self.release_expired_at(Utc::now(), lease)
    }

    /// Clear reservations taken at or before `now - lease`
    ///
    /// Reservations younger than the lease are held by a live worker,
    /// possibly in another process sharing the file, and stay put.
    pub fn release_expired_at(&self, now: DateTime<Utc>, lease: StdDuration) -> Result<usize> {
        let cutoff = Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let conn = self.db.conn()?;
        let released = conn.execute(
            "UPDATE channels SET inflight = 0, reserved_at = NULL
             WHERE inflight = 1 AND (reserved_at IS NULL OR reserved_at <= ?1)",
            params![format_timestamp(cutoff)],
        )?;
        if released > 0 {
            tracing::warn!(released, "Released expired reservations");
        }
        Ok(released)
    }

    /// Enable or disable a channel; disabled channels are never reserved
    pub fn set_disabled(&self, feed_id: &str, disabled: bool) -> Result<()> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE channels SET disabled = ?1 WHERE feed_id = ?2",
            params![disabled, feed_id],
        )?;
        ensure_row(changed, feed_id)
    }

    /// Get the full row for a channel
    pub fn get(&self, feed_id: &str) -> Result<Option<Channel>> {
        let conn = self.db.conn()?;
        let raw = conn
            .query_row(
                "SELECT feed_id, freshness_token, freshness_timestamp, last_checked_at,
                        last_success_at, last_http_status, last_http_class, failures,
                        next_poll_at, poll_interval_sec, last_seen_item_id,
                        last_seen_published_at, inflight, disabled
                 FROM channels WHERE feed_id = ?1",
                params![feed_id],
                RawChannel::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(raw.into_channel()?)),
            None => Ok(None),
        }
    }

    /// Total number of registered channels
    pub fn total_count(&self) -> Result<u64> {
        let conn = self.db.conn()?;
        Ok(count_rows(&conn, "channels")?)
    }

    /// Number of channels that could be reserved at `now`
    pub fn due_count_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.db.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM channels
             WHERE disabled = 0 AND inflight = 0 AND next_poll_at <= ?1",
            params![format_timestamp(now)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn insert_channel(
    conn: &rusqlite::Connection,
    feed_id: &str,
    next_poll_at: DateTime<Utc>,
) -> std::result::Result<bool, StorageError> {
    insert_if_absent(
        conn,
        "channels",
        &[
            "feed_id",
            "failures",
            "next_poll_at",
            "poll_interval_sec",
            "inflight",
            "disabled",
        ],
        &[
            &feed_id,
            &0i64,
            &format_timestamp(next_poll_at),
            &(DEFAULT_POLL_INTERVAL_SECS as i64),
            &false,
            &false,
        ],
    )
}

fn ensure_row(changed: usize, feed_id: &str) -> Result<()> {
    if changed == 0 {
        return Err(StorageError::UnknownChannel(feed_id.to_string()).into());
    }
    Ok(())
}

/// Channel row as stored, before timestamp parsing
struct RawChannel {
    feed_id: String,
    freshness_token: Option<String>,
    freshness_timestamp: Option<String>,
    last_checked_at: Option<String>,
    last_success_at: Option<String>,
    last_http_status: Option<i64>,
    last_http_class: Option<String>,
    failures: i64,
    next_poll_at: String,
    poll_interval_sec: i64,
    last_seen_item_id: Option<String>,
    last_seen_published_at: Option<String>,
    inflight: bool,
    disabled: bool,
}

impl RawChannel {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            feed_id: row.get(0)?,
            freshness_token: row.get(1)?,
            freshness_timestamp: row.get(2)?,
            last_checked_at: row.get(3)?,
            last_success_at: row.get(4)?,
            last_http_status: row.get(5)?,
            last_http_class: row.get(6)?,
            failures: row.get(7)?,
            next_poll_at: row.get(8)?,
            poll_interval_sec: row.get(9)?,
            last_seen_item_id: row.get(10)?,
            last_seen_published_at: row.get(11)?,
            inflight: row.get(12)?,
            disabled: row.get(13)?,
        })
    }

    fn into_channel(self) -> std::result::Result<Channel, StorageError> {
        Ok(Channel {
            next_poll_at: required_timestamp("next_poll_at", &self.next_poll_at)?,
            last_checked_at: optional_timestamp("last_checked_at", self.last_checked_at)?,
            last_success_at: optional_timestamp("last_success_at", self.last_success_at)?,
            last_seen_published_at: optional_timestamp(
                "last_seen_published_at",
                self.last_seen_published_at,
            )?,
            feed_id: self.feed_id,
            freshness_token: self.freshness_token,
            freshness_timestamp: self.freshness_timestamp,
            last_http_status: self.last_http_status.and_then(|s| u16::try_from(s).ok()),
            last_http_class: self.last_http_class.and_then(|c| c.parse().ok()),
            failures: self.failures.max(0) as u32,
            poll_interval_sec: self.poll_interval_sec.max(0) as u64,
            last_seen_item_id: self.last_seen_item_id,
            inflight: self.inflight,
            disabled: self.disabled,
        })
    }
}

fn required_timestamp(
    column: &'static str,
    value: &str,
) -> std::result::Result<DateTime<Utc>, StorageError> {
    parse_timestamp(value).ok_or_else(|| StorageError::InvalidTimestamp {
        column,
        value: value.to_string(),
    })
}

fn optional_timestamp(
    column: &'static str,
    value: Option<String>,
) -> std::result::Result<Option<DateTime<Utc>>, StorageError> {
    value.map(|v| required_timestamp(column, &v)).transpose()
}
