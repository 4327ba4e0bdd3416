//! SQLite persistence for the channel registry and the item/discovery store
//!
//! One [`Database`] owns the connection; [`ChannelRegistry`] and [`ItemStore`]
//! are cheap handles over a shared `Arc<Database>`. Every mutation is a
//! single keyed statement (or, for reservation, a single immediate
//! transaction), executed while holding the connection mutex.
//!
//! Deduplicating writes all go through [`insert_if_absent`], so channel
//! registration, item upserts and discovery logging share one contract:
//! the first writer wins and later writers are told they lost.

pub mod export;
pub mod items;
pub mod registry;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, ToSql};

use crate::utils::error::StorageError;

pub use export::{export_window, next_window_end, ExportOptions, ExportSummary};
pub use items::ItemStore;
pub use registry::ChannelRegistry;

/// How long a writer waits on a locked database file before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared SQLite handle
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) a database file and ensure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets exporters read while workers write
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        db.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite database initialized");
        Ok(db)
    }

    /// Create in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.create_schema()?;
        Ok(db)
    }

    /// Path of the backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock the connection
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS channels (
                    feed_id TEXT PRIMARY KEY,
                    freshness_token TEXT,
                    freshness_timestamp TEXT,
                    last_checked_at TEXT,
                    last_success_at TEXT,
                    last_http_status INTEGER,
                    last_http_class TEXT,
                    failures INTEGER NOT NULL DEFAULT 0,
                    next_poll_at TEXT NOT NULL,
                    poll_interval_sec INTEGER NOT NULL DEFAULT 3600,
                    last_seen_item_id TEXT,
                    last_seen_published_at TEXT,
                    inflight INTEGER NOT NULL DEFAULT 0,
                    reserved_at TEXT,
                    disabled INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_channels_due
                    ON channels(next_poll_at)
                    WHERE disabled = 0 AND inflight = 0;

                CREATE TABLE IF NOT EXISTS items (
                    item_id TEXT PRIMARY KEY,
                    feed_id TEXT NOT NULL,
                    title TEXT,
                    published_at TEXT
                );

                CREATE TABLE IF NOT EXISTS discoveries (
                    item_id TEXT PRIMARY KEY,
                    feed_id TEXT NOT NULL,
                    title TEXT,
                    published_at TEXT,
                    discovered_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_discoveries_discovered_at
                    ON discoveries(discovered_at);
                "#,
        )?;

        // Files created before reservation leases existed
        let has_lease: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('channels') WHERE name = 'reserved_at'",
            [],
            |row| row.get(0),
        )?;
        if !has_lease {
            conn.execute_batch("ALTER TABLE channels ADD COLUMN reserved_at TEXT;")?;
        }

        Ok(())
    }
}

/// Insert a row unless its primary key already exists
///
/// Returns `true` when the row was inserted. Existing rows are never
/// touched, so repeated calls are idempotent and the original values win.
pub fn insert_if_absent(
    conn: &Connection,
    table: &str,
    columns: &[&str],
    values: &[&dyn ToSql],
) -> Result<bool, StorageError> {
    debug_assert_eq!(columns.len(), values.len());

    let placeholders = (1..=values.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT OR IGNORE INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    );

    let changed = conn.prepare_cached(&sql)?.execute(values)?;
    Ok(changed > 0)
}

/// Count rows of a table
pub(crate) fn count_rows(conn: &Connection, table: &str) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}
