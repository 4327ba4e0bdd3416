//! Deduplicated item store and discovery log

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{count_rows, insert_if_absent, Database};
use crate::error::Result;
use crate::models::{DiscoveryRecord, FeedEntry, Item};
use crate::utils::error::StorageError;
use crate::utils::{format_timestamp, parse_timestamp};

/// Item and discovery tables behind a shared database
#[derive(Clone)]
pub struct ItemStore {
    db: Arc<Database>,
}

impl ItemStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert an item unless its id is already known
    pub fn upsert_item(&self, item: &Item) -> Result<bool> {
        let conn = self.db.conn()?;
        let published = item.published_at.map(format_timestamp);
        let inserted = insert_if_absent(
            &conn,
            "items",
            &["item_id", "feed_id", "title", "published_at"],
            &[&item.item_id, &item.feed_id, &item.title, &published],
        )?;
        Ok(inserted)
    }

    /// Append a discovery record unless the item was discovered before
    pub fn record_discovery(&self, item: &Item, discovered_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.conn()?;
        let published = item.published_at.map(format_timestamp);
        let inserted = insert_if_absent(
            &conn,
            "discoveries",
            &["item_id", "feed_id", "title", "published_at", "discovered_at"],
            &[
                &item.item_id,
                &item.feed_id,
                &item.title,
                &published,
                &format_timestamp(discovered_at),
            ],
        )?;
        Ok(inserted)
    }

    /// Store one parsed entry; returns whether either write was new
    ///
    /// Both writes are attempted even when the first one loses, so a crash
    /// between them is repaired the next time the entry is seen.
    pub fn store_entry(&self, feed_id: &str, entry: &FeedEntry, now: DateTime<Utc>) -> Result<bool> {
        let item = Item::from_entry(feed_id, entry);
        let item_new = self.upsert_item(&item)?;
        let discovery_new = self.record_discovery(&item, now)?;
        Ok(item_new || discovery_new)
    }

    pub fn item_count(&self) -> Result<u64> {
        let conn = self.db.conn()?;
        Ok(count_rows(&conn, "items")?)
    }

    pub fn discovery_count(&self) -> Result<u64> {
        let conn = self.db.conn()?;
        Ok(count_rows(&conn, "discoveries")?)
    }

    pub fn get_item(&self, item_id: &str) -> Result<Option<Item>> {
        let conn = self.db.conn()?;
        let row = conn
            .query_row(
                "SELECT item_id, feed_id, title, published_at FROM items WHERE item_id = ?1",
                params![item_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(item_id, feed_id, title, published_at)| Item {
            item_id,
            feed_id,
            title,
            published_at: published_at.as_deref().and_then(parse_timestamp),
        }))
    }

    pub fn get_discovery(&self, item_id: &str) -> Result<Option<DiscoveryRecord>> {
        let conn = self.db.conn()?;
        let row = conn
            .query_row(
                "SELECT item_id, feed_id, title, published_at, discovered_at
                 FROM discoveries WHERE item_id = ?1",
                params![item_id],
                DiscoveryRow::from_row,
            )
            .optional()?;

        match row {
            Some(row) => Ok(Some(row.into_record()?)),
            None => Ok(None),
        }
    }

    /// Discoveries with `start <= discovered_at < end`, oldest first
    pub fn discoveries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DiscoveryRecord>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT item_id, feed_id, title, published_at, discovered_at
             FROM discoveries
             WHERE discovered_at >= ?1 AND discovered_at < ?2
             ORDER BY discovered_at ASC, item_id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![format_timestamp(start), format_timestamp(end)],
                DiscoveryRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let records = rows
            .into_iter()
            .map(DiscoveryRow::into_record)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

struct DiscoveryRow {
    item_id: String,
    feed_id: String,
    title: Option<String>,
    published_at: Option<String>,
    discovered_at: String,
}

impl DiscoveryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            item_id: row.get(0)?,
            feed_id: row.get(1)?,
            title: row.get(2)?,
            published_at: row.get(3)?,
            discovered_at: row.get(4)?,
        })
    }

    fn into_record(self) -> std::result::Result<DiscoveryRecord, StorageError> {
        let discovered_at =
            parse_timestamp(&self.discovered_at).ok_or_else(|| StorageError::InvalidTimestamp {
                column: "discovered_at",
                value: self.discovered_at.clone(),
            })?;

        Ok(DiscoveryRecord {
            item_id: self.item_id,
            feed_id: self.feed_id,
            title: self.title,
            published_at: self.published_at.as_deref().and_then(parse_timestamp),
            discovered_at,
        })
    }
}
