//! Atom and RSS 2.0 payload parsing

use chrono::{DateTime, Utc};

use super::FeedParser;
use crate::models::FeedEntry;
use crate::utils::error::ParseError;
use crate::utils::parse_timestamp;

/// Prefix YouTube puts in front of the video id in `<id>`
const YT_VIDEO_ID_PREFIX: &str = "yt:video:";

/// Parser for Atom documents with an RSS 2.0 fallback
#[derive(Debug, Clone, Copy, Default)]
pub struct SyndicationParser;

impl SyndicationParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_atom(payload: &str) -> Option<Vec<FeedEntry>> {
        let feed = atom_syndication::Feed::read_from(payload.as_bytes()).ok()?;

        let entries = feed
            .entries()
            .iter()
            .filter_map(|entry| {
                let item_id = youtube_video_id(entry).or_else(|| {
                    let id = entry.id().trim();
                    (!id.is_empty())
                        .then(|| id.strip_prefix(YT_VIDEO_ID_PREFIX).unwrap_or(id).to_string())
                })?;

                let title = non_empty(&entry.title().value);
                let published_at = entry
                    .published()
                    .map(|dt| dt.with_timezone(&Utc))
                    .or_else(|| Some(entry.updated().with_timezone(&Utc)));

                Some(FeedEntry {
                    item_id,
                    title,
                    published_at,
                })
            })
            .collect();

        Some(entries)
    }

    fn parse_rss(payload: &str) -> Option<Vec<FeedEntry>> {
        let channel = rss::Channel::read_from(payload.as_bytes()).ok()?;

        let entries = channel
            .items()
            .iter()
            .filter_map(|item| {
                let item_id = item
                    .guid()
                    .map(|g| g.value())
                    .or_else(|| item.link())
                    .and_then(non_empty)?;

                Some(FeedEntry {
                    item_id,
                    title: item.title().and_then(non_empty),
                    published_at: item.pub_date().and_then(parse_timestamp),
                })
            })
            .collect();

        Some(entries)
    }
}

impl FeedParser for SyndicationParser {
    fn try_parse(&self, payload: &str) -> Result<Vec<FeedEntry>, ParseError> {
        if payload.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let entries = Self::parse_atom(payload)
            .or_else(|| Self::parse_rss(payload))
            .ok_or(ParseError::UnknownFormat)?;

        Ok(oldest_first(entries))
    }
}

/// `<yt:videoId>` extension value, if present
fn youtube_video_id(entry: &atom_syndication::Entry) -> Option<String> {
    let yt = entry.extensions().get("yt")?;
    yt.get("videoId")
        .or_else(|| yt.get("yt:videoId"))?
        .first()?
        .value()
        .and_then(non_empty)
}

/// Order entries oldest to newest
///
/// Feeds list newest first, so document order is reversed. When every entry
/// carries a date the result is additionally sorted by it; the sort is
/// stable, so undated ties keep the reversed document order.
fn oldest_first(mut entries: Vec<FeedEntry>) -> Vec<FeedEntry> {
    entries.reverse();
    if entries.iter().all(|e| e.published_at.is_some()) {
        entries.sort_by_key(|e| e.published_at.unwrap_or(DateTime::<Utc>::MIN_UTC));
    }
    entries
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
