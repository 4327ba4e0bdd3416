// Core data structures for the feed watcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default carried-forward poll interval for a freshly registered channel
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3600;

/// Classified result of one conditional fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpClass {
    /// 304: nothing changed since the replayed validators
    NotModified,
    /// 2xx with a payload
    Success,
    /// 403 / 404 / 410: the feed is removed or forbidden
    Gone,
    /// 429: the remote is throttling us
    RateLimited,
    /// 5xx and any other unexpected status
    ServerError,
    /// No response was obtained at all
    TransportError,
}

impl HttpClass {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            304 => Self::NotModified,
            200..=299 => Self::Success,
            403 | 404 | 410 => Self::Gone,
            429 => Self::RateLimited,
            _ => Self::ServerError,
        }
    }

    /// Whether `mark_error` should bump the consecutive-failure counter
    ///
    /// Remote throttling is fleet-wide and says nothing about the feed itself.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::RateLimited | Self::Success | Self::NotModified)
    }

    /// Whether this class resets the failure counter
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::NotModified)
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotModified => "not_modified",
            Self::Success => "success",
            Self::Gone => "gone",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::TransportError => "transport_error",
        }
    }
}

impl std::fmt::Display for HttpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HttpClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "not_modified" => Self::NotModified,
            "success" => Self::Success,
            "gone" => Self::Gone,
            "rate_limited" => Self::RateLimited,
            "server_error" => Self::ServerError,
            "transport_error" => Self::TransportError,
            other => return Err(format!("unknown http class: {other}")),
        })
    }
}

/// Scheduling record for one watched feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub feed_id: String,
    pub freshness_token: Option<String>,
    pub freshness_timestamp: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_http_status: Option<u16>,
    pub last_http_class: Option<HttpClass>,
    pub failures: u32,
    pub next_poll_at: DateTime<Utc>,
    pub poll_interval_sec: u64,
    pub last_seen_item_id: Option<String>,
    pub last_seen_published_at: Option<DateTime<Utc>>,
    pub inflight: bool,
    pub disabled: bool,
}

/// Fields handed to a worker when a channel is reserved
#[derive(Debug, Clone, PartialEq)]
pub struct DueChannel {
    pub feed_id: String,
    pub freshness_token: Option<String>,
    pub freshness_timestamp: Option<String>,
    pub poll_interval_sec: u64,
    pub failures: u32,
    pub last_seen_published_at: Option<DateTime<Utc>>,
}

/// One entry of a parsed feed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub item_id: String,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Deduplicated item row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub feed_id: String,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Attach a parsed entry to the feed it came from
    pub fn from_entry(feed_id: &str, entry: &FeedEntry) -> Self {
        Self {
            item_id: entry.item_id.clone(),
            feed_id: feed_id.to_string(),
            title: entry.title.clone(),
            published_at: entry.published_at,
        }
    }
}

/// Append-only record of the first time an item was observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub item_id: String,
    pub feed_id: String,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

/// Most recent item observed on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub item_id: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Result of a successful or not-modified cycle, applied by `finalize`
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOutcome {
    pub http_status: Option<u16>,
    pub http_class: HttpClass,
    /// New validators; `None` keeps the stored ones
    pub freshness_token: Option<String>,
    pub freshness_timestamp: Option<String>,
    /// New watermark; `None` keeps the stored one
    pub watermark: Option<Watermark>,
    pub next_interval_sec: u64,
    pub checked_at: DateTime<Utc>,
}
