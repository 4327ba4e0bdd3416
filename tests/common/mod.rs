//! Common test utilities

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedwatch::crawler::{ChannelWorker, ConditionalFetch, FetchResponse, RateLimiter};
use feedwatch::error::FetchError;
use feedwatch::models::{Channel, DueChannel};
use feedwatch::parser::SyndicationParser;
use feedwatch::scheduler::IntervalPolicy;
use feedwatch::storage::{ChannelRegistry, Database, ItemStore};
use feedwatch::utils::format_timestamp;

pub const CHANNEL_ID: &str = "UCabcdefghijklmnopqrstuv";

/// In-memory database with registry and item store handles
pub fn setup() -> (ChannelRegistry, ItemStore) {
    let db = Arc::new(Database::in_memory().unwrap());
    (ChannelRegistry::new(Arc::clone(&db)), ItemStore::new(db))
}

/// YouTube-style Atom document; entries are `(video_id, published_at)`, newest first
pub fn atom_feed(entries: &[(&str, DateTime<Utc>)]) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
  <id>yt:channel:abcdefghijklmnopqrstuv</id>
  <title>Test Channel</title>
  <updated>2026-01-01T00:00:00+00:00</updated>
"#,
    );
    for (video_id, published) in entries {
        body.push_str(&format!(
            r#"  <entry>
    <id>yt:video:{video_id}</id>
    <yt:videoId>{video_id}</yt:videoId>
    <title>Video {video_id}</title>
    <published>{published}</published>
    <updated>{published}</updated>
  </entry>
"#,
            published = format_timestamp(*published),
        ));
    }
    body.push_str("</feed>\n");
    body
}

/// 200 response carrying a payload and an ETag
pub fn ok_response(body: String, etag: &str) -> FetchResponse {
    FetchResponse {
        body: Some(body),
        etag: Some(etag.to_string()),
        ..FetchResponse::status_only(200)
    }
}

/// Validators seen by one fetch call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub feed_id: String,
    pub token: Option<String>,
    pub timestamp: Option<String>,
}

/// Fetcher that replays scripted responses; an empty script answers 304
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<FetchResponse, FetchError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
    in_progress: Mutex<HashMap<String, usize>>,
    max_overlap: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call sleeps for `delay` before answering
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn push(&self, response: FetchResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_status(&self, status: u16) {
        self.push(FetchResponse::status_only(status));
    }

    pub fn push_error(&self, error: FetchError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Most fetches of a single feed ever running at the same time
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConditionalFetch for ScriptedFetcher {
    async fn fetch(
        &self,
        feed_id: &str,
        freshness_token: Option<&str>,
        freshness_timestamp: Option<&str>,
    ) -> Result<FetchResponse, FetchError> {
        self.calls.lock().unwrap().push(RecordedCall {
            feed_id: feed_id.to_string(),
            token: freshness_token.map(str::to_string),
            timestamp: freshness_timestamp.map(str::to_string),
        });

        {
            let mut running = self.in_progress.lock().unwrap();
            let count = running.entry(feed_id.to_string()).or_insert(0);
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(count) = self.in_progress.lock().unwrap().get_mut(feed_id) {
            *count -= 1;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(FetchResponse::status_only(304)))
    }
}

/// Worker over the given stores with a generous rate limit
pub fn worker(
    registry: &ChannelRegistry,
    items: &ItemStore,
    fetcher: Arc<ScriptedFetcher>,
) -> ChannelWorker {
    ChannelWorker::new(
        registry.clone(),
        items.clone(),
        fetcher,
        Arc::new(SyndicationParser::new()),
        Arc::new(RateLimiter::new(1000.0)),
        IntervalPolicy::default(),
    )
}

/// Reserve a single registered channel regardless of its due time
#[allow(dead_code)]
pub fn reserve_one(registry: &ChannelRegistry) -> DueChannel {
    let far_future = Utc::now() + chrono::Duration::days(400);
    let mut due = registry.reserve_due_at(1, far_future).unwrap();
    assert_eq!(due.len(), 1, "expected exactly one reservable channel");
    due.remove(0)
}

/// Seconds between the last check and the scheduled next poll
#[allow(dead_code)]
pub fn scheduled_delay(channel: &Channel) -> i64 {
    let checked = channel.last_checked_at.expect("channel was checked");
    (channel.next_poll_at - checked).num_seconds()
}

/// Jitter bounds around a nominal delay
#[allow(dead_code)]
pub fn assert_jittered(delay: i64, nominal: u64) {
    let low = (nominal as f64 * 0.8) as i64 - 1;
    let high = (nominal as f64 * 1.2) as i64 + 1;
    assert!(
        (low..=high).contains(&delay),
        "delay {delay} outside jitter bounds of {nominal} ({low}..={high})"
    );
}
