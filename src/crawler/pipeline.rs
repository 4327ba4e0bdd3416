//! Dispatcher and worker pool driving the per-channel poll cycle
//!
//! Workers share one mpsc queue (receiver behind a mutex), one rate limiter
//! and the registry's reservation protocol. Nothing else is shared.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  reserve_due  ┌─────────────┐  mpsc   ┌─────────────┐
//! │  Registry   │──────────────▶│ Dispatcher  │────────▶│  Workers    │
//! └─────────────┘               └─────────────┘         └─────────────┘
//!        ▲                             │                       │
//!        │                        tick / report                │ acquire → fetch → parse
//!        │                             ▼                       │ → store → reschedule
//!        │                      ┌─────────────┐                │
//!        └──────────────────────│  Progress   │◀───────────────┘
//!          finalize/mark_error  └─────────────┘    outcome counters
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedwatch::crawler::pipeline::{ChannelWorker, Dispatcher, DispatcherConfig};
//! use feedwatch::crawler::{HttpFetcher, RateLimiter};
//! use feedwatch::parser::SyndicationParser;
//! use feedwatch::scheduler::IntervalPolicy;
//! use feedwatch::storage::{ChannelRegistry, Database, ItemStore};
//!
//! # async fn example() -> feedwatch::error::Result<()> {
//! let db = Arc::new(Database::open("data/rss_watch.sqlite")?);
//! let registry = ChannelRegistry::new(Arc::clone(&db));
//! let worker = ChannelWorker::new(
//!     registry.clone(),
//!     ItemStore::new(db),
//!     Arc::new(HttpFetcher::new("feedwatch", std::time::Duration::from_secs(20))?),
//!     Arc::new(SyndicationParser::new()),
//!     Arc::new(RateLimiter::new(15.0)),
//!     IntervalPolicy::default(),
//! );
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::default(), registry, worker);
//! let counts = dispatcher.run_bounded(800).await?;
//! println!("{} channels succeeded", counts.success);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::crawler::fetcher::{ConditionalFetch, FetchResponse};
use crate::crawler::rate_limit::RateLimiter;
use crate::error::{Error, Result, WatchErrorTrait};
use crate::metrics::{self, ProgressReporter};
use crate::models::{ChannelOutcome, DueChannel, HttpClass, Watermark};
use crate::parser::FeedParser;
use crate::scheduler::{IntervalInput, IntervalPolicy};
use crate::storage::{ChannelRegistry, ItemStore};
use crate::utils::truncate_text;

// ============================================================================
// Configuration
// ============================================================================

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent workers
    pub concurrency: usize,

    /// Target queue depth in continuous mode
    pub batch_size: usize,

    /// Interval between top-ups in continuous mode
    pub tick: Duration,

    /// Age after which a reservation is presumed abandoned and reclaimed
    pub reservation_lease: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 200,
            batch_size: 800,
            tick: Duration::from_secs(5),
            reservation_lease: Duration::from_secs(3600),
        }
    }
}

// ============================================================================
// Outcome Statistics
// ============================================================================

/// Result of one channel cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    NotModified,
    Success { new_items: usize },
    Gone,
    RateLimited,
    /// Transient server error, transport failure, or a cycle that could not complete
    Failed { class: HttpClass },
}

impl CycleOutcome {
    /// Classified HTTP outcome of the cycle
    pub fn class(&self) -> HttpClass {
        match self {
            Self::NotModified => HttpClass::NotModified,
            Self::Success { .. } => HttpClass::Success,
            Self::Gone => HttpClass::Gone,
            Self::RateLimited => HttpClass::RateLimited,
            Self::Failed { class } => *class,
        }
    }

    fn new_items(&self) -> usize {
        match self {
            Self::Success { new_items } => *new_items,
            _ => 0,
        }
    }
}

/// Outcome counters (thread-safe)
#[derive(Debug, Default)]
pub struct OutcomeStats {
    success: AtomicU64,
    not_modified: AtomicU64,
    new_items: AtomicU64,
    rate_limited: AtomicU64,
    gone: AtomicU64,
    error: AtomicU64,
}

impl OutcomeStats {
    /// Create new stats counter
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one finished cycle
    pub fn record(&self, outcome: &CycleOutcome) {
        let counter = match outcome {
            CycleOutcome::NotModified => &self.not_modified,
            CycleOutcome::Success { .. } => &self.success,
            CycleOutcome::Gone => &self.gone,
            CycleOutcome::RateLimited => &self.rate_limited,
            CycleOutcome::Failed { .. } => &self.error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.new_items
            .fetch_add(outcome.new_items() as u64, Ordering::Relaxed);
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> OutcomeCounts {
        OutcomeCounts {
            success: self.success.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            new_items: self.new_items.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            gone: self.gone.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
        }
    }

    /// Take the counters accumulated since the previous drain
    pub fn drain(&self) -> OutcomeCounts {
        OutcomeCounts {
            success: self.success.swap(0, Ordering::Relaxed),
            not_modified: self.not_modified.swap(0, Ordering::Relaxed),
            new_items: self.new_items.swap(0, Ordering::Relaxed),
            rate_limited: self.rate_limited.swap(0, Ordering::Relaxed),
            gone: self.gone.swap(0, Ordering::Relaxed),
            error: self.error.swap(0, Ordering::Relaxed),
        }
    }
}

/// Snapshot of outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub success: u64,
    pub not_modified: u64,
    /// Items seen for the first time (not channels)
    pub new_items: u64,
    pub rate_limited: u64,
    pub gone: u64,
    pub error: u64,
}

impl OutcomeCounts {
    /// Number of finished cycles
    pub fn cycles(&self) -> u64 {
        self.success + self.not_modified + self.rate_limited + self.gone + self.error
    }

    /// Add another snapshot into this one
    pub fn merge(&mut self, other: &OutcomeCounts) {
        self.success += other.success;
        self.not_modified += other.not_modified;
        self.new_items += other.new_items;
        self.rate_limited += other.rate_limited;
        self.gone += other.gone;
        self.error += other.error;
    }
}

// ============================================================================
// Channel Worker
// ============================================================================

/// Runs the fetch → parse → store → reschedule cycle for one channel
pub struct ChannelWorker {
    registry: ChannelRegistry,
    items: ItemStore,
    fetcher: Arc<dyn ConditionalFetch>,
    parser: Arc<dyn FeedParser>,
    limiter: Arc<RateLimiter>,
    policy: IntervalPolicy,
}

impl ChannelWorker {
    pub fn new(
        registry: ChannelRegistry,
        items: ItemStore,
        fetcher: Arc<dyn ConditionalFetch>,
        parser: Arc<dyn FeedParser>,
        limiter: Arc<RateLimiter>,
        policy: IntervalPolicy,
    ) -> Self {
        Self {
            registry,
            items,
            fetcher,
            parser,
            limiter,
            policy,
        }
    }

    /// Run one cycle for a reserved channel
    ///
    /// Never fails: any error inside the cycle is recorded on the channel
    /// through `mark_error`. If even that fails, the reservation stays set
    /// until its lease expires.
    pub async fn run_cycle(&self, channel: &DueChannel) -> CycleOutcome {
        match self.try_cycle(channel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_recoverable() {
                    tracing::warn!(
                        feed_id = %channel.feed_id,
                        category = e.category().as_str(),
                        error = %e,
                        "Channel cycle aborted"
                    );
                } else {
                    tracing::error!(
                        feed_id = %channel.feed_id,
                        category = e.category().as_str(),
                        error = %e,
                        "Channel cycle aborted"
                    );
                }
                let class = HttpClass::TransportError;
                if let Err(mark_err) = self.record_failure(channel, class, None, Utc::now()) {
                    tracing::error!(
                        feed_id = %channel.feed_id,
                        error = %mark_err,
                        "Failed to record channel error, reservation left in place"
                    );
                }
                CycleOutcome::Failed { class }
            }
        }
    }

    async fn try_cycle(&self, channel: &DueChannel) -> Result<CycleOutcome> {
        self.limiter.acquire().await;

        let started = Instant::now();
        let fetched = self
            .fetcher
            .fetch(
                &channel.feed_id,
                channel.freshness_token.as_deref(),
                channel.freshness_timestamp.as_deref(),
            )
            .await;
        let elapsed = started.elapsed().as_secs_f64();
        let now = Utc::now();

        let response = match fetched {
            Ok(response) => response,
            Err(e) => {
                metrics::observe_fetch(HttpClass::TransportError, elapsed);
                tracing::debug!(feed_id = %channel.feed_id, error = %e, "Transport failure");
                self.record_failure(channel, HttpClass::TransportError, None, now)?;
                return Ok(CycleOutcome::Failed {
                    class: HttpClass::TransportError,
                });
            }
        };
        metrics::observe_fetch(response.class, elapsed);

        match response.class {
            HttpClass::NotModified => {
                self.finish(channel, &response, None, false, now)?;
                Ok(CycleOutcome::NotModified)
            }
            HttpClass::Success => {
                let new_items = self.store_payload(channel, &response, now)?;
                Ok(CycleOutcome::Success { new_items })
            }
            HttpClass::Gone => {
                let backoff = self.policy.gone_backoff();
                self.registry.mark_error_at(
                    &channel.feed_id,
                    HttpClass::Gone,
                    Some(response.status),
                    backoff,
                    now,
                )?;
                tracing::warn!(
                    feed_id = %channel.feed_id,
                    status = response.status,
                    backoff,
                    "Feed gone"
                );
                Ok(CycleOutcome::Gone)
            }
            HttpClass::RateLimited => {
                let backoff = self.policy.rate_limited_backoff(&mut rand::thread_rng());
                self.registry.mark_error_at(
                    &channel.feed_id,
                    HttpClass::RateLimited,
                    Some(response.status),
                    backoff,
                    now,
                )?;
                tracing::warn!(feed_id = %channel.feed_id, backoff, "Rate limited by remote");
                Ok(CycleOutcome::RateLimited)
            }
            class @ (HttpClass::ServerError | HttpClass::TransportError) => {
                self.record_failure(channel, class, Some(response.status), now)?;
                Ok(CycleOutcome::Failed { class })
            }
        }
    }

    /// Store every entry of a 2xx payload, oldest first, then finalize
    fn store_payload(
        &self,
        channel: &DueChannel,
        response: &FetchResponse,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let entries = response
            .body
            .as_deref()
            .map(|body| self.parser.parse(body))
            .unwrap_or_default();

        let mut new_items = 0;
        for entry in &entries {
            if self.items.store_entry(&channel.feed_id, entry, now)? {
                new_items += 1;
                tracing::debug!(
                    feed_id = %channel.feed_id,
                    item_id = %entry.item_id,
                    title = %truncate_text(entry.title.as_deref().unwrap_or(""), 80),
                    "New item"
                );
            }
        }

        let watermark = if new_items > 0 {
            entries.last().map(|newest| Watermark {
                item_id: newest.item_id.clone(),
                published_at: newest.published_at,
            })
        } else {
            None
        };

        self.finish(channel, response, watermark, new_items > 0, now)?;
        Ok(new_items)
    }

    /// Finalize a success or not-modified cycle
    fn finish(
        &self,
        channel: &DueChannel,
        response: &FetchResponse,
        watermark: Option<Watermark>,
        had_new: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let input = IntervalInput {
            failures: 0,
            had_new,
            last_seen_published_at: channel.last_seen_published_at,
            base_interval_secs: channel.poll_interval_sec,
        };
        let next_interval = self
            .policy
            .next_interval(&input, now, &mut rand::thread_rng());

        let outcome = ChannelOutcome {
            http_status: Some(response.status),
            http_class: response.class,
            freshness_token: response.etag.clone(),
            freshness_timestamp: response.last_modified.clone(),
            watermark,
            next_interval_sec: next_interval,
            checked_at: now,
        };
        self.registry.finalize(&channel.feed_id, &outcome)?;

        tracing::debug!(
            feed_id = %channel.feed_id,
            outcome = %response.class,
            had_new,
            next_interval,
            "Channel finalized"
        );
        Ok(())
    }

    /// Record a failure that feeds the exponential backoff
    fn record_failure(
        &self,
        channel: &DueChannel,
        class: HttpClass,
        status: Option<u16>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let failures = channel.failures.saturating_add(1);
        let input = IntervalInput {
            failures,
            had_new: false,
            last_seen_published_at: channel.last_seen_published_at,
            base_interval_secs: channel.poll_interval_sec,
        };
        let backoff = self
            .policy
            .next_interval(&input, now, &mut rand::thread_rng());

        self.registry
            .mark_error_at(&channel.feed_id, class, status, backoff, now)?;

        tracing::warn!(
            feed_id = %channel.feed_id,
            outcome = %class,
            status,
            failures,
            backoff,
            "Channel check failed"
        );
        Ok(())
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Queue message
#[derive(Debug)]
enum WorkItem {
    Channel(DueChannel),
    Stop,
}

/// Fixed set of worker tasks draining one queue
struct WorkerPool {
    tx: mpsc::Sender<WorkItem>,
    handles: Vec<JoinHandle<()>>,
    queued: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
}

impl WorkerPool {
    fn spawn(
        concurrency: usize,
        capacity: usize,
        worker: Arc<ChannelWorker>,
        registry: ChannelRegistry,
        stats: Arc<OutcomeStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<WorkItem>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queued = Arc::new(AtomicUsize::new(0));
        let stopping = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(concurrency);

        for worker_id in 0..concurrency {
            let rx = Arc::clone(&rx);
            let worker = Arc::clone(&worker);
            let registry = registry.clone();
            let stats = Arc::clone(&stats);
            let queued = Arc::clone(&queued);
            let stopping = Arc::clone(&stopping);

            let handle = tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };

                    let channel = match item {
                        Some(WorkItem::Channel(channel)) => channel,
                        Some(WorkItem::Stop) | None => break,
                    };
                    queued.fetch_sub(1, Ordering::Relaxed);

                    // Abandon queued reservations once a stop was requested
                    if stopping.load(Ordering::Acquire) {
                        if let Err(e) = registry.release(&channel.feed_id) {
                            tracing::error!(
                                feed_id = %channel.feed_id,
                                error = %e,
                                "Failed to release reservation"
                            );
                        }
                        continue;
                    }

                    let outcome = worker.run_cycle(&channel).await;
                    stats.record(&outcome);
                    metrics::record_outcome(outcome.class(), outcome.new_items() as u64);
                }

                tracing::debug!(worker_id, "Worker shutting down");
            });

            handles.push(handle);
        }

        Self {
            tx,
            handles,
            queued,
            stopping,
        }
    }

    fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    async fn submit(&self, channel: DueChannel) -> std::result::Result<(), DueChannel> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(WorkItem::Channel(channel)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(item)) => {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                match item {
                    WorkItem::Channel(channel) => Err(channel),
                    WorkItem::Stop => unreachable!("only channels are submitted"),
                }
            }
        }
    }

    /// Send one stop sentinel per worker and wait for all of them
    ///
    /// With `abandon_queued`, channels still in the queue are released
    /// instead of fetched.
    async fn shutdown(self, abandon_queued: bool) {
        if abandon_queued {
            self.stopping.store(true, Ordering::Release);
        }

        for _ in 0..self.handles.len() {
            if self.tx.send(WorkItem::Stop).await.is_err() {
                break;
            }
        }
        drop(self.tx);

        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Reserves due channels and feeds them to the worker pool
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: ChannelRegistry,
    worker: Arc<ChannelWorker>,
    stats: Arc<OutcomeStats>,
    reporter: Option<ProgressReporter>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, registry: ChannelRegistry, worker: ChannelWorker) -> Self {
        Self {
            config,
            registry,
            worker: Arc::new(worker),
            stats: OutcomeStats::new(),
            reporter: None,
        }
    }

    /// Publish a progress snapshot on every tick and at the end of each run
    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Live outcome counters
    pub fn stats(&self) -> Arc<OutcomeStats> {
        Arc::clone(&self.stats)
    }

    fn spawn_pool(&self, capacity: usize) -> WorkerPool {
        WorkerPool::spawn(
            self.config.concurrency.max(1),
            capacity,
            Arc::clone(&self.worker),
            self.registry.clone(),
            Arc::clone(&self.stats),
        )
    }

    /// Reserve up to `limit` due channels once and process all of them
    ///
    /// Returns the aggregate counters of this run. Fails only when the
    /// registry cannot be used at all.
    pub async fn run_bounded(&self, limit: usize) -> Result<OutcomeCounts> {
        self.registry.release_expired(self.config.reservation_lease)?;
        let due = self.registry.reserve_due(limit)?;

        tracing::info!(
            reserved = due.len(),
            limit,
            workers = self.config.concurrency,
            "Starting bounded run"
        );

        let pool = self.spawn_pool(due.len() + self.config.concurrency);
        let mut unsent = Vec::new();
        for channel in due {
            if let Err(channel) = pool.submit(channel).await {
                unsent.push(channel);
            }
        }
        pool.shutdown(false).await;
        self.release_all(&unsent);

        let counts = self.stats.drain();
        tracing::info!(
            success = counts.success,
            not_modified = counts.not_modified,
            new_items = counts.new_items,
            rate_limited = counts.rate_limited,
            gone = counts.gone,
            error = counts.error,
            "Bounded run completed"
        );

        if let Some(reporter) = &self.reporter {
            reporter.report(counts, 0, None);
        }
        Ok(counts)
    }

    /// Keep the queue topped up on every tick until `shutdown` turns true
    ///
    /// A tick that cannot reach the registry is counted and reported, and the
    /// loop carries on. On stop, queued channels are released unfetched and
    /// the cycles already running are allowed to finish.
    pub async fn run_continuous(&self, mut shutdown: watch::Receiver<bool>) -> Result<OutcomeCounts> {
        tracing::info!(
            workers = self.config.concurrency,
            batch_size = self.config.batch_size,
            tick_secs = self.config.tick.as_secs_f64(),
            "Starting continuous run"
        );

        let pool = self.spawn_pool(self.config.batch_size + self.config.concurrency);
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut total = OutcomeCounts::default();
        let mut tick_failures = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let tick_error = match self.top_up(&pool).await {
                Ok(reserved) => {
                    tick_failures = 0;
                    if reserved > 0 {
                        tracing::info!(reserved, queued = pool.queued(), "Queue topped up");
                    }
                    None
                }
                Err(e) => {
                    tick_failures += 1;
                    metrics::record_tick_failure();
                    if e.is_recoverable() {
                        tracing::warn!(error = %e, tick_failures, "Dispatcher tick failed");
                    } else {
                        tracing::error!(error = %e, tick_failures, "Dispatcher tick failed");
                    }
                    Some(e.to_string())
                }
            };

            let batch = self.stats.drain();
            total.merge(&batch);
            if let Some(reporter) = &self.reporter {
                reporter.report(batch, tick_failures, tick_error);
            }
        }

        tracing::info!(queued = pool.queued(), "Stopping, releasing queued channels");
        pool.shutdown(true).await;

        let batch = self.stats.drain();
        total.merge(&batch);
        if let Some(reporter) = &self.reporter {
            reporter.report(batch, tick_failures, None);
        }

        tracing::info!(cycles = total.cycles(), new_items = total.new_items, "Continuous run stopped");
        Ok(total)
    }

    /// Reserve enough due channels to bring the queue back to `batch_size`
    ///
    /// Reservations abandoned by a crashed process become due again here
    /// once their lease has run out.
    async fn top_up(&self, pool: &WorkerPool) -> Result<usize> {
        self.registry.release_expired(self.config.reservation_lease)?;

        let depth = pool.queued();
        if depth >= self.config.batch_size {
            return Ok(0);
        }

        let due = self.registry.reserve_due(self.config.batch_size - depth)?;
        let reserved = due.len();

        let mut due = due.into_iter();
        while let Some(channel) = due.next() {
            if let Err(channel) = pool.submit(channel).await {
                let mut unsent = vec![channel];
                unsent.extend(due);
                self.release_all(&unsent);
                return Err(Error::dispatcher("worker queue closed"));
            }
        }

        Ok(reserved)
    }

    fn release_all(&self, channels: &[DueChannel]) {
        for channel in channels {
            if let Err(e) = self.registry.release(&channel.feed_id) {
                tracing::error!(feed_id = %channel.feed_id, error = %e, "Failed to release reservation");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
