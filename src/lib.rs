//! feedwatch - Large-fleet feed polling scheduler
//!
//! Watches hundreds of thousands of RSS/Atom feeds under one global request
//! budget, with per-feed adaptive intervals, conditional requests and a
//! durable first-discovery log.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`crawler`] - Rate limiter, conditional fetcher, dispatcher and workers
//! - [`parser`] - RSS/Atom payload parsing
//! - [`scheduler`] - Adaptive poll interval policy
//! - [`storage`] - Channel registry, item store, discovery export (SQLite)
//! - [`metrics`] - Prometheus metrics and progress snapshots
//! - [`seeder`] - Feed list loading
//! - [`models`] - Core data structures and types
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedwatch::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let db = Arc::new(Database::open(&config.database.sqlite_path)?);
//!     let registry = ChannelRegistry::new(Arc::clone(&db));
//!     registry.register("UCabcdefghijklmnopqrstuv")?;
//!     // build a ChannelWorker and Dispatcher, then run_bounded / run_continuous
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crawler;
pub mod error;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod scheduler;
pub mod seeder;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crawler::{
        ChannelWorker, ConditionalFetch, CycleOutcome, Dispatcher, DispatcherConfig, HttpFetcher,
        OutcomeCounts, RateLimiter,
    };
    pub use crate::error::{Error, ErrorCategory, Result, WatchErrorTrait};
    pub use crate::models::{Channel, DueChannel, FeedEntry, HttpClass};
    pub use crate::parser::{FeedParser, SyndicationParser};
    pub use crate::scheduler::IntervalPolicy;
    pub use crate::storage::{ChannelRegistry, Database, ItemStore};
}

// Direct re-exports for convenience
pub use models::{Channel, DueChannel, FeedEntry, HttpClass};
