//! Feed polling with a fleet-wide rate limit
//!
//! This module implements the outbound side of the watcher: the shared
//! token bucket, the conditional HTTP fetch, and the dispatcher/worker pool
//! that runs the per-channel cycle.

pub mod fetcher;
pub mod pipeline;
pub mod rate_limit;

pub use fetcher::{ConditionalFetch, FetchResponse, HttpFetcher};
pub use pipeline::{
    ChannelWorker, CycleOutcome, Dispatcher, DispatcherConfig, OutcomeCounts, OutcomeStats,
};
pub use rate_limit::RateLimiter;
