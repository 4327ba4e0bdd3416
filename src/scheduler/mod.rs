//! Poll scheduling policy
//!
//! Decides *when* each channel is checked next. The policy is a pure function
//! of the cycle outcome and the channel's history; all persistence lives in
//! [`crate::storage::registry`] and all execution in [`crate::crawler::pipeline`].
//!
//! # Schedule shape
//!
//! | Situation | Next check (before jitter) |
//! |-----------|----------------------------|
//! | `failures > 0` | `min(6h, 5min * 1.9^min(failures, 6))` |
//! | new items found | uniform in 5..=15 min |
//! | newest item < 24h old | 15 min |
//! | newest item < 7d old | 30 min |
//! | newest item < 30d old | 2 h |
//! | older | 12 h |
//! | no item ever seen | carried-forward interval (default 1 h) |
//! | remote 429 | 15 min |
//! | feed gone (403/404/410) | 24 h, no jitter |

pub mod interval;

pub use interval::{ActivityTier, IntervalInput, IntervalPolicy};
