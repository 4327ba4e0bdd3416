//! Adaptive poll interval policy
//!
//! Computes how long a channel should rest before its next check, from the
//! outcome of the current cycle and the channel's activity history:
//!
//! - failures back off exponentially from a 5 minute base, capped at 6 hours
//! - a cycle that found new items is re-checked within 5 to 15 minutes
//! - otherwise the age of the newest known item picks an activity tier
//!
//! Every result except the fixed "gone" backoff is perturbed by a uniform
//! jitter factor so thousands of channels registered together drift apart.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::DEFAULT_POLL_INTERVAL_SECS;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Longest delay any configured interval may ask for
pub const MAX_INTERVAL_SECS: u64 = 365 * DAY;

/// Largest jitter factor accepted by `validate`
const MAX_JITTER: f64 = 10.0;

/// One activity tier: items younger than `max_age_secs` map to `interval_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityTier {
    pub max_age_secs: u64,
    pub interval_secs: u64,
}

/// Inputs to a single interval decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalInput {
    /// Consecutive failures including the current cycle
    pub failures: u32,
    /// Whether this cycle discovered at least one new item
    pub had_new: bool,
    /// Publish time of the newest item known for the channel
    pub last_seen_published_at: Option<DateTime<Utc>>,
    /// Interval carried forward from the previous cycle
    pub base_interval_secs: u64,
}

/// Interval policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalPolicy {
    /// Base delay for the first failure
    pub failure_base_secs: u64,

    /// Growth factor per consecutive failure
    pub failure_multiplier: f64,

    /// Failures beyond this count stop growing the backoff
    pub failure_max_exponent: u32,

    /// Upper bound on any failure backoff
    pub failure_cap_secs: u64,

    /// Range sampled when a cycle found new items
    pub active_min_secs: u64,
    pub active_max_secs: u64,

    /// Tiers ordered by ascending `max_age_secs`
    pub tiers: Vec<ActivityTier>,

    /// Interval for items older than every tier
    pub dormant_interval_secs: u64,

    /// Jitter factor bounds
    pub jitter_min: f64,
    pub jitter_max: f64,

    /// Fixed backoff for removed / forbidden feeds
    pub gone_backoff_secs: u64,

    /// Backoff (before jitter) when the remote answers 429
    pub rate_limited_backoff_secs: u64,
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self {
            failure_base_secs: 300,
            failure_multiplier: 1.9,
            failure_max_exponent: 6,
            failure_cap_secs: 6 * HOUR,
            active_min_secs: 300,
            active_max_secs: 900,
            tiers: vec![
                ActivityTier {
                    max_age_secs: DAY,
                    interval_secs: 900,
                },
                ActivityTier {
                    max_age_secs: 7 * DAY,
                    interval_secs: 1800,
                },
                ActivityTier {
                    max_age_secs: 30 * DAY,
                    interval_secs: 2 * HOUR,
                },
            ],
            dormant_interval_secs: 12 * HOUR,
            jitter_min: 0.8,
            jitter_max: 1.2,
            gone_backoff_secs: DAY,
            rate_limited_backoff_secs: 15 * 60,
        }
    }
}

impl IntervalPolicy {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_base_secs == 0 {
            return Err("failure_base_secs must be greater than 0".to_string());
        }
        if !(self.failure_multiplier.is_finite() && self.failure_multiplier >= 1.0) {
            return Err("failure_multiplier must be a finite number of at least 1.0".to_string());
        }
        if self.active_min_secs > self.active_max_secs {
            return Err("active_min_secs must not exceed active_max_secs".to_string());
        }
        if !(self.jitter_min > 0.0 && self.jitter_min <= self.jitter_max) {
            return Err("jitter bounds must satisfy 0 < jitter_min <= jitter_max".to_string());
        }
        if self.jitter_max > MAX_JITTER {
            return Err(format!("jitter_max must not exceed {MAX_JITTER}"));
        }

        // Keeps every next_poll_at representable once jitter is applied
        let bounded = [
            ("failure_base_secs", self.failure_base_secs),
            ("failure_cap_secs", self.failure_cap_secs),
            ("active_max_secs", self.active_max_secs),
            ("dormant_interval_secs", self.dormant_interval_secs),
            ("gone_backoff_secs", self.gone_backoff_secs),
            ("rate_limited_backoff_secs", self.rate_limited_backoff_secs),
        ];
        let tier_intervals = self.tiers.iter().map(|t| ("tier interval_secs", t.interval_secs));
        if let Some((name, _)) = bounded
            .into_iter()
            .chain(tier_intervals)
            .find(|(_, secs)| *secs > MAX_INTERVAL_SECS)
        {
            return Err(format!("{name} must not exceed {MAX_INTERVAL_SECS} seconds"));
        }

        if self
            .tiers
            .windows(2)
            .any(|w| w[0].max_age_secs >= w[1].max_age_secs)
        {
            return Err("tiers must be ordered by ascending max_age_secs".to_string());
        }
        Ok(())
    }

    /// Compute the next delay in seconds
    pub fn next_interval<R: Rng + ?Sized>(
        &self,
        input: &IntervalInput,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> u64 {
        if input.failures > 0 {
            return self.jittered(self.nominal_failure_backoff(input.failures), rng);
        }

        if input.had_new {
            return rng.gen_range(self.active_min_secs..=self.active_max_secs);
        }

        match input.last_seen_published_at {
            Some(published) => self.jittered(self.tier_interval(published, now), rng),
            None => {
                let base = if input.base_interval_secs == 0 {
                    DEFAULT_POLL_INTERVAL_SECS
                } else {
                    input.base_interval_secs.min(MAX_INTERVAL_SECS)
                };
                self.jittered(base, rng)
            }
        }
    }

    /// Failure backoff before jitter: `min(cap, base * multiplier^min(failures, max_exp))`
    pub fn nominal_failure_backoff(&self, failures: u32) -> u64 {
        let exponent = failures.min(self.failure_max_exponent) as i32;
        let backoff = self.failure_base_secs as f64 * self.failure_multiplier.powi(exponent);
        (backoff as u64).min(self.failure_cap_secs)
    }

    /// Activity tier interval before jitter for a given watermark age
    pub fn tier_interval(&self, last_published: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
        // Items dated in the future count as brand new
        let age = (now - last_published).num_seconds().max(0) as u64;

        self.tiers
            .iter()
            .find(|tier| age < tier.max_age_secs)
            .map(|tier| tier.interval_secs)
            .unwrap_or(self.dormant_interval_secs)
    }

    /// Fixed backoff for a removed or forbidden feed
    pub fn gone_backoff(&self) -> u64 {
        self.gone_backoff_secs
    }

    /// Backoff for a remote 429, independent of the failure counter
    pub fn rate_limited_backoff<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        self.jittered(self.rate_limited_backoff_secs, rng)
    }

    fn jittered<R: Rng + ?Sized>(&self, secs: u64, rng: &mut R) -> u64 {
        let factor = rng.gen_range(self.jitter_min..=self.jitter_max);
        (secs as f64 * factor) as u64
    }
}
