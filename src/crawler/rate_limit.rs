//! Fleet-wide request rate limiter
//!
//! A single token bucket shared by every worker. Tokens refill continuously
//! at `requests_per_second`; the bucket holds at most one second's worth.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};

/// Lowest rate the limiter will accept
pub const MIN_REQUESTS_PER_SECOND: f64 = 1.0;

/// Shared token bucket
pub struct RateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    rate: f64,
}

impl RateLimiter {
    /// Create a limiter; rates below one request per second are raised to one
    pub fn new(requests_per_second: f64) -> Self {
        let rate = if requests_per_second.is_finite() {
            requests_per_second.max(MIN_REQUESTS_PER_SECOND)
        } else {
            MIN_REQUESTS_PER_SECOND
        };

        let burst = NonZeroU32::new(rate.ceil() as u32).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rate))
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            inner: GovernorLimiter::direct(quota),
            rate,
        }
    }

    /// Wait until one request may be sent
    ///
    /// Callers are served as tokens become available; there is no per-caller
    /// budget.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Effective rate after flooring
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("rate", &self.rate).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_rate_floor() {
        assert_eq!(RateLimiter::new(0.2).rate(), 1.0);
        assert_eq!(RateLimiter::new(-5.0).rate(), 1.0);
        assert_eq!(RateLimiter::new(f64::NAN).rate(), 1.0);
        assert_eq!(RateLimiter::new(15.0).rate(), 15.0);
    }

    #[tokio::test]
    async fn test_sustained_rate_is_bounded() {
        let limiter = Arc::new(RateLimiter::new(20.0));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..15 {
                    limiter.acquire().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 20 burst tokens, the remaining 40 need two more seconds
        assert!(start.elapsed() >= Duration::from_millis(1900));
    }

    #[tokio::test]
    async fn test_burst_is_immediate() {
        let limiter = RateLimiter::new(10.0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
