//! Property tests for the interval policy

use chrono::{Duration, TimeZone, Utc};
use feedwatch::scheduler::{IntervalInput, IntervalPolicy};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

const SIX_HOURS: u64 = 6 * 3600;

proptest! {
    #[test]
    fn failure_backoff_is_monotonic_and_capped(failures in 0u32..200) {
        let policy = IntervalPolicy::default();
        let current = policy.nominal_failure_backoff(failures);
        let next = policy.nominal_failure_backoff(failures + 1);
        prop_assert!(next >= current);
        prop_assert!(current <= SIX_HOURS);
    }

    #[test]
    fn failure_interval_stays_within_jittered_cap(
        failures in 1u32..100,
        had_new in any::<bool>(),
        seed in any::<u64>(),
    ) {
        let policy = IntervalPolicy::default();
        let now = Utc::now();
        let input = IntervalInput {
            failures,
            had_new,
            last_seen_published_at: Some(now - Duration::hours(1)),
            base_interval_secs: 3600,
        };
        let value = policy.next_interval(&input, now, &mut StdRng::seed_from_u64(seed));
        prop_assert!(value >= 240, "{} below the jittered base", value);
        prop_assert!(value as f64 <= SIX_HOURS as f64 * 1.2, "{} above the jittered cap", value);
    }

    #[test]
    fn new_items_recheck_within_active_range(seed in any::<u64>(), age_days in 0i64..400) {
        let policy = IntervalPolicy::default();
        let now = Utc::now();
        let input = IntervalInput {
            failures: 0,
            had_new: true,
            last_seen_published_at: Some(now - Duration::days(age_days)),
            base_interval_secs: 3600,
        };
        let value = policy.next_interval(&input, now, &mut StdRng::seed_from_u64(seed));
        prop_assert!((300..=900).contains(&value));
    }

    #[test]
    fn older_watermarks_never_poll_faster(a in 0i64..100_000_000, b in 0i64..100_000_000) {
        let policy = IntervalPolicy::default();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let (young, old) = if a <= b { (a, b) } else { (b, a) };
        let young_interval = policy.tier_interval(now - Duration::seconds(young), now);
        let old_interval = policy.tier_interval(now - Duration::seconds(old), now);
        prop_assert!(old_interval >= young_interval);
    }
}
