//! Spacing between retries of a failing chain step.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// An ordered, non-decreasing table of retry intervals. Attempt `k`
/// (1-based) waits `intervals[k - 1]`; attempts past the end of the table
/// keep waiting the last entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            intervals: vec![
                Duration::from_secs(60),
                Duration::from_secs(10 * 60),
                Duration::from_secs(30 * 60),
                Duration::from_secs(60 * 60),
                Duration::from_secs(2 * 60 * 60),
            ],
        }
    }
}

impl RetryPolicy {
    /// Build a policy from a table. Entries are sorted so the schedule can
    /// never shrink as failures accumulate; an empty table retries
    /// immediately.
    pub fn new(mut intervals: Vec<Duration>) -> Self {
        intervals.sort();
        Self { intervals }
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// Minimum wait after the `retry_counter`-th consecutive failure.
    pub fn interval(&self, retry_counter: i64) -> Duration {
        if retry_counter <= 0 {
            return Duration::ZERO;
        }
        let index = usize::try_from(retry_counter - 1).unwrap_or(usize::MAX);
        self.intervals
            .get(index)
            .or_else(|| self.intervals.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// A bundle with no failures is always due. Otherwise it is due once
    /// the interval for its failure count has passed since `last_updated_at`.
    pub fn is_time_to_retry(
        &self,
        retry_counter: i64,
        last_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if retry_counter <= 0 {
            return true;
        }
        let elapsed = (now - last_updated_at).to_std().unwrap_or(Duration::ZERO);
        elapsed >= self.interval(retry_counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn fresh_bundle_is_always_due() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert!(policy.is_time_to_retry(0, now, now));
        assert!(policy.is_time_to_retry(0, now + ChronoDuration::hours(1), now));
    }

    #[test]
    fn intervals_follow_the_table_and_clamp() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval(1), Duration::from_secs(60));
        assert_eq!(policy.interval(2), Duration::from_secs(600));
        assert_eq!(policy.interval(5), Duration::from_secs(7200));
        assert_eq!(policy.interval(50), Duration::from_secs(7200));
    }

    #[test]
    fn due_only_after_interval_elapsed() {
        let policy = RetryPolicy::default();
        let updated = Utc::now();
        assert!(!policy.is_time_to_retry(1, updated, updated + ChronoDuration::seconds(59)));
        assert!(policy.is_time_to_retry(1, updated, updated + ChronoDuration::seconds(60)));
        assert!(!policy.is_time_to_retry(2, updated, updated + ChronoDuration::seconds(60)));
    }

    #[test]
    fn higher_counters_never_retry_sooner() {
        let policy = RetryPolicy::default();
        let updated = Utc::now();
        for k in 1..10 {
            assert!(policy.interval(k) <= policy.interval(k + 1));
            for secs in [0, 59, 60, 599, 600, 1800, 3600, 7200] {
                let now = updated + ChronoDuration::seconds(secs);
                if policy.is_time_to_retry(k + 1, updated, now) {
                    assert!(policy.is_time_to_retry(k, updated, now), "k={k} secs={secs}");
                }
            }
        }
    }

    #[test]
    fn unsorted_table_is_normalized() {
        let policy = RetryPolicy::new(vec![Duration::from_secs(30), Duration::from_secs(5)]);
        assert_eq!(policy.interval(1), Duration::from_secs(5));
        assert_eq!(policy.interval(3), Duration::from_secs(30));
        assert_eq!(RetryPolicy::new(Vec::new()).interval(4), Duration::ZERO);
    }
}
