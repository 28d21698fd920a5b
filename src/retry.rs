//! Retry Policy: attempt count -> next-attempt delay.

use rand::Rng;

use crate::model::{RetryPolicyOverride, WorkItem};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub backoff_base_seconds: f64,
    pub backoff_jitter_seconds: f64,
}

impl RetryPolicy {
    pub fn for_work_item(default: RetryPolicy, work_item: &WorkItem) -> RetryPolicy {
        RetryPolicy {
            max_retries: work_item.max_retries.unwrap_or(default.max_retries),
            backoff_base_seconds: work_item
                .backoff_base_seconds
                .unwrap_or(default.backoff_base_seconds),
            backoff_jitter_seconds: work_item
                .backoff_jitter_seconds
                .unwrap_or(default.backoff_jitter_seconds),
        }
    }

    pub fn from_override(o: &RetryPolicyOverride) -> RetryPolicy {
        RetryPolicy {
            max_retries: o.max_retries,
            backoff_base_seconds: o.backoff_base_seconds,
            backoff_jitter_seconds: o.backoff_jitter_seconds,
        }
    }

    /// `delay = B * 2^(n-1) + uniform(0, J)` for attempt `n >= 1`.
    pub fn delay_seconds(&self, attempt_n: i32) -> f64 {
        debug_assert!(attempt_n >= 1);
        let base = self.backoff_base_seconds * 2f64.powi(attempt_n - 1);
        let jitter = if self.backoff_jitter_seconds > 0.0 {
            rand::thread_rng().gen_range(0.0..self.backoff_jitter_seconds)
        } else {
            0.0
        };
        base + jitter
    }

    /// Whether a run at this (1-indexed) attempt number that just failed may
    /// still be retried, i.e. the lifetime failed-run count would stay
    /// within `max_retries + 1`.
    pub fn budget_remains(&self, attempt_n: i32) -> bool {
        attempt_n <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: f64, jitter: f64, max_retries: i32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base_seconds: base,
            backoff_jitter_seconds: jitter,
        }
    }

    #[test]
    fn delay_doubles_with_each_attempt_at_zero_jitter() {
        let p = policy(1.0, 0.0, 5);
        assert_eq!(p.delay_seconds(1), 1.0);
        assert_eq!(p.delay_seconds(2), 2.0);
        assert_eq!(p.delay_seconds(3), 4.0);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let p = policy(1.0, 0.5, 5);
        for _ in 0..100 {
            let d = p.delay_seconds(1);
            assert!((1.0..1.5).contains(&d), "delay {d} out of bound");
        }
    }

    #[test]
    fn exhausted_budget_blocks_further_retry() {
        let p = policy(1.0, 0.0, 2);
        assert!(p.budget_remains(1));
        assert!(p.budget_remains(2));
        assert!(!p.budget_remains(3));
    }
}
