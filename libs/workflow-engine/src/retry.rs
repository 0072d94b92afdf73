//! Retry policy (§4.9): eligibility and backoff math for a work item that
//! reported `NotCompleted`.
//!
//! Grounded on the teacher's `consensus` backoff helpers, which use
//! `backoff::ExponentialBackoff` for the external-call retry loop; here the
//! schedule is computed once per attempt and handed to the scheduler rather
//! than driving a `backoff::future::retry` loop directly, since a retry can
//! cross transaction and process boundaries.

use glyph_domain::enums::BackoffType;
use glyph_domain::step::WorkConfig;

/// `ShouldRetry(step, workItem)`: true while attempts remain.
#[must_use]
pub fn should_retry(config: &WorkConfig, retry_count: u32) -> bool {
    retry_count < config.max_retries
}

/// `CalculateNextRetry`: backoff in milliseconds for the given attempt count.
#[must_use]
pub fn calculate_next_retry_ms(config: &WorkConfig, retry_count: u32) -> u64 {
    let base = config.backoff_ms;
    let raw = match config.backoff_type {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(u64::from(retry_count) + 1),
        BackoffType::Exponential => base.saturating_mul(1u64 << retry_count.min(62)),
    };
    raw.min(config.max_backoff_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backoff_type: BackoffType) -> WorkConfig {
        WorkConfig {
            max_retries: 3,
            backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_type,
            parallelism: 1,
        }
    }

    #[test]
    fn eligibility_follows_max_retries() {
        let cfg = config(BackoffType::Fixed);
        assert!(should_retry(&cfg, 0));
        assert!(should_retry(&cfg, 2));
        assert!(!should_retry(&cfg, 3));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let cfg = config(BackoffType::Fixed);
        assert_eq!(calculate_next_retry_ms(&cfg, 0), 100);
        assert_eq!(calculate_next_retry_ms(&cfg, 5), 100);
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let cfg = config(BackoffType::Linear);
        assert_eq!(calculate_next_retry_ms(&cfg, 0), 100);
        assert_eq!(calculate_next_retry_ms(&cfg, 2), 300);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let cfg = config(BackoffType::Exponential);
        assert_eq!(calculate_next_retry_ms(&cfg, 0), 100);
        assert_eq!(calculate_next_retry_ms(&cfg, 1), 200);
        assert_eq!(calculate_next_retry_ms(&cfg, 2), 400);
        assert_eq!(calculate_next_retry_ms(&cfg, 10), 1000);
    }
}
