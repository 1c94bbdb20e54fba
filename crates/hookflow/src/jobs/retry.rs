use rand::Rng;
use std::time::Duration;

use crate::jobs::error_codes::ErrorCode;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

pub fn classify_error(code: ErrorCode) -> ErrorClass {
    match code {
        ErrorCode::Timeout | ErrorCode::TransportError => ErrorClass::Retryable,
        ErrorCode::DownstreamError
        | ErrorCode::UnknownJobType
        | ErrorCode::HandlerPanic
        | ErrorCode::MaxAttemptsExceeded => ErrorClass::NonRetryable,
        ErrorCode::Unknown => ErrorClass::Retryable,
    }
}

/// Should a failure on attempt `attempts` (1-based) be retried?
pub fn should_retry(code: ErrorCode, attempts: i32, max_attempts: i32) -> bool {
    classify_error(code) == ErrorClass::Retryable && attempts < max_attempts
}

/// base * 2^(attempt_no-1), capped at `max`, then jittered by ±`jitter_pct`.
pub fn next_delay(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let attempt_no = attempt_no.max(1) as u32;
    let exp = attempt_no.saturating_sub(1);

    let base_ms = cfg.base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = cfg.max.as_millis().min(u64::MAX as u128) as u64;

    // If 2^exp overflows, treat it as huge and let the cap handle it.
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(pow2).min(max_ms);

    let jitter_range = (delay_ms as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay_ms as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            base: Duration::from_secs(1),
            max: Duration::from_secs(15),
            jitter_pct: 0.0,
        }
    }

    #[test]
    fn delay_doubles_per_attempt_until_cap() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<u64> = (1..=6)
            .map(|n| next_delay(n, &cfg, &mut rng).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 15, 15]);
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_cap() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_delay(500, &cfg, &mut rng), Duration::from_secs(15));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = RetryConfig {
            base: Duration::from_secs(4),
            max: Duration::from_secs(60),
            jitter_pct: 0.25,
        };
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = next_delay(1, &cfg, &mut rng).as_millis();
            assert!((3000..=5000).contains(&d), "delay {d}ms out of range");
        }
    }

    #[test]
    fn only_transient_failures_retry_within_budget() {
        assert!(should_retry(ErrorCode::Timeout, 1, 3));
        assert!(should_retry(ErrorCode::TransportError, 2, 3));
        assert!(!should_retry(ErrorCode::Timeout, 3, 3));
        assert!(!should_retry(ErrorCode::DownstreamError, 1, 3));
        assert!(!should_retry(ErrorCode::HandlerPanic, 1, 3));
    }
}
