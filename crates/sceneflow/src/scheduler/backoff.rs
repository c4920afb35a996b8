//! Retry backoff: exponential in the attempt number, capped.

use std::time::Duration;

/// Delay before re-running a job whose `attempt`-th execution failed
/// (attempts count from 1). `base * 2^(attempt-1)`, capped.
pub fn retry_delay(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    // Past 2^16 the cap always wins; avoids shift overflow.
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(delay.min(cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_per_attempt() {
        assert_eq!(retry_delay(1_000, 60_000, 1), Duration::from_millis(1_000));
        assert_eq!(retry_delay(1_000, 60_000, 2), Duration::from_millis(2_000));
        assert_eq!(retry_delay(1_000, 60_000, 3), Duration::from_millis(4_000));
        assert_eq!(retry_delay(1_000, 60_000, 4), Duration::from_millis(8_000));
    }

    #[test]
    fn test_cap_applies() {
        assert_eq!(retry_delay(1_000, 5_000, 10), Duration::from_millis(5_000));
        assert_eq!(retry_delay(1_000, 5_000, 100), Duration::from_millis(5_000));
    }

    #[test]
    fn test_delays_never_decrease() {
        let mut last = Duration::ZERO;
        for attempt in 1..=20 {
            let d = retry_delay(500, 30_000, attempt);
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn test_attempt_zero_behaves_like_one() {
        assert_eq!(retry_delay(1_000, 60_000, 0), retry_delay(1_000, 60_000, 1));
    }
}
