//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Fraction of the delay that jitter may add or remove.
pub const JITTER_RATIO: f64 = 0.25;

/// Un-jittered delay before retrying after attempt `attempt` (0-indexed).
///
/// `min(initial * factor^attempt, max)`, saturating instead of overflowing.
pub fn exponential_delay(attempt: u32, initial: Duration, factor: f64, max: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw_ms = initial.as_millis() as f64 * factor.powi(exponent);
    let capped_ms = raw_ms.min(max.as_millis() as f64);

    if capped_ms.is_nan() || capped_ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis(capped_ms as u64)
}

/// Perturb `delay` uniformly by up to ±25%, floored to whole milliseconds.
pub fn apply_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as f64;
    if ms == 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
    Duration::from_millis((ms * factor).floor() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(2000);

        assert_eq!(exponential_delay(0, initial, 2.0, max), Duration::from_millis(100));
        assert_eq!(exponential_delay(1, initial, 2.0, max), Duration::from_millis(200));
        assert_eq!(exponential_delay(3, initial, 2.0, max), Duration::from_millis(800));
        assert_eq!(exponential_delay(10, initial, 2.0, max), max);
    }

    #[test]
    fn test_backoff_is_monotonic_until_saturation() {
        let initial = Duration::from_millis(50);
        let max = Duration::from_secs(5);
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = exponential_delay(attempt, initial, 1.7, max);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            assert!(delay <= max);
            previous = delay;
        }
        assert_eq!(previous, max);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let delay = exponential_delay(u32::MAX, Duration::from_secs(1), 2.0, Duration::from_secs(60));
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..500 {
            let jittered = apply_jitter(base);
            assert!(jittered >= Duration::from_millis(750), "{jittered:?} below bound");
            assert!(jittered <= Duration::from_millis(1250), "{jittered:?} above bound");
        }
    }

    #[test]
    fn test_jitter_of_zero_is_zero() {
        assert_eq!(apply_jitter(Duration::ZERO), Duration::ZERO);
    }
}
