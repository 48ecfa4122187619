//! ABOUTME: Exponential backoff with full jitter for transient job failures
//! ABOUTME: Base 1s doubling to a 60s cap; jitter spreads retry storms

use rand::Rng;
use std::time::Duration;

/// Default backoff base
pub const BASE: Duration = Duration::from_secs(1);
/// Default backoff cap
pub const CAP: Duration = Duration::from_secs(60);

/// Full-jitter exponential backoff: uniform in [0, min(cap, base·2^(n-1))].
/// `attempt` is 1-based (the attempt that just failed).
pub fn backoff_delay(attempt: i32, base: Duration, cap: Duration) -> Duration {
    let shift = (attempt.max(1) - 1).min(30) as u32;
    let ceiling = base
        .saturating_mul(1u32 << shift.min(31))
        .min(cap)
        .as_millis() as u64;
    let jittered = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(jittered)
}

/// Backoff with the default base and cap
pub fn default_backoff(attempt: i32) -> Duration {
    backoff_delay(attempt, BASE, CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_within_ceiling() {
        for attempt in 1..=10 {
            let ceiling = BASE
                .saturating_mul(1u32 << (attempt - 1) as u32)
                .min(CAP);
            for _ in 0..50 {
                let d = default_backoff(attempt);
                assert!(d <= ceiling, "attempt {} gave {:?} > {:?}", attempt, d, ceiling);
            }
        }
    }

    #[test]
    fn test_backoff_caps_at_sixty_seconds() {
        for _ in 0..100 {
            assert!(default_backoff(30) <= CAP);
        }
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let d = default_backoff(i32::MAX);
        assert!(d <= CAP);
    }
}
