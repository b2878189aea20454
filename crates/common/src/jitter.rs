//! Sleep-jitter helpers.
//!
//! Every periodic loop in the workspace adds jitter to its sleeps so that a
//! fleet started from the same image does not synchronize its DNS reads,
//! renewal attempts and lock grabs.

use std::time::Duration;

use rand::Rng;

/// One hour plus up to 256 extra seconds.
///
/// Used as the retry delay after a failed renewal and as the floor for
/// very-short-lived certificates.
pub fn jittery_hour() -> Duration {
    Duration::from_secs(3600 + rand::thread_rng().gen_range(0..256))
}

/// Scale an interval by a uniform factor in `[0.75, 1.25)`.
///
/// The controller tick uses this so that peers drift apart instead of
/// stampeding the DNS provider on the same schedule.
pub fn spread_interval(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..1.25);
    interval.mul_f64(factor)
}

/// Lock-contention backoff: 15 seconds plus up to 2.56 seconds.
pub fn lock_retry_delay() -> Duration {
    Duration::from_millis(15_000 + u64::from(rand::thread_rng().gen_range(0u16..256)) * 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jittery_hour_bounds() {
        for _ in 0..32 {
            let d = jittery_hour();
            assert!(d >= Duration::from_secs(3600));
            assert!(d < Duration::from_secs(3600 + 256));
        }
    }

    #[test]
    fn test_spread_interval_bounds() {
        let base = Duration::from_secs(60);
        for _ in 0..32 {
            let d = spread_interval(base);
            assert!(d >= Duration::from_secs(45));
            assert!(d < Duration::from_secs(75));
        }
    }

    #[test]
    fn test_lock_retry_delay_bounds() {
        for _ in 0..32 {
            let d = lock_retry_delay();
            assert!(d >= Duration::from_secs(15));
            assert!(d < Duration::from_millis(17_560));
        }
    }
}
