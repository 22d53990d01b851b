//! # Exponential Backoff
//!
//! Backoff calculator for destination retries.
//!
//! The nominal delay doubles per attempt (`base · 2^attempt`) up to `cap`. A
//! random jitter of up to `jitter_ratio` of the nominal delay is added, the
//! result is clamped to `cap`, and a delay is never shorter than the one
//! before it.
//!
//! ## Usage
//!
//! ```rust
//! use secrets_sync::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5), 0.0);
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! ```

use std::time::Duration;

/// Exponential backoff calculator with bounded jitter
///
/// Each retried call keeps its own instance; [`ExponentialBackoff::reset`]
/// restarts the sequence after a success.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    jitter_ratio: f64,
    /// Delays handed out so far
    attempt: u32,
    previous: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and capped at `cap`
    ///
    /// `jitter_ratio` is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(base: Duration, cap: Duration, jitter_ratio: f64) -> Self {
        let jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            base,
            cap,
            jitter_ratio,
            attempt: 0,
            previous: Duration::ZERO,
        }
    }

    /// Delay before the next attempt; advances the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let nominal = self.nominal(self.attempt);
        let jitter = nominal.mul_f64(self.jitter_ratio * unit_random());
        let delay = nominal
            .saturating_add(jitter)
            .min(self.cap)
            .max(self.previous);

        self.attempt = self.attempt.saturating_add(1);
        self.previous = delay;
        delay
    }

    /// Number of delays handed out since creation or the last reset
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restart the sequence from `base`
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous = Duration::ZERO;
    }

    /// `base · 2^attempt`, capped
    fn nominal(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Uniform value in `[0, 1)`
fn unit_random() -> f64 {
    rand::random::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = ExponentialBackoff::new(ms(100), ms(1000), 0.0);
        let delays: Vec<_> = (0..6).map(|_| backoff.next_backoff()).collect();
        assert_eq!(
            delays,
            vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000)]
        );
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_jitter_is_bounded_and_non_decreasing() {
        for _ in 0..50 {
            let mut backoff = ExponentialBackoff::new(ms(100), ms(2000), 0.5);
            let mut previous = Duration::ZERO;
            for attempt in 0..10u32 {
                let delay = backoff.next_backoff();
                let nominal = ms(100 * 2u64.pow(attempt)).min(ms(2000));
                assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
                assert!(delay >= nominal.min(ms(2000)));
                assert!(delay <= ms(2000));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(ms(50), ms(500), 0.0);
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_backoff(), ms(50));
    }

    #[test]
    fn test_large_attempts_do_not_overflow() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(3600), ms(30_000), 0.2);
        for _ in 0..40 {
            assert_eq!(backoff.next_backoff(), ms(30_000));
        }
    }

    #[test]
    fn test_invalid_jitter_ratio_is_clamped() {
        let mut backoff = ExponentialBackoff::new(ms(10), ms(100), f64::NAN);
        assert_eq!(backoff.next_backoff(), ms(10));
        let mut backoff = ExponentialBackoff::new(ms(10), ms(100), 7.0);
        assert!(backoff.next_backoff() <= ms(20));
    }

    #[test]
    fn test_unit_random_range() {
        for _ in 0..1000 {
            let value = unit_random();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_jitter_spreads_first_delays() {
        let delays: std::collections::HashSet<Duration> = (0..50)
            .map(|_| ExponentialBackoff::new(ms(1000), ms(60_000), 0.5).next_backoff())
            .collect();
        assert!(delays.len() > 1, "jitter produced a single delay");
        assert!(delays.iter().all(|delay| (ms(1000)..=ms(1500)).contains(delay)));
    }
}
