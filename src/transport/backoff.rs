//! Reconnect delay schedule
//!
//! The nominal delay for attempt `n` (1-based) is `base * 2^(n-1)`. Jitter
//! moves it by up to ±25%, and the result never exceeds the configured
//! maximum.

use rand::Rng;
use std::time::Duration;

/// Fraction of the nominal delay that jitter may add or remove
pub const JITTER_FRACTION: f64 = 0.25;

/// Exponential reconnect backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a schedule from the first delay and the cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before attempt `attempt` before jitter and cap
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let millis = self.base.as_millis() as f64 * 2f64.powi(exponent);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }

    /// Inclusive range the jittered, capped delay falls into
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal(attempt).as_millis() as f64;
        let low = Duration::from_millis((nominal * (1.0 - JITTER_FRACTION)) as u64);
        let high = Duration::from_millis((nominal * (1.0 + JITTER_FRACTION)) as u64);
        (low.min(self.max), high.min(self.max))
    }

    /// Delay for `attempt` with an explicit jitter in `[-0.25, 0.25]`
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(-JITTER_FRACTION, JITTER_FRACTION);
        let nominal = self.nominal(attempt).as_millis() as f64;
        let millis = (nominal * (1.0 + jitter)).max(0.0);
        Duration::from_millis(millis as u64).min(self.max)
    }

    /// Delay for `attempt` with random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        self.delay_with_jitter(attempt, jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_stay_within_bounds() {
        let backoff = Backoff::new(Duration::from_millis(1_000), Duration::from_secs(300));

        for attempt in 1..=8 {
            let nominal = 1_000u64 * 2u64.pow(attempt - 1);
            for _ in 0..50 {
                let delay = backoff.delay(attempt).as_millis() as u64;
                assert!(delay >= nominal * 3 / 4, "attempt {}: {} too short", attempt, delay);
                assert!(delay <= nominal * 5 / 4, "attempt {}: {} too long", attempt, delay);
            }
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(1_000), Duration::from_secs(5));
        for _ in 0..50 {
            assert!(backoff.delay(10) <= Duration::from_secs(5));
        }
        assert_eq!(backoff.bounds(10), (Duration::from_secs(5), Duration::from_secs(5)));
    }

    #[test]
    fn test_explicit_jitter_extremes() {
        let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(60));
        assert_eq!(backoff.delay_with_jitter(3, -0.25), Duration::from_millis(600));
        assert_eq!(backoff.delay_with_jitter(3, 0.25), Duration::from_millis(1_000));
        // Out-of-range jitter is clamped
        assert_eq!(backoff.delay_with_jitter(3, 2.0), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_with_jitter(1, 0.0), Duration::from_millis(200));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_millis(1_000), Duration::from_secs(30));
        assert_eq!(backoff.delay_with_jitter(u32::MAX, 0.0), Duration::from_secs(30));
    }
}
