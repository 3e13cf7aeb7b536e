//! Reconnection backoff
//!
//! ```text
//! t(0) = base
//! t(n) = t(n - 1) * factor
//! ```
//!
//! optionally capped at a maximum delay.

use crate::config::BackoffConfig;
use std::time::Duration;

/// Exponential backoff state for one connection
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Option<Duration>,
    /// Failed attempts since the last successful connection
    attempts: u32,
}

impl Backoff {
    /// Create a backoff schedule
    pub fn new(base: Duration, factor: f64, max: Option<Duration>) -> Self {
        Self {
            base,
            factor,
            max,
            attempts: 0,
        }
    }

    /// Create a backoff schedule from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay(), config.backoff_factor, config.max_delay())
    }

    /// Delay before retry number `n`, counted from zero
    pub fn delay(&self, n: u32) -> Duration {
        let mut delay = self.base;
        for _ in 0..n {
            if delay == Duration::MAX || self.max.is_some_and(|max| delay >= max) {
                break;
            }
            let next = scale(delay, self.factor);
            if next == delay {
                break;
            }
            delay = next;
        }
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Delay for the current attempt, then advance the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Failed attempts since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// `delay * factor` rounded to the nanosecond, saturating at `Duration::MAX`
fn scale(delay: Duration, factor: f64) -> Duration {
    let nanos = (delay.as_nanos() as f64 * factor).round();
    if nanos >= u64::MAX as f64 {
        Duration::MAX
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence() {
        let backoff = Backoff::new(Duration::from_millis(1000), 2.0, None);

        assert_eq!(backoff.delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay(5), Duration::from_millis(32000));
    }

    #[test]
    fn test_next_delay_and_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), 2.0, None);

        let armed: Vec<_> = (0..3).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            armed,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
            ]
        );
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_capped() {
        let backoff = Backoff::new(
            Duration::from_secs(1),
            3.0,
            Some(Duration::from_secs(10)),
        );

        assert_eq!(backoff.delay(2), Duration::from_secs(9));
        assert_eq!(backoff.delay(3), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_unbounded_growth_saturates() {
        let backoff = Backoff::new(Duration::from_secs(1), 10.0, None);
        assert_eq!(backoff.delay(400), Duration::MAX);
    }

    #[test]
    fn test_factor_one_is_constant() {
        let backoff = Backoff::new(Duration::from_millis(250), 1.0, None);
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(250));
    }
}
