use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Auto-reconnect policy boundary.
///
/// Policy lives here rather than in the link actor so callers can pick interval and attempt
/// budget per deployment.
pub trait ReconnectStrategy: Send + 'static {
    /// Delay before the next attempt. Counts the attempt.
    fn next_delay(&mut self) -> Duration;

    /// Forget past attempts (called once a connection is established).
    fn reset(&mut self);

    fn should_retry(&self) -> bool;

    fn attempts(&self) -> u32;
}

/// Fixed interval between attempts, capped at `max_attempts` consecutive tries.
#[derive(Clone, Debug)]
pub struct FixedIntervalReconnect {
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
    jitter: bool,
}

impl FixedIntervalReconnect {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 0,
            jitter: false,
        }
    }

    /// Spread attempts over `[interval/2, interval]` to avoid synchronized reconnect storms.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for FixedIntervalReconnect {
    fn default() -> Self {
        Self::new(Duration::from_millis(3000), 5)
    }
}

impl ReconnectStrategy for FixedIntervalReconnect {
    fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        if self.jitter {
            jitter_delay(self.interval)
        } else {
            self.interval
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

pub fn jitter_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }

    let mut rng = SmallRng::from_entropy();
    let jitter: f64 = rng.gen_range(0.5..=1.0);
    let nanos = (base.as_nanos() as f64 * jitter) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_are_capped_and_reset() {
        let mut strategy = FixedIntervalReconnect::new(Duration::from_millis(3000), 2);
        assert!(strategy.should_retry());
        assert_eq!(strategy.next_delay(), Duration::from_millis(3000));
        assert!(strategy.should_retry());
        assert_eq!(strategy.next_delay(), Duration::from_millis(3000));
        assert!(!strategy.should_retry());
        assert_eq!(strategy.attempts(), 2);

        strategy.reset();
        assert!(strategy.should_retry());
        assert_eq!(strategy.attempts(), 0);
    }

    #[test]
    fn jittered_delay_stays_within_half_interval() {
        let mut strategy = FixedIntervalReconnect::new(Duration::from_millis(100), 100)
            .with_jitter(true);
        for _ in 0..50 {
            let delay = strategy.next_delay();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }

        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
    }
}
