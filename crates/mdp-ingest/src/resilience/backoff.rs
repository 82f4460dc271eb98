//! Exponential backoff schedule

use rand::Rng;
use std::time::Duration;

use crate::config::ResilienceConfig;

/// `base * 2^attempt`, capped at `max`, plus optional jitter in `[0, delay/2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay(), config.jitter)
    }

    /// Capped delay before retry number `attempt` (0-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay to sleep before retry number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let half_ms = (delay.as_millis() / 2) as u64;
        if half_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..half_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3), false);
        let delays: Vec<_> = (0..5).map(|a| backoff.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30), false);
        assert_eq!(backoff.delay(64), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_half_delay() {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_secs(30), true);
        for _ in 0..200 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_millis(2000));
            assert!(d < Duration::from_millis(3000));
        }
    }
}
