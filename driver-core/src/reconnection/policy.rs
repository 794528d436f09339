use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

/// Decides how long a host waits before its next reconnection attempt. Delays
/// depend only on how many attempts for that host failed so far.
pub trait ReconnectionPolicy: Debug + Send + Sync {
    fn delay(&self, failed_attempts: u32) -> Duration;

    fn max_delay(&self) -> Duration;
}

/// `base * 2^failed_attempts`, capped at `max`, stretched by up to
/// `random_factor` of itself.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base: Duration,
    max: Duration,
    random_factor: f64,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base: Duration, max: Duration, random_factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            random_factor: random_factor.clamp(0.0, 1.0),
        }
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn delay(&self, failed_attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(failed_attempts).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        if self.random_factor > 0.0 {
            let stretch = rand::thread_rng().gen_range(0.0..=self.random_factor);
            delay.mul_f64(1.0 + stretch).min(self.max)
        } else {
            delay
        }
    }

    fn max_delay(&self) -> Duration {
        self.max
    }
}

#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn delay(&self, _failed_attempts: u32) -> Duration {
        self.delay
    }

    fn max_delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::reconnection::policy::{
        ConstantReconnectionPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy,
    };

    #[test]
    fn test_exponential_doubles_until_cap() {
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            0.0,
        );
        let delays = (0..6).map(|n| policy.delay(n).as_secs()).collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
        assert_eq!(policy.max_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_jitter_stays_in_bounds() {
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            0.5,
        );
        for _ in 0..100 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(301));
        }
        assert!(policy.delay(10) <= Duration::from_secs(1));
    }

    #[test]
    fn test_constant() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_millis(250));
        assert_eq!(policy.delay(0), policy.delay(42));
        assert_eq!(policy.max_delay(), Duration::from_millis(250));
    }
}
