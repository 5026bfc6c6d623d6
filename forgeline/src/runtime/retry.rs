//! Linear retry backoff and the sleeping seam behind it.

use std::thread;
use std::time::Duration;

use crate::io::config::RuntimeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub step: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_secs(config.backoff_base_secs),
            step: Duration::from_secs(config.backoff_step_secs),
        }
    }

    /// Wait before retrying after failed attempt `attempt` (1-based):
    /// `base + attempt * step`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base + self.step * attempt
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(2),
            step: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert!(policy.has_attempts_left(2));
        assert!(!policy.has_attempts_left(3));
    }

    #[test]
    fn zero_attempts_still_calls_once() {
        let config = RuntimeConfig {
            max_attempts: 0,
            ..RuntimeConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
