//! Exponential backoff for consecutive failed iterations.

use std::time::Duration;

/// Backoff policy: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Tracks consecutive failures and applies the reset rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounter {
    consecutive: u32,
}

impl FailureCounter {
    /// Observe a consumed iteration. Any iteration that ran longer than
    /// `short_threshold` clears the counter before the failure is counted.
    pub fn observe(&mut self, failed: bool, duration: Duration, short_threshold: Duration) -> u32 {
        if duration > short_threshold || !failed {
            self.consecutive = 0;
        }
        if failed {
            self.consecutive = self.consecutive.saturating_add(1);
        }
        self.consecutive
    }
}
