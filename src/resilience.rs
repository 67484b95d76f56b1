//! Retry schedules.
//!
//! - [`RetrySchedule`]: doubling wait between a base and a ceiling, used for
//!   reconnecting to a site and for spacing failed election rounds
//! - [`Backoff`]: per-site failure counter that walks a schedule
//!
//! Reconnects never give up: a site stays in the group until it is removed,
//! so the schedule only grows until it hits the ceiling.
//!
//! # Example
//!
//! ```rust
//! use repmgr::resilience::{Backoff, RetrySchedule};
//! use std::time::Duration;
//!
//! let schedule = RetrySchedule::new(Duration::from_millis(10), Duration::from_millis(25));
//! let mut backoff = Backoff::new(schedule);
//! assert_eq!(backoff.next_delay(), Duration::from_millis(10));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(20));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(25));
//! backoff.reset();
//! assert_eq!(backoff.failures(), 0);
//! ```

use std::time::Duration;

/// Doubling wait: `base * 2^(failures-1)`, never above `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    base: Duration,
    ceiling: Duration,
}

impl RetrySchedule {
    /// A ceiling below `base` is raised to `base`.
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
        }
    }

    /// Wait that grows to at most `factor` times the base.
    pub fn capped_at(base: Duration, factor: u32) -> Self {
        Self::new(base, base.saturating_mul(factor.max(1)))
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Wait after `failures` consecutive failures (`0` and `1` both give the base).
    pub fn delay(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << doublings)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }
}

/// Failure counter walking a [`RetrySchedule`].
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: RetrySchedule,
    failures: u32,
}

impl Backoff {
    pub fn new(schedule: RetrySchedule) -> Self {
        Self { schedule, failures: 0 }
    }

    /// Record a failure and return the wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.schedule.delay(self.failures)
    }

    /// Forget past failures (after a successful handshake).
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
