//! Reconnect scheduling
//!
//! Connect attempts are counted per outage. Each failed attempt waits longer
//! than the last, and after `max_attempts` consecutive failures the schedule
//! reports exhaustion until it is reset.

use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};

/// Backoff parameters for relay reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay to spread out reconnect storms
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delays between consecutive attempts of one outage
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send {
        // base 2 with factor base/2 yields base, 2*base, 4*base, ...
        let half = (self.base_delay.as_millis() as u64 / 2).max(1);
        let use_jitter = self.jitter;
        ExponentialBackoff::from_millis(2)
            .factor(half)
            .max_delay(self.max_delay)
            .map(move |delay| if use_jitter { jitter(delay) } else { delay })
    }
}

/// Attempt counter for the current outage
pub struct ReconnectSchedule {
    policy: ReconnectPolicy,
    attempts: u32,
    delays: Box<dyn Iterator<Item = Duration> + Send>,
}

impl ReconnectSchedule {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let delays = Box::new(policy.delays());
        Self {
            policy,
            attempts: 0,
            delays,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Count a failed attempt.
    ///
    /// Returns how long to wait before the next one, or `None` once the
    /// attempt budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.exhausted() {
            return None;
        }
        Some(self.delays.next().unwrap_or(self.policy.max_delay))
    }

    /// Start a fresh outage budget
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delays = Box::new(self.policy.delays());
    }
}
