// Reconnection pacing for the peer connector.
//
// `Backoff` hands out retry delays: the base interval first, doubling on
// every further attempt up to a cap, and back to the base after `reset()`
// (called whenever a connection attempt succeeds).
//
// `RetryTimer` is the single pending-retry slot. The connector is driven by
// `poll_at(now)` rather than by a timer thread, so the timer is just a
// deadline: scheduling replaces any previous deadline, and `fire(now)`
// reports (once) when it has passed.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next_ms: u64,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next_ms = config.base_ms.min(config.max_ms);
        Self { config, next_ms }
    }

    /// Delay for the next attempt. Each call doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_ms;
        self.next_ms = delay
            .checked_mul(2)
            .unwrap_or(u64::MAX)
            .min(self.config.max_ms);
        Duration::from_millis(delay)
    }

    /// The delay `next_delay` would return, without advancing.
    pub fn peek(&self) -> Duration {
        Duration::from_millis(self.next_ms)
    }

    pub fn reset(&mut self) {
        self.next_ms = self.config.base_ms.min(self.config.max_ms);
    }
}

#[derive(Clone, Debug, Default)]
pub struct RetryTimer {
    deadline: Option<Instant>,
}

impl RetryTimer {
    /// Arm the timer for `at`, replacing any pending deadline.
    pub fn schedule(&mut self, at: Instant) {
        self.deadline = Some(at);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True exactly once when the pending deadline is at or before `now`.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
