//! Deadline-based timers driven by the host's poll loop.
//!
//! Nothing here spawns threads or sleeps: the session asks each timer whether
//! it is due at the `now` the host passes in.

use std::time::{Duration, Instant};

/// Fires every `period` while armed.
#[derive(Debug, Clone)]
pub struct Timer {
    period: Duration,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.period);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// True once per elapsed period. Missed periods are not replayed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = Some(now + self.period);
                true
            }
            _ => false,
        }
    }
}

/// Expires when not fed within `timeout`.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn feed(&mut self, now: Instant) {
        self.deadline = Some(now + self.timeout);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Rate limiter for periodic notifications.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// True if at least `interval` passed since the last time this returned true.
    pub fn ready(&mut self, now: Instant) -> bool {
        let due = self
            .last
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }
}
