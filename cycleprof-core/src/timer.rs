//! Deadline timer driven by the consumer loop.
//!
//! The loop asks for the next deadline, sleeps until then (or until something
//! else wakes it) and calls `expirations` with the current time.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FlushTimer {
    next: Option<Instant>,
    interval: Duration,
}

impl Default for FlushTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushTimer {
    pub fn new() -> Self {
        Self {
            next: None,
            interval: Duration::ZERO,
        }
    }

    /// First fire at `now + value`, then every `interval`.
    pub fn arm(&mut self, now: Instant, value: Duration, interval: Duration) {
        self.next = Some(now + value);
        self.interval = interval;
    }

    pub fn disarm(&mut self) {
        self.next = None;
    }

    pub fn is_armed(&self) -> bool {
        self.next.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next
    }

    /// Number of fires due at `now`, advancing the deadline past `now`.
    ///
    /// Missed periods collapse into one call that reports them all.
    pub fn expirations(&mut self, now: Instant) -> u64 {
        let Some(next) = self.next else {
            return 0;
        };
        if now < next {
            return 0;
        }
        if self.interval.is_zero() {
            // One-shot
            self.next = None;
            return 1;
        }
        let late = now.duration_since(next).as_nanos();
        let count = (late / self.interval.as_nanos()) as u64 + 1;
        let advance = self.interval.as_nanos() * count as u128;
        self.next = Some(next + Duration::from_nanos(advance.min(u64::MAX as u128) as u64));
        count
    }
}
