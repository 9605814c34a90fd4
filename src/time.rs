//! Monotonic time for scheduling.
//!
//! Every scheduling key, staleness deadline and expiry in Metron is expressed in
//! [`Millis`] read from one [`Clock`]. Wall-clock time is only used to stamp
//! client-facing events.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Milliseconds on the engine's monotonic clock.
pub type Millis = i64;

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    /// Current monotonic time in milliseconds.
    fn now_ms(&self) -> Millis;
}

/// Clock backed by [`Instant`], counting from its construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose zero is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> Millis {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Never moves backwards: `set` to an earlier time is ignored.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    #[must_use]
    pub const fn new(start: Millis) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Moves the clock forward by `delta` milliseconds.
    pub fn advance(&self, delta: Millis) {
        if delta > 0 {
            self.now.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Moves the clock to `at` if that is not in the past.
    pub fn set(&self, at: Millis) {
        self.now.fetch_max(at, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_never_rewinds() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);

        clock.set(120);
        assert_eq!(clock.now_ms(), 150);

        clock.set(400);
        assert_eq!(clock.now_ms(), 400);

        clock.advance(-10);
        assert_eq!(clock.now_ms(), 400);
    }

    #[test]
    fn monotonic_clock_is_non_decreasing() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(a >= 0);
        assert!(b >= a);
    }
}
