//! Time source abstraction and bounded-time budgets.
//!
//! The scheduler core never reads hardware counters itself. The timer layer
//! hands it a [`Clock`]; tests and simulators use [`ManualClock`].

use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::Nanoseconds;

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Current monotonic time
    fn now(&self) -> Nanoseconds;
}

/// Manually advanced clock
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock at `start`
    pub const fn new(start: Nanoseconds) -> Self {
        Self {
            now: AtomicU64::new(start.raw()),
        }
    }

    /// Move time forward
    #[inline]
    pub fn advance(&self, by: Nanoseconds) {
        self.now.fetch_add(by.raw(), Ordering::SeqCst);
    }

    /// Jump to an absolute time
    #[inline]
    pub fn set(&self, to: Nanoseconds) {
        self.now.store(to.raw(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nanoseconds {
        Nanoseconds::new(self.now.load(Ordering::SeqCst))
    }
}

// ============================================================================
// TIME BUDGET
// ============================================================================

/// Wall-clock budget for an operation that must complete in bounded time
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Nanoseconds,
    limit: Nanoseconds,
}

impl TimeBudget {
    /// Start a budget of `limit` at the clock's current time
    #[inline]
    pub fn start(clock: &dyn Clock, limit: Nanoseconds) -> Self {
        Self {
            started: clock.now(),
            limit,
        }
    }

    /// Elapsed time so far
    #[inline]
    pub fn elapsed(&self, clock: &dyn Clock) -> Nanoseconds {
        clock.now().since(self.started)
    }

    /// Has the budget been used up?
    #[inline]
    pub fn exceeded(&self, clock: &dyn Clock) -> bool {
        self.elapsed(clock) > self.limit
    }

    /// The configured limit
    #[inline(always)]
    pub fn limit(&self) -> Nanoseconds {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Nanoseconds::from_millis(1));
        clock.advance(Nanoseconds::from_micros(250));
        assert_eq!(clock.now().raw(), 1_250_000);
        clock.set(Nanoseconds::ZERO);
        assert_eq!(clock.now(), Nanoseconds::ZERO);
    }

    #[test]
    fn test_time_budget() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let budget = TimeBudget::start(&clock, Nanoseconds::from_micros(10));
        clock.advance(Nanoseconds::from_micros(10));
        assert!(!budget.exceeded(&clock));
        clock.advance(Nanoseconds::new(1));
        assert!(budget.exceeded(&clock));
    }
}
