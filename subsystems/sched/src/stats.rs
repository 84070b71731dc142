//! Scheduler counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics from any CPU
#[derive(Debug, Default)]
pub struct SchedStats {
    pub selections: AtomicU64,
    pub idle_picks: AtomicU64,
    pub degraded: AtomicU64,
    pub realtime_overrides: AtomicU64,
    pub rt_admitted: AtomicU64,
    pub rt_rejected: AtomicU64,
    pub deadline_misses: AtomicU64,
    pub balance_passes: AtomicU64,
    pub migrations_planned: AtomicU64,
    pub migrations_filtered: AtomicU64,
    pub migrations_executed: AtomicU64,
    pub migrations_failed: AtomicU64,
}

/// Point-in-time copy of [`SchedStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub selections: u64,
    pub idle_picks: u64,
    pub degraded: u64,
    pub realtime_overrides: u64,
    pub rt_admitted: u64,
    pub rt_rejected: u64,
    pub deadline_misses: u64,
    pub balance_passes: u64,
    pub migrations_planned: u64,
    pub migrations_filtered: u64,
    pub migrations_executed: u64,
    pub migrations_failed: u64,
    /// Outcomes dropped by a full feedback queue
    pub feedback_dropped: u64,
}

impl SchedStats {
    /// Zeroed counters
    pub const fn new() -> Self {
        Self {
            selections: AtomicU64::new(0),
            idle_picks: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            realtime_overrides: AtomicU64::new(0),
            rt_admitted: AtomicU64::new(0),
            rt_rejected: AtomicU64::new(0),
            deadline_misses: AtomicU64::new(0),
            balance_passes: AtomicU64::new(0),
            migrations_planned: AtomicU64::new(0),
            migrations_filtered: AtomicU64::new(0),
            migrations_executed: AtomicU64::new(0),
            migrations_failed: AtomicU64::new(0),
        }
    }

    /// Increment a counter
    #[inline(always)]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter
    #[inline(always)]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self, feedback_dropped: u64) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            selections: get(&self.selections),
            idle_picks: get(&self.idle_picks),
            degraded: get(&self.degraded),
            realtime_overrides: get(&self.realtime_overrides),
            rt_admitted: get(&self.rt_admitted),
            rt_rejected: get(&self.rt_rejected),
            deadline_misses: get(&self.deadline_misses),
            balance_passes: get(&self.balance_passes),
            migrations_planned: get(&self.migrations_planned),
            migrations_filtered: get(&self.migrations_filtered),
            migrations_executed: get(&self.migrations_executed),
            migrations_failed: get(&self.migrations_failed),
            feedback_dropped,
        }
    }
}
