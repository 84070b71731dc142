//! # Task Context Analyzer
//!
//! The task lifecycle manager keeps one [`TaskAccount`] per task and feeds it
//! run, wait and I/O observations. Whenever the scheduler needs to reason
//! about a task, [`TaskContextAnalyzer::capture`] turns the account into an
//! immutable, `Copy` [`TaskContext`] snapshot. Snapshots are owned by whoever
//! asked for them; nothing is shared or mutated after capture.

extern crate alloc;

use alloc::vec::Vec;

use crate::math;
use crate::types::{CpuId, CpuMask, Nanoseconds, NodeId, TaskId};

/// Number of CPU-usage samples kept per task
pub const HISTORY_LEN: usize = 8;

/// Smoothing factor for the I/O wait ratio
const IO_EMA_ALPHA: f64 = 0.25;

// ============================================================================
// TASK CONTEXT
// ============================================================================

/// Point-in-time snapshot of a task's scheduling-relevant state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskContext {
    /// Task
    pub task: TaskId,
    /// Recent CPU usage per run period (0..1), oldest first
    history: [f32; HISTORY_LEN],
    /// Valid samples in `history` (the last `samples` entries)
    samples: u8,
    /// When the task became runnable
    pub wait_start: Nanoseconds,
    /// Time spent runnable but not running
    pub wait_time: Nanoseconds,
    /// CPU the task last ran on
    pub last_cpu: Option<CpuId>,
    /// Node the task last ran on
    pub last_node: Option<NodeId>,
    /// When the task last stopped running
    pub last_ran_at: Option<Nanoseconds>,
    /// Fraction of recent time spent blocked on I/O
    pub io_wait_ratio: f64,
    /// CPUs the task may use
    pub affinity: CpuMask,
    /// Absolute deadline, if the task declared one
    pub deadline: Option<Nanoseconds>,
    /// Declared static importance (-20 most important, 19 least)
    pub nice: i8,
    /// When this snapshot was taken
    pub captured_at: Nanoseconds,
}

impl TaskContext {
    /// Empty context for `task`
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            history: [0.0; HISTORY_LEN],
            samples: 0,
            wait_start: Nanoseconds::ZERO,
            wait_time: Nanoseconds::ZERO,
            last_cpu: None,
            last_node: None,
            last_ran_at: None,
            io_wait_ratio: 0.0,
            affinity: CpuMask::ALL,
            deadline: None,
            nice: 0,
            captured_at: Nanoseconds::ZERO,
        }
    }

    /// Replace the usage history (the newest `HISTORY_LEN` samples are kept)
    pub fn with_usage(mut self, usage: &[f32]) -> Self {
        let take = usage.len().min(HISTORY_LEN);
        let tail = &usage[usage.len() - take..];
        self.history = [0.0; HISTORY_LEN];
        self.history[HISTORY_LEN - take..].copy_from_slice(tail);
        for v in &mut self.history {
            *v = math::unit(*v as f64) as f32;
        }
        self.samples = take as u8;
        self
    }

    /// Set wait start and accumulated wait
    pub fn with_wait(mut self, wait_start: Nanoseconds, wait_time: Nanoseconds) -> Self {
        self.wait_start = wait_start;
        self.wait_time = wait_time;
        self
    }

    /// Set the I/O wait ratio
    pub fn with_io_wait(mut self, ratio: f64) -> Self {
        self.io_wait_ratio = math::unit(ratio);
        self
    }

    /// Set the declared deadline
    pub fn with_deadline(mut self, deadline: Nanoseconds) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the affinity mask
    pub fn with_affinity(mut self, affinity: CpuMask) -> Self {
        self.affinity = affinity;
        self
    }

    /// Set the last CPU/node
    pub fn with_last_run(mut self, cpu: CpuId, node: NodeId, at: Nanoseconds) -> Self {
        self.last_cpu = Some(cpu);
        self.last_node = Some(node);
        self.last_ran_at = Some(at);
        self
    }

    /// Set nice
    pub fn with_nice(mut self, nice: i8) -> Self {
        self.nice = nice.clamp(-20, 19);
        self
    }

    /// Valid usage samples, oldest first
    #[inline]
    pub fn recent_usage(&self) -> &[f32] {
        &self.history[HISTORY_LEN - self.samples as usize..]
    }

    /// Number of valid samples
    #[inline(always)]
    pub fn sample_count(&self) -> usize {
        self.samples as usize
    }

    /// Mean recent CPU usage
    #[inline]
    pub fn mean_usage(&self) -> f64 {
        math::mean(self.recent_usage())
    }

    /// Variance of recent CPU usage
    #[inline]
    pub fn usage_variance(&self) -> f64 {
        math::variance(self.recent_usage())
    }

    /// Most recent usage sample
    #[inline]
    pub fn last_usage(&self) -> Option<f64> {
        self.recent_usage().last().map(|&v| v as f64)
    }

    /// Did the task declare a deadline?
    #[inline(always)]
    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Same snapshot with wait time and capture time advanced to `now`
    pub fn aged(mut self, now: Nanoseconds) -> Self {
        self.wait_time = now.since(self.wait_start);
        self.captured_at = now;
        self
    }
}

// ============================================================================
// TASK ACCOUNT
// ============================================================================

/// Mutable per-task accounting owned by the task lifecycle manager
#[derive(Debug, Clone)]
pub struct TaskAccount {
    task: TaskId,
    /// Ring of usage samples
    ring: [f32; HISTORY_LEN],
    /// Next write position
    head: usize,
    /// Valid samples
    len: usize,
    runnable_since: Option<Nanoseconds>,
    last_cpu: Option<CpuId>,
    last_ran_at: Option<Nanoseconds>,
    io_wait_ratio: f64,
    /// CPUs the task may use
    pub affinity: CpuMask,
    /// Declared absolute deadline
    pub deadline: Option<Nanoseconds>,
    /// Declared nice value
    pub nice: i8,
}

impl TaskAccount {
    /// New account for `task`
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            ring: [0.0; HISTORY_LEN],
            head: 0,
            len: 0,
            runnable_since: None,
            last_cpu: None,
            last_ran_at: None,
            io_wait_ratio: 0.0,
            affinity: CpuMask::ALL,
            deadline: None,
            nice: 0,
        }
    }

    /// Task id
    #[inline(always)]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Task became runnable
    pub fn mark_runnable(&mut self, now: Nanoseconds) {
        if self.runnable_since.is_none() {
            self.runnable_since = Some(now);
        }
    }

    /// Task blocked or exited the run queue without running
    pub fn mark_blocked(&mut self) {
        self.runnable_since = None;
    }

    /// Task ran on `cpu` for `ran` out of a `period` window ending at `now`
    pub fn record_run(&mut self, cpu: CpuId, ran: Nanoseconds, period: Nanoseconds, now: Nanoseconds) {
        let usage = if period == Nanoseconds::ZERO {
            1.0
        } else {
            math::unit(ran.raw() as f64 / period.raw() as f64)
        };
        self.ring[self.head] = usage as f32;
        self.head = (self.head + 1) % HISTORY_LEN;
        self.len = (self.len + 1).min(HISTORY_LEN);
        self.last_cpu = Some(cpu);
        self.last_ran_at = Some(now);
        self.runnable_since = None;
    }

    /// Task spent `io_wait` of a `window` blocked on I/O
    pub fn record_io(&mut self, io_wait: Nanoseconds, window: Nanoseconds) {
        if window == Nanoseconds::ZERO {
            return;
        }
        let ratio = math::unit(io_wait.raw() as f64 / window.raw() as f64);
        self.io_wait_ratio = IO_EMA_ALPHA * ratio + (1.0 - IO_EMA_ALPHA) * self.io_wait_ratio;
    }

    /// Usage samples, oldest first
    fn ordered_samples(&self) -> Vec<f32> {
        let start = (self.head + HISTORY_LEN - self.len) % HISTORY_LEN;
        (0..self.len)
            .map(|i| self.ring[(start + i) % HISTORY_LEN])
            .collect()
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

/// Builds [`TaskContext`] snapshots from [`TaskAccount`]s
#[derive(Debug, Clone)]
pub struct TaskContextAnalyzer {
    /// CPU → node
    cpu_nodes: Vec<NodeId>,
}

impl TaskContextAnalyzer {
    /// Create an analyzer for the given CPU → node table
    pub fn new(cpu_nodes: Vec<NodeId>) -> Self {
        Self { cpu_nodes }
    }

    /// Node of `cpu`
    #[inline]
    pub fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        self.cpu_nodes.get(cpu as usize).copied()
    }

    /// Capture a snapshot at `now`
    pub fn capture(&self, account: &TaskAccount, now: Nanoseconds) -> TaskContext {
        let (wait_start, wait_time) = match account.runnable_since {
            Some(since) => (since, now.since(since)),
            None => (now, Nanoseconds::ZERO),
        };
        let mut ctx = TaskContext::new(account.task)
            .with_usage(&account.ordered_samples())
            .with_wait(wait_start, wait_time)
            .with_io_wait(account.io_wait_ratio)
            .with_affinity(account.affinity)
            .with_nice(account.nice);
        ctx.deadline = account.deadline;
        ctx.last_cpu = account.last_cpu;
        ctx.last_node = account.last_cpu.and_then(|cpu| self.node_of(cpu));
        ctx.last_ran_at = account.last_ran_at;
        ctx.captured_at = now;
        ctx
    }
}
