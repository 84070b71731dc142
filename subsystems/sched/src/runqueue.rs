//! Per-CPU run queues.
//!
//! Each CPU's queue sits behind its own `spin::Mutex`. The tick path locks
//! only its local queue. Migration is the one place that holds two queue
//! locks at once and always takes the lower CPU index first, spinning on
//! `try_lock` a bounded number of times under the migration time budget.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use crate::balancer::{MigrationEntry, MigrationStep};
use crate::clock::{Clock, TimeBudget};
use crate::context::TaskContext;
use crate::error::{MigrationFailure, SchedError, SchedResult};
use crate::types::{CpuId, CpuMask, Nanoseconds, TaskId};

// ============================================================================
// RUN QUEUE
// ============================================================================

/// A runnable task on a queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuedTask {
    /// Task
    pub task: TaskId,
    /// CPUs the task may use
    pub affinity: CpuMask,
    /// When it was enqueued here
    pub enqueued_at: Nanoseconds,
    /// Recent mean CPU usage (0..1), its contribution to queue demand
    pub load: f64,
    /// Holds a real-time reservation (pinned)
    pub realtime: bool,
    /// Latest snapshot handed in by the lifecycle manager
    pub context: TaskContext,
}

impl QueuedTask {
    /// Create a queued task with full affinity
    pub fn new(task: TaskId, enqueued_at: Nanoseconds) -> Self {
        Self {
            task,
            affinity: CpuMask::ALL,
            enqueued_at,
            load: 1.0,
            realtime: false,
            context: TaskContext::new(task),
        }
    }

    /// Queue entry for a captured context; load follows its mean usage
    pub fn from_context(context: TaskContext, enqueued_at: Nanoseconds) -> Self {
        let load = if context.sample_count() > 0 {
            context.mean_usage()
        } else {
            1.0
        };
        Self {
            task: context.task,
            affinity: context.affinity,
            enqueued_at,
            load: crate::math::unit(load),
            realtime: false,
            context,
        }
    }

    /// Set affinity
    pub fn with_affinity(mut self, affinity: CpuMask) -> Self {
        self.affinity = affinity;
        self.context.affinity = affinity;
        self
    }

    /// Set load contribution
    pub fn with_load(mut self, load: f64) -> Self {
        self.load = crate::math::unit(load);
        self
    }

    /// Mark as real-time
    pub fn pinned(mut self) -> Self {
        self.realtime = true;
        self
    }
}

/// One CPU's runnable set
#[derive(Debug)]
pub struct RunQueue {
    cpu: CpuId,
    tasks: Vec<QueuedTask>,
    /// Task currently on the CPU
    current: Option<TaskId>,
}

impl RunQueue {
    /// Empty queue for `cpu`
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            tasks: Vec::new(),
            current: None,
        }
    }

    /// Owning CPU
    #[inline(always)]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Add a task, replacing a stale entry for the same id
    pub fn push(&mut self, entry: QueuedTask) {
        self.tasks.retain(|t| t.task != entry.task);
        self.tasks.push(entry);
    }

    /// Remove a task
    pub fn remove(&mut self, task: TaskId) -> Option<QueuedTask> {
        let idx = self.tasks.iter().position(|t| t.task == task)?;
        if self.current == Some(task) {
            self.current = None;
        }
        Some(self.tasks.remove(idx))
    }

    /// Entry for a task
    #[inline]
    pub fn get(&self, task: TaskId) -> Option<&QueuedTask> {
        self.tasks.iter().find(|t| t.task == task)
    }

    /// Mutable entry for a task
    #[inline]
    pub fn get_mut(&mut self, task: TaskId) -> Option<&mut QueuedTask> {
        self.tasks.iter_mut().find(|t| t.task == task)
    }

    /// Contains task?
    #[inline]
    pub fn contains(&self, task: TaskId) -> bool {
        self.get(task).is_some()
    }

    /// Queued tasks
    #[inline(always)]
    pub fn tasks(&self) -> &[QueuedTask] {
        &self.tasks
    }

    /// Number of runnable tasks
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Is the queue empty?
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sum of per-task load
    pub fn demand(&self) -> f64 {
        self.tasks.iter().map(|t| t.load).sum()
    }

    /// Task currently running
    #[inline(always)]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// Record the task just dispatched
    #[inline]
    pub fn set_current(&mut self, task: Option<TaskId>) {
        self.current = task;
    }
}

// ============================================================================
// RUN QUEUE SET
// ============================================================================

/// Runnable count and demand of one CPU at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSnapshot {
    pub cpu: CpuId,
    pub runnable: usize,
    pub demand: f64,
    pub online: bool,
}

/// All per-CPU run queues
#[derive(Debug)]
pub struct RunQueueSet {
    queues: Vec<Mutex<RunQueue>>,
    online: Vec<AtomicBool>,
    spin_limit: u32,
}

impl RunQueueSet {
    /// Queues for `cpu_count` CPUs, all online
    pub fn new(cpu_count: usize, spin_limit: u32) -> Self {
        Self {
            queues: (0..cpu_count as CpuId)
                .map(|cpu| Mutex::new(RunQueue::new(cpu)))
                .collect(),
            online: (0..cpu_count).map(|_| AtomicBool::new(true)).collect(),
            spin_limit: spin_limit.max(1),
        }
    }

    /// Number of CPUs
    #[inline(always)]
    pub fn cpu_count(&self) -> usize {
        self.queues.len()
    }

    /// Lock one CPU's queue
    pub fn lock(&self, cpu: CpuId) -> SchedResult<MutexGuard<'_, RunQueue>> {
        self.queues
            .get(cpu as usize)
            .map(|q| q.lock())
            .ok_or(SchedError::InvalidCpu(cpu))
    }

    /// Is a CPU online?
    #[inline]
    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.online
            .get(cpu as usize)
            .map(|o| o.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Mark a CPU online or offline
    pub fn set_online(&self, cpu: CpuId, online: bool) -> SchedResult<()> {
        let flag = self.online.get(cpu as usize).ok_or(SchedError::InvalidCpu(cpu))?;
        flag.store(online, Ordering::Release);
        Ok(())
    }

    /// Queue a task on `cpu`
    pub fn enqueue(&self, cpu: CpuId, entry: QueuedTask) -> SchedResult<()> {
        if !self.is_online(cpu) {
            return Err(SchedError::InvalidCpu(cpu));
        }
        if !entry.affinity.contains(cpu) {
            return Err(SchedError::InvalidArgument {
                field: "cpu",
                reason: "outside task affinity",
            });
        }
        self.lock(cpu)?.push(entry);
        Ok(())
    }

    /// Remove a task from `cpu`
    pub fn dequeue(&self, cpu: CpuId, task: TaskId) -> Option<QueuedTask> {
        self.queues.get(cpu as usize)?.lock().remove(task)
    }

    /// CPU whose queue holds `task` (scans every queue)
    pub fn find(&self, task: TaskId) -> Option<CpuId> {
        self.queues
            .iter()
            .position(|q| q.lock().contains(task))
            .map(|i| i as CpuId)
    }

    /// Runnable count and demand of every CPU
    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.queues
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let q = q.lock();
                QueueSnapshot {
                    cpu: i as CpuId,
                    runnable: q.len(),
                    demand: q.demand(),
                    online: self.is_online(i as CpuId),
                }
            })
            .collect()
    }

    /// Copy of one queue's entries
    pub fn tasks_on(&self, cpu: CpuId) -> Vec<QueuedTask> {
        self.queues
            .get(cpu as usize)
            .map(|q| q.lock().tasks().to_vec())
            .unwrap_or_default()
    }

    fn spin_lock<'a>(
        &'a self,
        cpu: CpuId,
        budget: &TimeBudget,
        clock: &dyn Clock,
    ) -> Result<MutexGuard<'a, RunQueue>, MigrationFailure> {
        let queue = self
            .queues
            .get(cpu as usize)
            .ok_or(MigrationFailure::InvalidCpu)?;
        for _ in 0..self.spin_limit {
            if let Some(guard) = queue.try_lock() {
                return Ok(guard);
            }
            if budget.exceeded(clock) {
                return Err(MigrationFailure::BudgetExceeded);
            }
            core::hint::spin_loop();
        }
        Err(MigrationFailure::LockTimeout)
    }

    /// Move `task` from `from` to `to` within `budget`.
    ///
    /// Both locks are taken lower CPU index first. On any failure the task
    /// stays where it was.
    pub fn migrate(
        &self,
        task: TaskId,
        from: CpuId,
        to: CpuId,
        clock: &dyn Clock,
        limit: Nanoseconds,
    ) -> Result<(), MigrationFailure> {
        let count = self.cpu_count();
        if from as usize >= count || to as usize >= count {
            return Err(MigrationFailure::InvalidCpu);
        }
        if from == to {
            return Err(MigrationFailure::Rejected);
        }
        if !self.is_online(to) {
            return Err(MigrationFailure::TargetOffline);
        }

        let budget = TimeBudget::start(clock, limit);
        let (lo, hi) = if from < to { (from, to) } else { (to, from) };
        let lo_guard = self.spin_lock(lo, &budget, clock)?;
        let hi_guard = self.spin_lock(hi, &budget, clock)?;
        let (mut src, mut dst) = if from < to {
            (lo_guard, hi_guard)
        } else {
            (hi_guard, lo_guard)
        };

        if !self.is_online(to) {
            return Err(MigrationFailure::TargetOffline);
        }
        if src.current() == Some(task) {
            return Err(MigrationFailure::Rejected);
        }
        let entry = *src.get(task).ok_or(MigrationFailure::SourceMissing)?;
        if entry.realtime {
            return Err(MigrationFailure::Rejected);
        }
        if !entry.affinity.contains(to) {
            return Err(MigrationFailure::AffinityViolation);
        }
        if budget.exceeded(clock) {
            return Err(MigrationFailure::BudgetExceeded);
        }
        src.remove(task);
        dst.push(entry);
        Ok(())
    }
}

/// Executes migration steps against a [`RunQueueSet`]
pub struct QueueMigrator<'a> {
    queues: &'a RunQueueSet,
    clock: &'a dyn Clock,
    limit: Nanoseconds,
}

impl<'a> QueueMigrator<'a> {
    /// Create a migrator with a per-step time limit
    pub fn new(queues: &'a RunQueueSet, clock: &'a dyn Clock, limit: Nanoseconds) -> Self {
        Self {
            queues,
            clock,
            limit,
        }
    }
}

impl MigrationStep for QueueMigrator<'_> {
    fn migrate(&self, entry: &MigrationEntry) -> Result<(), MigrationFailure> {
        self.queues
            .migrate(entry.task, entry.from, entry.to, self.clock, self.limit)
    }
}

impl core::fmt::Debug for QueueMigrator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueMigrator")
            .field("limit", &self.limit)
            .finish()
    }
}
