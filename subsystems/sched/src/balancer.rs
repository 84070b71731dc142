//! # Load Balancer / Migration Planner
//!
//! Runs every `interval_ticks` ticks, never on the selection path.
//!
//! ```text
//! SystemLoad ──► project (load-evolution predictor) ──► plan_migrations
//!                                                            │
//!            report ◄── execute (per entry) ◄── placement filter
//! ```
//!
//! Loads are normalized per snapshot: every CPU's runnable demand is divided
//! by the same scale, `load_scale` or the largest online demand if that is
//! higher, so loads stay in `[0, 1]` and keep their ratios. A CPU is a migration source when its projected load
//! exceeds the mean by more than `imbalance_threshold` (relative). Each
//! planned move must shrink the total deviation from the mean.
//!
//! Plan execution treats every entry independently: a failed step is logged
//! and reported, and the remaining entries still run.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::BalancerConfig;
use crate::error::{MigrationFailure, SchedError};
use crate::math;
use crate::predictor::{Outcome, PredictorSet};
use crate::runqueue::{QueuedTask, RunQueueSet};
use crate::types::{CpuId, TaskId};

/// Minimum benefit for a move to be worth planning
const MIN_BENEFIT: f64 = 1e-9;

// ============================================================================
// LOAD SNAPSHOT
// ============================================================================

/// Load of one CPU at snapshot time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuLoad {
    pub cpu: CpuId,
    /// Runnable tasks
    pub runnable: usize,
    /// Sum of per-task load
    pub demand: f64,
    /// Normalized load (0..1)
    pub load: f64,
    pub online: bool,
}

/// Per-CPU load plus the migratable tasks on each CPU
#[derive(Debug, Clone, Default)]
pub struct SystemLoad {
    pub cpus: Vec<CpuLoad>,
    /// Queued tasks per CPU, excluding the one currently running
    pub tasks: Vec<Vec<QueuedTask>>,
    /// Demand mapping to a load of 1.0 in this snapshot
    pub load_scale: f64,
}

impl SystemLoad {
    /// Snapshot every run queue, one lock at a time.
    ///
    /// `load_scale` is the minimum scale; a busier online CPU raises it to
    /// its own demand.
    pub fn capture(queues: &RunQueueSet, load_scale: f64) -> Self {
        let mut cpus = Vec::with_capacity(queues.cpu_count());
        let mut tasks = Vec::with_capacity(queues.cpu_count());
        for cpu in 0..queues.cpu_count() as CpuId {
            let online = queues.is_online(cpu);
            let (runnable, demand, movable) = match queues.lock(cpu) {
                Ok(q) => {
                    let movable: Vec<QueuedTask> = q
                        .tasks()
                        .iter()
                        .filter(|t| Some(t.task) != q.current())
                        .copied()
                        .collect();
                    (q.len(), q.demand(), movable)
                },
                Err(_) => (0, 0.0, Vec::new()),
            };
            cpus.push(CpuLoad {
                cpu,
                runnable,
                demand,
                load: 0.0,
                online,
            });
            tasks.push(movable);
        }
        let load_scale = cpus
            .iter()
            .filter(|c| c.online)
            .map(|c| c.demand)
            .fold(load_scale, f64::max);
        for c in &mut cpus {
            c.load = if load_scale > 0.0 {
                math::unit(c.demand / load_scale)
            } else {
                0.0
            };
        }
        Self {
            cpus,
            tasks,
            load_scale,
        }
    }

    /// Mean normalized load of online CPUs
    pub fn mean_load(&self) -> f64 {
        let online: Vec<f64> = self.cpus.iter().filter(|c| c.online).map(|c| c.load).collect();
        if online.is_empty() {
            0.0
        } else {
            online.iter().sum::<f64>() / online.len() as f64
        }
    }

    /// Normalized load a single task contributes
    #[inline]
    pub fn task_load(&self, task: &QueuedTask) -> f64 {
        if self.load_scale > 0.0 {
            task.load / self.load_scale
        } else {
            0.0
        }
    }
}

// ============================================================================
// MIGRATION PLAN
// ============================================================================

/// One planned move
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MigrationEntry {
    pub task: TaskId,
    pub from: CpuId,
    pub to: CpuId,
    /// Reduction in total deviation from the mean load
    pub estimated_benefit: f64,
    /// Normalized load the task carries
    pub load: f64,
    /// Cache/NUMA cost, filled in by the placement filter
    pub cost: f64,
}

impl MigrationEntry {
    /// Create an entry with no cost assessed yet
    pub fn new(task: TaskId, from: CpuId, to: CpuId, estimated_benefit: f64, load: f64) -> Self {
        Self {
            task,
            from,
            to,
            estimated_benefit,
            load,
            cost: 0.0,
        }
    }

    /// Benefit minus cost
    #[inline]
    pub fn net_benefit(&self) -> f64 {
        self.estimated_benefit - self.cost
    }
}

/// Ordered migrations, consumed exactly once by [`LoadBalancer::execute`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationPlan {
    pub entries: Vec<MigrationEntry>,
    /// Candidates dropped by filtering
    pub rejected: usize,
}

impl MigrationPlan {
    /// Plan from entries
    pub fn from_entries(entries: Vec<MigrationEntry>) -> Self {
        Self {
            entries,
            rejected: 0,
        }
    }

    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Executes one migration step
pub trait MigrationStep {
    /// Move the entry's task; failure leaves it where it was
    fn migrate(&self, entry: &MigrationEntry) -> Result<(), MigrationFailure>;
}

/// Result of one executed entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MigrationOutcome {
    pub entry: MigrationEntry,
    pub result: Result<(), MigrationFailure>,
}

impl MigrationOutcome {
    /// Error form of a failed step
    pub fn error(&self) -> Option<SchedError> {
        self.result.err().map(|reason| SchedError::MigrationStepFailed {
            task: self.entry.task,
            from: self.entry.from,
            to: self.entry.to,
            reason,
        })
    }
}

/// Per-entry results of a plan execution, in execution order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub outcomes: Vec<MigrationOutcome>,
    /// Entries the placement filter removed before execution
    pub rejected: usize,
}

impl MigrationReport {
    /// Successful steps
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// Failed steps
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Errors of the failed steps
    pub fn errors(&self) -> impl Iterator<Item = SchedError> + '_ {
        self.outcomes.iter().filter_map(|o| o.error())
    }
}

// ============================================================================
// LOAD BALANCER
// ============================================================================

/// Periodic load balancer and migration planner
#[derive(Debug)]
pub struct LoadBalancer {
    config: BalancerConfig,
    last_run: AtomicU64,
    passes: AtomicU64,
}

impl LoadBalancer {
    /// Create a balancer
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            last_run: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    /// Configuration
    #[inline(always)]
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Claim the balancing pass for `tick` if one is due.
    ///
    /// Only one caller wins per interval.
    pub fn claim(&self, tick: u64) -> bool {
        let interval = self.config.interval_ticks.max(1);
        let last = self.last_run.load(Ordering::Acquire);
        if tick < last.saturating_add(interval) {
            return false;
        }
        self.last_run
            .compare_exchange(last, tick, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Balancing passes planned so far
    #[inline]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Projected normalized load per CPU.
    ///
    /// Each observed load is fed to the load-evolution predictor first; CPUs
    /// it cannot project keep their current load.
    pub fn project(&self, system: &SystemLoad, predictors: &PredictorSet) -> Vec<f64> {
        system
            .cpus
            .iter()
            .map(|c| {
                if !c.online {
                    return c.load;
                }
                predictors.observe(&Outcome::Load {
                    cpu: c.cpu,
                    load: c.load,
                });
                predictors
                    .project_load(c)
                    .map(|score| score.value)
                    .unwrap_or(c.load)
            })
            .collect()
    }

    /// Plan migrations for a load snapshot.
    ///
    /// `pinned(cpu, task)` marks tasks that must not move (admitted
    /// real-time tasks).
    pub fn plan_migrations<F>(&self, system: &SystemLoad, predictors: &PredictorSet, pinned: F) -> MigrationPlan
    where
        F: Fn(CpuId, TaskId) -> bool,
    {
        self.passes.fetch_add(1, Ordering::Relaxed);
        let mut projected = self.project(system, predictors);
        let online: Vec<bool> = system.cpus.iter().map(|c| c.online).collect();
        let online_count = online.iter().filter(|&&o| o).count();
        if online_count < 2 {
            return MigrationPlan::default();
        }
        let mean = projected
            .iter()
            .zip(&online)
            .filter(|(_, &o)| o)
            .map(|(p, _)| *p)
            .sum::<f64>()
            / online_count as f64;
        if mean <= 0.0 {
            return MigrationPlan::default();
        }
        let limit = mean * (1.0 + self.config.imbalance_threshold);

        let mut sources: Vec<usize> = (0..projected.len())
            .filter(|&i| online[i] && projected[i] > limit)
            .collect();
        sources.sort_by(|&a, &b| projected[b].total_cmp(&projected[a]).then(a.cmp(&b)));

        let mut entries = Vec::new();
        'sources: for src in sources {
            let Some(tasks) = system.tasks.get(src) else {
                continue;
            };
            let mut movable: Vec<&QueuedTask> = tasks
                .iter()
                .filter(|t| !t.realtime && !pinned(src as CpuId, t.task))
                .collect();
            movable.sort_by(|a, b| b.load.total_cmp(&a.load).then(a.task.cmp(&b.task)));

            for task in movable {
                if entries.len() >= self.config.max_migrations {
                    break 'sources;
                }
                if projected[src] <= limit {
                    break;
                }
                let l = system.task_load(task);
                let dst = (0..projected.len())
                    .filter(|&d| d != src && online[d] && projected[d] < mean)
                    .filter(|&d| task.affinity.contains(d as CpuId))
                    .min_by(|&a, &b| projected[a].total_cmp(&projected[b]).then(a.cmp(&b)));
                let Some(dst) = dst else {
                    continue;
                };
                let before = math::abs(projected[src] - mean) + math::abs(projected[dst] - mean);
                let after = math::abs(projected[src] - l - mean) + math::abs(projected[dst] + l - mean);
                let benefit = before - after;
                if benefit <= MIN_BENEFIT {
                    continue;
                }
                projected[src] -= l;
                projected[dst] += l;
                entries.push(MigrationEntry::new(task.task, src as CpuId, dst as CpuId, benefit, l));
            }
        }

        if !entries.is_empty() {
            log::debug!(
                "sched: balancer planned {} migration(s), mean load {:.3}",
                entries.len(),
                mean
            );
        }
        MigrationPlan::from_entries(entries)
    }

    /// Execute every entry independently
    pub fn execute(&self, plan: MigrationPlan, step: &dyn MigrationStep) -> MigrationReport {
        let mut outcomes = Vec::with_capacity(plan.entries.len());
        for entry in plan.entries {
            let result = step.migrate(&entry);
            if let Err(reason) = result {
                log::warn!(
                    "sched: migration of {} cpu{}->cpu{} failed: {}",
                    entry.task,
                    entry.from,
                    entry.to,
                    reason.name()
                );
            }
            outcomes.push(MigrationOutcome { entry, result });
        }
        MigrationReport {
            outcomes,
            rejected: plan.rejected,
        }
    }

    /// Feed executed outcomes back to the load-evolution predictor
    pub fn report(&self, report: &MigrationReport, predictors: &PredictorSet) {
        for outcome in &report.outcomes {
            predictors.observe(&Outcome::Migration {
                task: outcome.entry.task,
                from: outcome.entry.from,
                to: outcome.entry.to,
                load: outcome.entry.load,
                succeeded: outcome.result.is_ok(),
            });
        }
    }
}
