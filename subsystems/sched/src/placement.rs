//! # NUMA/Cache-Aware Placement Optimizer
//!
//! Pure functions over a static topology loaded at init:
//!
//! - [`PlacementOptimizer::priority_delta`] nudges a fused priority score
//!   toward CPUs near the task's memory and warm cache, bounded to
//!   `±max_adjustment` of the score.
//! - [`PlacementOptimizer::filter`] drops migration entries whose cache and
//!   NUMA cost is at least their load-balancing benefit, then orders the rest
//!   by net benefit.
//!
//! Costs and benefits share one unit: normalized CPU load.

extern crate alloc;

use alloc::vec::Vec;

use crate::balancer::{MigrationEntry, MigrationPlan};
use crate::config::PlacementConfig;
use crate::context::TaskContext;
use crate::error::{InitError, InitErrorKind, InitStage};
use crate::math;
use crate::numa::{NumaTopology, LOCAL_DISTANCE};
use crate::types::{CpuId, Nanoseconds, NodeId, TaskId};

/// Placement optimizer
#[derive(Debug, Clone)]
pub struct PlacementOptimizer {
    topology: NumaTopology,
    /// CPU → node
    cpu_nodes: Vec<NodeId>,
    config: PlacementConfig,
}

impl PlacementOptimizer {
    /// Build an optimizer for `cpu_count` CPUs.
    ///
    /// Fails unless the topology maps every CPU to exactly one node.
    pub fn new(
        topology: NumaTopology,
        cpu_count: usize,
        config: PlacementConfig,
    ) -> Result<Self, InitError> {
        let cpu_nodes = topology.cpu_node_table(cpu_count).map_err(|reason| {
            InitError::new(
                InitStage::PlacementOptimizer,
                InitErrorKind::InvalidTopology,
                reason,
            )
        })?;
        Ok(Self {
            topology,
            cpu_nodes,
            config,
        })
    }

    /// Topology in use
    #[inline(always)]
    pub fn topology(&self) -> &NumaTopology {
        &self.topology
    }

    /// CPU → node table
    #[inline(always)]
    pub fn cpu_nodes(&self) -> &[NodeId] {
        &self.cpu_nodes
    }

    /// Node of a CPU
    #[inline]
    pub fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        self.cpu_nodes.get(cpu as usize).copied()
    }

    /// Relative distance between nodes: 0 for local, 1 for the farthest pair
    pub fn relative_distance(&self, from: NodeId, to: NodeId) -> f64 {
        let span = self.topology.max_distance().saturating_sub(LOCAL_DISTANCE);
        if span == 0 {
            return 0.0;
        }
        let d = self.topology.distance(from, to).saturating_sub(LOCAL_DISTANCE);
        math::unit(d as f64 / span as f64)
    }

    /// Fraction of the task's cache footprint still resident at `now`
    pub fn cache_residency(&self, ctx: &TaskContext, now: Nanoseconds) -> f64 {
        let Some(last) = ctx.last_ran_at else {
            return 0.0;
        };
        let decay = self.config.cache_decay.raw().max(1) as f64;
        math::exp(-(now.since(last).raw() as f64) / decay)
    }

    /// Bounded adjustment to a fused score for running `ctx` on `cpu`.
    ///
    /// Positive when `cpu` is on the task's node (and, more so, is the CPU
    /// with its warm cache); negative when it is remote. Always within
    /// `±max_adjustment × fused`.
    pub fn priority_delta(&self, ctx: &TaskContext, cpu: CpuId, fused: f64) -> f64 {
        let (Some(home), Some(target)) = (ctx.last_node, self.node_of(cpu)) else {
            return 0.0;
        };
        let locality = 1.0 - 2.0 * self.relative_distance(home, target);
        let cache = self.cache_residency(ctx, ctx.captured_at);
        let warmth = if ctx.last_cpu == Some(cpu) { cache } else { -cache };
        let signal = (0.5 * locality + 0.5 * warmth).clamp(-1.0, 1.0);
        let bound = self.config.max_adjustment * math::unit(fused);
        (bound * signal).clamp(-bound, bound)
    }

    /// Cost of moving `ctx` from `from` to `to`, in normalized load
    pub fn migration_cost(&self, ctx: &TaskContext, from: CpuId, to: CpuId, now: Nanoseconds) -> f64 {
        let numa = match (self.node_of(from), self.node_of(to)) {
            (Some(a), Some(b)) => self.relative_distance(a, b),
            _ => 1.0,
        };
        let cache = if from == to { 0.0 } else { self.cache_residency(ctx, now) };
        cache * self.config.cache_weight + numa * self.config.numa_weight
    }

    /// Reject entries whose cost is at least their benefit and order the
    /// remainder by net benefit, highest first.
    ///
    /// Entries whose task has no context (it left the scheduler) are dropped.
    pub fn filter<F>(&self, plan: MigrationPlan, context_of: F, now: Nanoseconds) -> MigrationPlan
    where
        F: Fn(TaskId) -> Option<TaskContext>,
    {
        let mut rejected = plan.rejected;
        let mut kept: Vec<MigrationEntry> = Vec::with_capacity(plan.entries.len());
        for mut entry in plan.entries {
            let Some(ctx) = context_of(entry.task) else {
                rejected += 1;
                continue;
            };
            entry.cost = self.migration_cost(&ctx, entry.from, entry.to, now);
            if entry.cost >= entry.estimated_benefit {
                log::trace!(
                    "sched: placement rejects {} cpu{}->cpu{} (cost {:.3} >= benefit {:.3})",
                    entry.task,
                    entry.from,
                    entry.to,
                    entry.cost,
                    entry.estimated_benefit
                );
                rejected += 1;
                continue;
            }
            kept.push(entry);
        }
        // Stable: equal net benefit keeps planner order
        kept.sort_by(|a, b| b.net_benefit().total_cmp(&a.net_benefit()));
        MigrationPlan {
            entries: kept,
            rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    fn optimizer() -> PlacementOptimizer {
        // Two nodes of two CPUs, remote distance 20
        PlacementOptimizer::new(NumaTopology::uniform(2, 2, 20), 4, PlacementConfig::default())
            .unwrap()
    }

    fn entry(task: u64, from: CpuId, to: CpuId, benefit: f64) -> MigrationEntry {
        MigrationEntry::new(TaskId::new(task), from, to, benefit, 0.125)
    }

    #[test]
    fn test_rejects_unmapped_topology() {
        let err = PlacementOptimizer::new(NumaTopology::single_node(2), 4, PlacementConfig::default())
            .unwrap_err();
        assert_eq!(err.stage, InitStage::PlacementOptimizer);
        assert_eq!(err.kind, InitErrorKind::InvalidTopology);
    }

    #[test]
    fn test_priority_delta_bounded() {
        let opt = optimizer();
        let now = Nanoseconds::from_millis(10);
        let mut ctx = TaskContext::new(TaskId::new(1)).with_last_run(0, 0, now);
        ctx.captured_at = now;

        for fused in [0.0, 0.3, 0.7, 1.0] {
            for cpu in 0..4 {
                let delta = opt.priority_delta(&ctx, cpu, fused);
                assert!(delta.abs() <= 0.10 * fused + 1e-12);
            }
        }
        assert!(opt.priority_delta(&ctx, 0, 0.5) > 0.0);
        assert!(opt.priority_delta(&ctx, 3, 0.5) < 0.0);
        assert!(opt.priority_delta(&ctx, 0, 0.5) > opt.priority_delta(&ctx, 1, 0.5));
    }

    #[test]
    fn test_priority_delta_without_history() {
        let opt = optimizer();
        let ctx = TaskContext::new(TaskId::new(1));
        assert_eq!(opt.priority_delta(&ctx, 2, 0.8), 0.0);
    }

    #[test]
    fn test_cache_residency_decays() {
        let opt = optimizer();
        let ctx = TaskContext::new(TaskId::new(1)).with_last_run(0, 0, Nanoseconds::ZERO);
        let hot = opt.cache_residency(&ctx, Nanoseconds::ZERO);
        let warm = opt.cache_residency(&ctx, Nanoseconds::from_millis(10));
        let cold = opt.cache_residency(&ctx, Nanoseconds::from_millis(100));
        assert_eq!(hot, 1.0);
        assert!(warm < hot && cold < warm);
        assert!(cold < 1e-4);
    }

    #[test]
    fn test_filter_rejects_costly_and_reorders() {
        let opt = optimizer();
        let now = Nanoseconds::from_millis(1);
        let plan = MigrationPlan::from_entries(alloc::vec![
            // Cross-node with a hot cache costs 0.10
            entry(1, 0, 2, 0.06),
            entry(2, 0, 1, 0.10),
            entry(3, 1, 0, 0.30),
            entry(99, 1, 0, 0.50),
        ]);
        let contexts = |task: TaskId| match task.raw() {
            1 | 2 | 3 => Some(TaskContext::new(task).with_last_run(0, 0, now)),
            _ => None,
        };
        let filtered = opt.filter(plan, contexts, now);
        let order: Vec<u64> = filtered.entries.iter().map(|e| e.task.raw()).collect();
        assert_eq!(order, alloc::vec![3, 2]);
        assert_eq!(filtered.rejected, 2);
        assert!(filtered.entries.iter().all(|e| e.cost < e.estimated_benefit));
    }

    #[test]
    fn test_single_node_has_no_numa_cost() {
        let opt =
            PlacementOptimizer::new(NumaTopology::single_node(2), 2, PlacementConfig::default())
                .unwrap();
        let ctx = TaskContext::new(TaskId::new(1));
        assert_eq!(opt.migration_cost(&ctx, 0, 1, Nanoseconds::ZERO), 0.0);
        assert_eq!(opt.relative_distance(0, 0), 0.0);
    }
}
