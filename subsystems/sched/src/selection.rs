//! # Task Selection Engine
//!
//! Picks the next task for a CPU from its candidate list and sizes its
//! quantum. Candidates are totally ordered by:
//!
//! 1. finalized priority, highest first
//! 2. estimated context-switch cost, lowest first
//! 3. wait start, earliest first (FIFO fairness)
//! 4. task id, lowest first
//!
//! An empty or fully blocked list yields `None`: the CPU idles.

use core::cmp::Ordering;

use crate::classifier::WorkloadClass;
use crate::config::QuantumConfig;
use crate::context::TaskContext;
use crate::placement::PlacementOptimizer;
use crate::predictor::PredictorSet;
use crate::types::{CpuId, Nanoseconds, PriorityLevel, TaskId};

/// Switch cost when the task last ran on this CPU
pub const SWITCH_COST_LOCAL: Nanoseconds = Nanoseconds::from_micros(2);

/// Switch cost within the task's node
pub const SWITCH_COST_NODE: Nanoseconds = Nanoseconds::from_micros(5);

/// Extra switch cost for the farthest node pair
pub const SWITCH_COST_REMOTE: Nanoseconds = Nanoseconds::from_micros(10);

// ============================================================================
// CANDIDATES
// ============================================================================

/// One runnable candidate on a CPU, built fresh every tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionCriteria {
    pub task: TaskId,
    pub priority: PriorityLevel,
    pub class: WorkloadClass,
    pub switch_cost: Nanoseconds,
    pub wait_start: Nanoseconds,
    pub runnable: bool,
    /// Snapshot used for the quantum prediction
    pub context: TaskContext,
    /// Remaining real-time budget, if the task holds a reservation
    pub rt_budget: Option<Nanoseconds>,
}

impl SelectionCriteria {
    /// Runnable candidate with no switch cost
    pub fn new(context: TaskContext, priority: PriorityLevel, class: WorkloadClass) -> Self {
        Self {
            task: context.task,
            priority,
            class,
            switch_cost: Nanoseconds::ZERO,
            wait_start: context.wait_start,
            runnable: true,
            context,
            rt_budget: None,
        }
    }

    /// Set the switch cost
    pub fn with_switch_cost(mut self, cost: Nanoseconds) -> Self {
        self.switch_cost = cost;
        self
    }

    /// Set the real-time budget
    pub fn with_rt_budget(mut self, budget: Nanoseconds) -> Self {
        self.rt_budget = Some(budget);
        self
    }

    /// Ordering where `Less` means "runs first"
    pub fn precedence(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.switch_cost.cmp(&other.switch_cost))
            .then(self.wait_start.cmp(&other.wait_start))
            .then(self.task.cmp(&other.task))
    }
}

/// Result of a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub task: TaskId,
    pub quantum: Nanoseconds,
    pub priority: PriorityLevel,
    pub class: WorkloadClass,
}

// ============================================================================
// QUANTUM
// ============================================================================

/// Clamp a raw quantum in nanoseconds to `[floor, ceiling]`.
///
/// NaN maps to the floor.
pub fn clamp_quantum(raw_ns: f64, floor: Nanoseconds, ceiling: Nanoseconds) -> Nanoseconds {
    let lo = floor.raw() as f64;
    let hi = ceiling.raw() as f64;
    if raw_ns.is_nan() || raw_ns <= lo {
        return floor;
    }
    if raw_ns >= hi {
        return ceiling;
    }
    Nanoseconds::new(raw_ns as u64)
}

/// Estimated context-switch cost of running `ctx` on `cpu`
pub fn estimate_switch_cost(ctx: &TaskContext, cpu: CpuId, placement: &PlacementOptimizer) -> Nanoseconds {
    if ctx.last_cpu == Some(cpu) {
        return SWITCH_COST_LOCAL;
    }
    let (Some(home), Some(here)) = (ctx.last_node, placement.node_of(cpu)) else {
        return SWITCH_COST_NODE;
    };
    let remote = placement.relative_distance(home, here) * SWITCH_COST_REMOTE.raw() as f64;
    SWITCH_COST_NODE + Nanoseconds::new(remote as u64)
}

// ============================================================================
// ENGINE
// ============================================================================

/// Task selection engine
#[derive(Debug, Clone, Copy)]
pub struct SelectionEngine {
    quantum: QuantumConfig,
}

impl SelectionEngine {
    /// Create an engine with the given quantum bounds
    pub fn new(quantum: QuantumConfig) -> Self {
        Self { quantum }
    }

    /// Quantum bounds
    #[inline(always)]
    pub fn quantum_bounds(&self) -> &QuantumConfig {
        &self.quantum
    }

    /// Best runnable candidate, without sizing a quantum
    pub fn pick<'a>(&self, candidates: &'a [SelectionCriteria]) -> Option<&'a SelectionCriteria> {
        candidates
            .iter()
            .filter(|c| c.runnable)
            .min_by(|a, b| a.precedence(b))
    }

    /// Quantum for a candidate.
    ///
    /// The quantum predictor's value maps linearly onto `[floor, ceiling]`;
    /// without a usable prediction the configured default applies. The class
    /// policy scales the result, which is then clamped. Real-time candidates
    /// are further capped by their remaining budget, never below the floor.
    pub fn quantum_for(&self, candidate: &SelectionCriteria, predictors: &PredictorSet) -> Nanoseconds {
        let q = &self.quantum;
        let floor = q.floor.raw() as f64;
        let span = q.ceiling.saturating_sub(q.floor).raw() as f64;
        let base = match predictors.quantum(&candidate.context) {
            Ok(score) if !score.value.is_nan() => floor + score.value.clamp(0.0, 1.0) * span,
            _ => q.default.raw() as f64,
        };
        let scaled = base * candidate.class.policy().quantum_scale;
        let quantum = clamp_quantum(scaled, q.floor, q.ceiling);
        match candidate.rt_budget {
            Some(budget) => quantum.min(budget).max(q.floor),
            None => quantum,
        }
    }

    /// Pick the next task and its quantum
    pub fn select_next(
        &self,
        candidates: &[SelectionCriteria],
        predictors: &PredictorSet,
    ) -> Option<Selection> {
        let best = self.pick(candidates)?;
        Some(Selection {
            task: best.task,
            quantum: self.quantum_for(best, predictors),
            priority: best.priority,
            class: best.class,
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::boxed::Box;

    use super::*;
    use crate::config::{FusionWeights, PlacementConfig};
    use crate::error::PredictorUnavailable;
    use crate::numa::NumaTopology;
    use crate::predictor::{Predictor, PredictorKind, Score};

    struct RawQuantum(f64);

    impl Predictor<TaskContext> for RawQuantum {
        fn kind(&self) -> PredictorKind {
            PredictorKind::Quantum
        }

        fn predict(&self, _ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
            Ok(Score::new(self.0, 1.0))
        }
    }

    fn candidate(id: u64, prio: u8, wait_start_ms: u64) -> SelectionCriteria {
        let ctx = TaskContext::new(TaskId::new(id))
            .with_wait(Nanoseconds::from_millis(wait_start_ms), Nanoseconds::ZERO);
        SelectionCriteria::new(ctx, PriorityLevel::new(prio), WorkloadClass::Unknown)
    }

    fn engine() -> SelectionEngine {
        SelectionEngine::new(QuantumConfig::default())
    }

    #[test]
    fn test_empty_is_idle() {
        let set = PredictorSet::new(FusionWeights::default());
        assert_eq!(engine().select_next(&[], &set), None);

        let mut blocked = candidate(1, 50, 0);
        blocked.runnable = false;
        assert_eq!(engine().select_next(&[blocked], &set), None);
    }

    #[test]
    fn test_tie_breaks() {
        let e = engine();
        let a = candidate(1, 40, 5).with_switch_cost(SWITCH_COST_NODE);
        let b = candidate(2, 40, 9).with_switch_cost(SWITCH_COST_LOCAL);
        assert_eq!(e.pick(&[a, b]).unwrap().task, TaskId::new(2));

        let c = candidate(3, 40, 1);
        let d = candidate(4, 40, 2);
        assert_eq!(e.pick(&[d, c]).unwrap().task, TaskId::new(3));

        let x = candidate(6, 40, 1);
        let y = candidate(5, 40, 1);
        assert_eq!(e.pick(&[x, y]).unwrap().task, TaskId::new(5));

        let hi = candidate(7, 41, 100);
        assert_eq!(e.pick(&[a, b, c, hi]).unwrap().task, TaskId::new(7));
    }

    #[test]
    fn test_quantum_clamped_for_any_raw_output() {
        let e = engine();
        let q = QuantumConfig::default();
        for raw in [-5.0, -0.1, 0.0, 0.5, 1.0, 3.0, 1e12, f64::NAN, f64::INFINITY] {
            let mut set = PredictorSet::new(FusionWeights::default());
            set.add(Box::new(RawQuantum(raw)));
            for class in WorkloadClass::ALL {
                let mut c = candidate(1, 10, 0);
                c.class = class;
                let quantum = e.quantum_for(&c, &set);
                assert!(quantum >= q.floor && quantum <= q.ceiling, "raw {} -> {}", raw, quantum);
            }
        }
    }

    #[test]
    fn test_quantum_default_without_predictor() {
        let set = PredictorSet::new(FusionWeights::default());
        let c = candidate(1, 10, 0);
        assert_eq!(engine().quantum_for(&c, &set), QuantumConfig::default().default);
    }

    #[test]
    fn test_interactive_quantum_shorter_than_batch() {
        let mut set = PredictorSet::new(FusionWeights::default());
        set.add(Box::new(RawQuantum(0.2)));
        let mut interactive = candidate(1, 10, 0);
        interactive.class = WorkloadClass::Interactive;
        let mut batch = candidate(2, 10, 0);
        batch.class = WorkloadClass::Batch;
        let e = engine();
        assert!(e.quantum_for(&interactive, &set) < e.quantum_for(&batch, &set));
    }

    #[test]
    fn test_rt_budget_caps_quantum() {
        let set = PredictorSet::new(FusionWeights::default());
        let e = engine();
        let c = candidate(1, 99, 0).with_rt_budget(Nanoseconds::from_millis(3));
        assert_eq!(e.quantum_for(&c, &set), Nanoseconds::from_millis(3));
        let tiny = candidate(1, 99, 0).with_rt_budget(Nanoseconds::from_micros(10));
        assert_eq!(e.quantum_for(&tiny, &set), QuantumConfig::default().floor);
    }

    #[test]
    fn test_switch_cost_estimate() {
        let placement = PlacementOptimizer::new(
            NumaTopology::uniform(2, 2, 20),
            4,
            PlacementConfig::default(),
        )
        .unwrap();
        let ctx = TaskContext::new(TaskId::new(1)).with_last_run(0, 0, Nanoseconds::ZERO);
        let local = estimate_switch_cost(&ctx, 0, &placement);
        let node = estimate_switch_cost(&ctx, 1, &placement);
        let remote = estimate_switch_cost(&ctx, 2, &placement);
        assert!(local < node && node < remote);
        assert_eq!(remote, SWITCH_COST_NODE + SWITCH_COST_REMOTE);
    }
}
