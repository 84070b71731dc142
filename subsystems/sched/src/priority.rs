//! # Priority Calculation Engine
//!
//! Fuses the available prediction signals into one priority level:
//!
//! 1. collect scores, skipping unavailable predictors (none at all is the
//!    degraded mode: the configured default priority, no adjustments)
//! 2. confidence-weighted average, weight = confidence × per-kind weight
//! 3. an admitted real-time reservation forces [`PriorityLevel::MAX`]
//! 4. add the class bias and the placement delta (bounded to ±10% of the
//!    fused score)
//! 5. finalize onto `0..=NORMAL_MAX`
//! 6. outcomes go to the feedback queue without blocking
//!
//! Nothing here returns an error.

use heapless::Vec as FixedVec;

use crate::classifier::WorkloadClass;
use crate::context::TaskContext;
use crate::feedback::{FeedbackQueue, FEEDBACK_DRAIN_MARK};
use crate::math;
use crate::placement::PlacementOptimizer;
use crate::predictor::{Outcome, PredictionSet, PredictorKind, PredictorSet};
use crate::types::{CpuId, PriorityLevel, TaskId};

/// (kind, effective weight) pairs that fed a fusion
pub type Contributions = FixedVec<(PredictorKind, f64), 4>;

// ============================================================================
// PRIORITY CALCULATION
// ============================================================================

/// Intermediate and final result of one priority calculation
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityCalculation {
    pub task: TaskId,
    /// Confidence-weighted fused score (0..1); 0 in degraded mode
    pub base_score: f64,
    /// Predictors that contributed and their effective weights
    pub contributions: Contributions,
    pub class: WorkloadClass,
    /// Class policy bias applied
    pub class_bias: f64,
    /// Forced to the real-time level
    pub realtime_override: bool,
    /// NUMA/cache adjustment applied
    pub placement_delta: f64,
    /// No predictor was available
    pub degraded: bool,
    /// Finalized level
    pub priority: PriorityLevel,
}

/// Fuse available scores by confidence-weighted average.
///
/// Returns `None` when nothing carries positive weight.
pub fn fuse(set: &PredictionSet, weight_of: impl Fn(PredictorKind) -> f64) -> Option<(f64, Contributions)> {
    let mut contributions = Contributions::new();
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (kind, score) in set.available() {
        let w = score.confidence * weight_of(kind);
        if !w.is_finite() || w <= 0.0 {
            continue;
        }
        weighted += w * score.value;
        total += w;
        // At most four fused kinds, so this never overflows
        let _ = contributions.push((kind, w));
    }
    if total > 0.0 {
        Some((math::unit(weighted / total), contributions))
    } else {
        None
    }
}

/// Map a 0..1 score onto the best-effort scale
#[inline]
pub fn finalize(score: f64) -> PriorityLevel {
    let level = math::round(math::unit(score) * PriorityLevel::NORMAL_MAX.value() as f64);
    PriorityLevel::normal(level as u8)
}

// ============================================================================
// ENGINE
// ============================================================================

/// Priority calculation engine; owns the feedback loop
#[derive(Debug)]
pub struct PriorityEngine {
    default_priority: PriorityLevel,
    feedback: FeedbackQueue,
}

impl PriorityEngine {
    /// Create an engine with a degraded-mode default
    pub fn new(default_priority: PriorityLevel) -> Self {
        Self {
            default_priority: PriorityLevel::normal(default_priority.value()),
            feedback: FeedbackQueue::new(),
        }
    }

    /// Degraded-mode priority
    #[inline(always)]
    pub fn default_priority(&self) -> PriorityLevel {
        self.default_priority
    }

    /// Compute the priority of `ctx` for running on `cpu`
    pub fn calculate(
        &self,
        ctx: &TaskContext,
        cpu: CpuId,
        class: WorkloadClass,
        realtime_admitted: bool,
        predictors: &PredictorSet,
        placement: &PlacementOptimizer,
    ) -> PriorityCalculation {
        let scores = predictors.collect(ctx);
        let fused = fuse(&scores, |kind| predictors.weight(kind));

        let mut calc = PriorityCalculation {
            task: ctx.task,
            base_score: 0.0,
            contributions: Contributions::new(),
            class,
            class_bias: 0.0,
            realtime_override: false,
            placement_delta: 0.0,
            degraded: fused.is_none(),
            priority: self.default_priority,
        };

        if let Some((score, contributions)) = fused {
            calc.base_score = score;
            calc.contributions = contributions;
        }

        if realtime_admitted {
            calc.realtime_override = true;
            calc.priority = PriorityLevel::MAX;
            return calc;
        }

        if calc.degraded {
            log::trace!("sched: {} degraded to {}", ctx.task, self.default_priority);
            return calc;
        }

        calc.class_bias = class.policy().priority_bias;
        calc.placement_delta = placement.priority_delta(ctx, cpu, calc.base_score);
        calc.priority = finalize(calc.base_score + calc.class_bias + calc.placement_delta);
        calc
    }

    /// Queue an outcome for the predictors; never blocks
    #[inline]
    pub fn report(&self, outcome: Outcome) -> bool {
        self.feedback.push(outcome)
    }

    /// Deliver queued outcomes to the predictors (balancer path)
    pub fn deliver_feedback(&self, predictors: &PredictorSet) -> usize {
        self.feedback.drain(|outcome| predictors.observe(outcome))
    }

    /// Deliver one bounded batch once the backlog reaches the drain mark
    pub fn relieve_feedback(&self, predictors: &PredictorSet) -> usize {
        if self.feedback.pending() < FEEDBACK_DRAIN_MARK as u64 {
            return 0;
        }
        self.feedback
            .drain_up_to(FEEDBACK_DRAIN_MARK, |outcome| predictors.observe(outcome))
    }

    /// Feedback queue
    #[inline(always)]
    pub fn feedback(&self) -> &FeedbackQueue {
        &self.feedback
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::boxed::Box;

    use super::*;
    use crate::config::{FusionWeights, PlacementConfig};
    use crate::error::{PredictorUnavailable, UnavailableReason};
    use crate::numa::NumaTopology;
    use crate::predictor::{Predictor, Score};
    use crate::types::Nanoseconds;

    struct Fixed(PredictorKind, Option<Score>);

    impl Predictor<TaskContext> for Fixed {
        fn kind(&self) -> PredictorKind {
            self.0
        }

        fn predict(&self, _ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
            self.1
                .ok_or(PredictorUnavailable::new(self.0, UnavailableReason::InsufficientData))
        }
    }

    fn placement() -> PlacementOptimizer {
        PlacementOptimizer::new(NumaTopology::single_node(2), 2, PlacementConfig::default())
            .unwrap()
    }

    fn set_with(scores: &[(PredictorKind, Option<Score>)]) -> PredictorSet {
        let mut set = PredictorSet::new(FusionWeights::default());
        for &(kind, score) in scores {
            set.add(Box::new(Fixed(kind, score)));
        }
        set
    }

    fn ctx() -> TaskContext {
        TaskContext::new(TaskId::new(1))
    }

    #[test]
    fn test_confidence_weighted_fusion() {
        let mut set = PredictionSet::default();
        set.set(PredictorKind::Priority, Score::new(1.0, 0.75));
        set.set(PredictorKind::Temporal, Score::new(0.0, 0.25));
        let (score, contributions) = fuse(&set, |_| 1.0).unwrap();
        assert!((score - 0.75).abs() < 1e-12);
        assert_eq!(contributions.len(), 2);
    }

    #[test]
    fn test_zero_confidence_everywhere_is_degraded() {
        let mut set = PredictionSet::default();
        set.set(PredictorKind::Priority, Score::new(0.9, 0.0));
        assert!(fuse(&set, |_| 1.0).is_none());
    }

    #[test]
    fn test_all_unavailable_returns_default() {
        let engine = PriorityEngine::new(PriorityLevel::new(30));
        let set = set_with(&[
            (PredictorKind::Priority, None),
            (PredictorKind::Temporal, None),
            (PredictorKind::Contextual, None),
            (PredictorKind::Policy, None),
        ]);
        let calc = engine.calculate(&ctx(), 0, WorkloadClass::Interactive, false, &set, &placement());
        assert!(calc.degraded);
        assert_eq!(calc.priority, PriorityLevel::new(30));
        assert_eq!(calc.placement_delta, 0.0);
    }

    #[test]
    fn test_realtime_override_dominates() {
        let engine = PriorityEngine::new(PriorityLevel::default());
        let low = set_with(&[(PredictorKind::Priority, Some(Score::new(0.0, 1.0)))]);
        let none = set_with(&[]);
        for set in [&low, &none] {
            let calc = engine.calculate(&ctx(), 0, WorkloadClass::RealTime, true, set, &placement());
            assert!(calc.realtime_override);
            assert_eq!(calc.priority, PriorityLevel::MAX);
        }
        let high = set_with(&[(PredictorKind::Priority, Some(Score::new(1.0, 1.0)))]);
        let calc = engine.calculate(&ctx(), 0, WorkloadClass::Interactive, false, &high, &placement());
        assert!(calc.priority < PriorityLevel::MAX);
        assert_eq!(calc.priority, PriorityLevel::NORMAL_MAX);
    }

    #[test]
    fn test_monotonic_in_base_score() {
        let engine = PriorityEngine::new(PriorityLevel::default());
        let p = placement();
        let c = ctx().with_last_run(0, 0, Nanoseconds::ZERO);
        let mut last = PriorityLevel::MIN;
        for i in 0..=20 {
            let set = set_with(&[(PredictorKind::Priority, Some(Score::new(i as f64 / 20.0, 1.0)))]);
            let calc = engine.calculate(&c, 0, WorkloadClass::Batch, false, &set, &p);
            assert!(calc.priority >= last);
            last = calc.priority;
        }
    }

    #[test]
    fn test_finalize_range() {
        assert_eq!(finalize(-1.0), PriorityLevel::MIN);
        assert_eq!(finalize(0.5), PriorityLevel::new(45));
        assert_eq!(finalize(2.0), PriorityLevel::NORMAL_MAX);
        assert_eq!(finalize(f64::NAN), PriorityLevel::MIN);
    }

    #[test]
    fn test_feedback_delivery() {
        let engine = PriorityEngine::new(PriorityLevel::default());
        let set = set_with(&[]);
        engine.report(Outcome::Load { cpu: 0, load: 0.3 });
        engine.report(Outcome::Load { cpu: 1, load: 0.6 });
        assert_eq!(engine.deliver_feedback(&set), 2);
        assert_eq!(engine.feedback().delivered(), 2);
    }
}
