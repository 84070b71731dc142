//! The active predictor set.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{
    CachedPredictor, ContextualPredictor, LatencyClass, LoadPredictor, LoadTrendPredictor,
    Outcome, PolicyPredictor, PredictorKind, PriorityPredictor, QuantumPredictor, Score,
    TaskPredictor, TemporalPredictor,
};
use crate::balancer::CpuLoad;
use crate::config::{FusionWeights, PredictorSelection, SchedConfig};
use crate::context::TaskContext;
use crate::error::{PredictorUnavailable, UnavailableReason};
use crate::types::TaskId;

// ============================================================================
// PREDICTION SET
// ============================================================================

/// One optional score per fused predictor kind
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PredictionSet {
    pub priority: Option<Score>,
    pub temporal: Option<Score>,
    pub contextual: Option<Score>,
    pub policy: Option<Score>,
}

impl PredictionSet {
    /// Score for a kind
    pub fn get(&self, kind: PredictorKind) -> Option<Score> {
        match kind {
            PredictorKind::Priority => self.priority,
            PredictorKind::Temporal => self.temporal,
            PredictorKind::Contextual => self.contextual,
            PredictorKind::Policy => self.policy,
            _ => None,
        }
    }

    /// Store a score. Invalid scores and non-fused kinds are ignored.
    pub fn set(&mut self, kind: PredictorKind, score: Score) {
        if !score.is_valid() {
            return;
        }
        let slot = match kind {
            PredictorKind::Priority => &mut self.priority,
            PredictorKind::Temporal => &mut self.temporal,
            PredictorKind::Contextual => &mut self.contextual,
            PredictorKind::Policy => &mut self.policy,
            _ => return,
        };
        *slot = Some(score);
    }

    /// Available (kind, score) pairs in kind order
    pub fn available(&self) -> impl Iterator<Item = (PredictorKind, Score)> + '_ {
        PredictorKind::FUSED
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|score| (kind, score)))
    }

    /// Number of available scores
    pub fn len(&self) -> usize {
        self.available().count()
    }

    /// No score available?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// PREDICTOR SET
// ============================================================================

/// Owns every predictor the scheduler consults
pub struct PredictorSet {
    /// Task predictors: fused kinds and the quantum predictor
    task: Vec<Box<TaskPredictor>>,
    /// Load-evolution predictor
    load: Option<Box<LoadPredictor>>,
    /// Per-kind fusion weights
    weights: FusionWeights,
    shut_down: AtomicBool,
}

impl PredictorSet {
    /// Empty set
    pub fn new(weights: FusionWeights) -> Self {
        Self {
            task: Vec::new(),
            load: None,
            weights,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Built-in predictors enabled by `config.predictors`
    pub fn from_config(config: &SchedConfig) -> Self {
        let selection = config.predictors;
        let mut set = Self::new(config.fusion);
        if selection.contains(PredictorSelection::PRIORITY) {
            set.add(Box::new(PriorityPredictor::new()));
        }
        if selection.contains(PredictorSelection::TEMPORAL) {
            set.add(Box::new(TemporalPredictor::new()));
        }
        if selection.contains(PredictorSelection::CONTEXTUAL) {
            set.add(Box::new(ContextualPredictor::new()));
        }
        if selection.contains(PredictorSelection::POLICY) {
            set.add(Box::new(PolicyPredictor::new(config.classifier)));
        }
        if selection.contains(PredictorSelection::QUANTUM) {
            set.add(Box::new(QuantumPredictor::new()));
        }
        if selection.contains(PredictorSelection::LOAD_EVOLUTION) {
            set.set_load(Box::new(LoadTrendPredictor::new(config.cpu_count)));
        }
        set
    }

    /// Add a task predictor, replacing any predictor of the same kind.
    ///
    /// Deferred predictors are wrapped in a [`CachedPredictor`].
    pub fn add(&mut self, predictor: Box<TaskPredictor>) {
        let kind = predictor.kind();
        if kind == PredictorKind::LoadEvolution {
            log::warn!("sched: task predictor cannot report the load-evolution kind; ignored");
            return;
        }
        let predictor: Box<TaskPredictor> = match predictor.latency() {
            LatencyClass::Bounded => predictor,
            LatencyClass::Deferred => Box::new(CachedPredictor::new(predictor)),
        };
        self.task.retain(|p| p.kind() != kind);
        self.task.push(predictor);
    }

    /// Install the load-evolution predictor
    pub fn set_load(&mut self, predictor: Box<LoadPredictor>) {
        self.load = Some(predictor);
    }

    /// Kinds of the installed task predictors
    pub fn kinds(&self) -> impl Iterator<Item = PredictorKind> + '_ {
        self.task.iter().map(|p| p.kind())
    }

    /// Is any fused predictor installed?
    pub fn has_fused(&self) -> bool {
        self.kinds().any(|k| k.is_fused())
    }

    /// Is a load-evolution predictor installed?
    #[inline]
    pub fn has_load(&self) -> bool {
        self.load.is_some()
    }

    /// Configured weight for a fused kind
    pub fn weight(&self, kind: PredictorKind) -> f64 {
        match kind {
            PredictorKind::Priority => self.weights.priority,
            PredictorKind::Temporal => self.weights.temporal,
            PredictorKind::Contextual => self.weights.contextual,
            PredictorKind::Policy => self.weights.policy,
            _ => 0.0,
        }
    }

    /// Collect fused scores for `ctx`, skipping unavailable predictors
    pub fn collect(&self, ctx: &TaskContext) -> PredictionSet {
        let mut set = PredictionSet::default();
        if self.is_shut_down() {
            return set;
        }
        for predictor in self.task.iter().filter(|p| p.kind().is_fused()) {
            let kind = predictor.kind();
            match predictor.predict(ctx).and_then(|s| s.checked(kind)) {
                Ok(score) => set.set(kind, score),
                Err(e) => log::trace!("sched: {}", e),
            }
        }
        set
    }

    /// Raw quantum prediction for `ctx`.
    ///
    /// The value is returned unchecked; the selection engine clamps it.
    pub fn quantum(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        let unavailable = |reason| PredictorUnavailable::new(PredictorKind::Quantum, reason);
        if self.is_shut_down() {
            return Err(unavailable(UnavailableReason::Offline));
        }
        let predictor = self
            .task
            .iter()
            .find(|p| p.kind() == PredictorKind::Quantum)
            .ok_or(unavailable(UnavailableReason::Offline))?;
        predictor.predict(ctx)
    }

    /// Projected normalized load for a CPU
    pub fn project_load(&self, load: &CpuLoad) -> Result<Score, PredictorUnavailable> {
        let unavailable =
            |reason| PredictorUnavailable::new(PredictorKind::LoadEvolution, reason);
        if self.is_shut_down() {
            return Err(unavailable(UnavailableReason::Offline));
        }
        let predictor = self
            .load
            .as_ref()
            .ok_or(unavailable(UnavailableReason::Offline))?;
        predictor
            .predict(load)
            .and_then(|s| s.checked(PredictorKind::LoadEvolution))
    }

    /// Refresh deferred caches for `ctx` (balancer path)
    pub fn refresh(&self, ctx: &TaskContext) {
        if self.is_shut_down() {
            return;
        }
        for predictor in &self.task {
            predictor.refresh(ctx);
        }
    }

    /// Drop per-task predictor state for a departed task
    pub fn forget(&self, task: TaskId) {
        for predictor in &self.task {
            predictor.forget(task);
        }
    }

    /// Deliver feedback to every predictor
    pub fn observe(&self, outcome: &Outcome) {
        if self.is_shut_down() {
            return;
        }
        for predictor in &self.task {
            predictor.observe(outcome);
        }
        if let Some(load) = &self.load {
            load.observe(outcome);
        }
    }

    /// Shut every predictor down, newest first. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(load) = &self.load {
            load.shutdown();
        }
        for predictor in self.task.iter().rev() {
            predictor.shutdown();
        }
        log::debug!("sched: predictor set shut down");
    }

    /// Has [`PredictorSet::shutdown`] run?
    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for PredictorSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut kinds = f.debug_list();
        for kind in self.kinds() {
            kinds.entry(&kind.name());
        }
        if self.has_load() {
            kinds.entry(&PredictorKind::LoadEvolution.name());
        }
        kinds.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    struct Fixed(PredictorKind, f64, LatencyClass);

    impl crate::predictor::Predictor<TaskContext> for Fixed {
        fn kind(&self) -> PredictorKind {
            self.0
        }

        fn latency(&self) -> LatencyClass {
            self.2
        }

        fn predict(&self, _ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
            Ok(Score::new(self.1, 1.0))
        }
    }

    #[test]
    fn test_forget_evicts_deferred_scores() {
        let mut set = PredictorSet::new(FusionWeights::default());
        set.add(Box::new(Fixed(PredictorKind::Temporal, 0.6, LatencyClass::Deferred)));
        let ctx = TaskContext::new(TaskId::new(7));
        let other = TaskContext::new(TaskId::new(8));
        set.refresh(&ctx);
        set.refresh(&other);
        assert_eq!(set.collect(&ctx).len(), 1);

        set.forget(TaskId::new(7));
        assert!(set.collect(&ctx).is_empty());
        assert_eq!(set.collect(&other).len(), 1);
    }

    #[test]
    fn test_from_config_respects_selection() {
        let config = SchedConfig::new(2)
            .with_predictors(PredictorSelection::PRIORITY | PredictorSelection::QUANTUM);
        let set = PredictorSet::from_config(&config);
        let kinds: Vec<_> = set.kinds().collect();
        assert_eq!(kinds, alloc::vec![PredictorKind::Priority, PredictorKind::Quantum]);
        assert!(set.has_fused());
        assert!(!set.has_load());
    }

    #[test]
    fn test_out_of_range_scores_are_skipped() {
        let mut set = PredictorSet::new(FusionWeights::default());
        set.add(Box::new(Fixed(PredictorKind::Priority, 1.7, LatencyClass::Bounded)));
        set.add(Box::new(Fixed(PredictorKind::Contextual, 0.3, LatencyClass::Bounded)));
        let scores = set.collect(&TaskContext::new(TaskId::new(1)));
        assert_eq!(scores.priority, None);
        assert_eq!(scores.contextual, Some(Score::new(0.3, 1.0)));
        assert_eq!(scores.len(), 1);
    }

    #[test]
    fn test_add_replaces_same_kind() {
        let mut set = PredictorSet::new(FusionWeights::default());
        set.add(Box::new(Fixed(PredictorKind::Policy, 0.1, LatencyClass::Bounded)));
        set.add(Box::new(Fixed(PredictorKind::Policy, 0.9, LatencyClass::Bounded)));
        let scores = set.collect(&TaskContext::new(TaskId::new(1)));
        assert_eq!(scores.policy.map(|s| s.value), Some(0.9));
    }

    #[test]
    fn test_deferred_predictor_is_cached() {
        let mut set = PredictorSet::new(FusionWeights::default());
        set.add(Box::new(Fixed(PredictorKind::Temporal, 0.6, LatencyClass::Deferred)));
        let ctx = TaskContext::new(TaskId::new(4));
        assert!(set.collect(&ctx).is_empty());
        set.refresh(&ctx);
        assert_eq!(set.collect(&ctx).temporal.map(|s| s.value), Some(0.6));
    }

    #[test]
    fn test_shutdown_makes_everything_unavailable() {
        let set = PredictorSet::from_config(&SchedConfig::new(1));
        let ctx = TaskContext::new(TaskId::new(1)).with_usage(&[0.2, 0.4]);
        assert!(!set.collect(&ctx).is_empty());
        set.shutdown();
        set.shutdown();
        assert!(set.collect(&ctx).is_empty());
        assert!(set.quantum(&ctx).is_err());
    }
}
