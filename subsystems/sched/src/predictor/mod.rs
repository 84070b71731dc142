//! # Predictor Interface
//!
//! Every prediction signal the scheduler consumes goes through one capability
//! trait, [`Predictor`]. A predictor turns an input (a [`TaskContext`] for
//! task signals, a [`CpuLoad`] for the load-evolution signal) into a
//! [`Score`] or reports that it is unavailable.
//!
//! ## Latency contract
//!
//! Predictors consulted on the scheduling tick must answer within
//! [`HOT_PATH_BUDGET`] and must never block. A predictor that cannot promise
//! this declares [`LatencyClass::Deferred`]; the [`PredictorSet`] then wraps
//! it in a [`CachedPredictor`], which is refreshed on the balancer cadence and
//! serves its last valid result on the tick path.
//!
//! ## Kinds
//!
//! The kind set is closed: four fused priority signals plus the quantum and
//! load-evolution predictors. Any number of implementations may exist, but
//! each reports exactly one [`PredictorKind`].

mod builtin;
mod cache;
mod set;

pub use builtin::{
    ContextualPredictor, LoadTrendPredictor, PolicyPredictor, PriorityPredictor,
    QuantumPredictor, TemporalPredictor, Trend,
};
pub use cache::CachedPredictor;
pub use set::{PredictionSet, PredictorSet};

use crate::balancer::CpuLoad;
use crate::classifier::WorkloadClass;
use crate::config::PredictorSelection;
use crate::context::TaskContext;
use crate::error::{PredictorUnavailable, UnavailableReason};
use crate::types::{CpuId, Nanoseconds, PriorityLevel, TaskId};

/// Latency budget for predictors consulted on the tick path
pub const HOT_PATH_BUDGET: Nanoseconds = Nanoseconds::from_micros(50);

// ============================================================================
// PREDICTOR KIND
// ============================================================================

/// Closed set of prediction signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PredictorKind {
    /// Base priority from wait time and CPU consumption
    Priority      = 0,
    /// Burst behaviour over time
    Temporal      = 1,
    /// Declared importance and I/O context
    Contextual    = 2,
    /// Per-class reinforcement values
    Policy        = 3,
    /// Quantum length
    Quantum       = 4,
    /// Per-CPU load evolution
    LoadEvolution = 5,
}

impl PredictorKind {
    /// Kinds fused into a priority
    pub const FUSED: [PredictorKind; 4] = [
        Self::Priority,
        Self::Temporal,
        Self::Contextual,
        Self::Policy,
    ];

    /// Kind name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Temporal => "temporal",
            Self::Contextual => "contextual",
            Self::Policy => "policy",
            Self::Quantum => "quantum",
            Self::LoadEvolution => "load-evolution",
        }
    }

    /// Is this one of the fused priority signals?
    #[inline]
    pub fn is_fused(&self) -> bool {
        matches!(
            self,
            Self::Priority | Self::Temporal | Self::Contextual | Self::Policy
        )
    }

    /// Configuration flag enabling this kind
    pub fn selection(&self) -> PredictorSelection {
        match self {
            Self::Priority => PredictorSelection::PRIORITY,
            Self::Temporal => PredictorSelection::TEMPORAL,
            Self::Contextual => PredictorSelection::CONTEXTUAL,
            Self::Policy => PredictorSelection::POLICY,
            Self::Quantum => PredictorSelection::QUANTUM,
            Self::LoadEvolution => PredictorSelection::LOAD_EVOLUTION,
        }
    }
}

// ============================================================================
// SCORE
// ============================================================================

/// Confidence-weighted prediction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    /// Predicted value (0.0 - 1.0)
    pub value: f64,
    /// Confidence in the value (0.0 - 1.0)
    pub confidence: f64,
}

impl Score {
    /// Create a score. Values are stored as given; use [`Score::checked`]
    /// before trusting them.
    #[inline(always)]
    pub const fn new(value: f64, confidence: f64) -> Self {
        Self { value, confidence }
    }

    /// Are both fields finite and inside the unit interval?
    #[inline]
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.value) && (0.0..=1.0).contains(&self.confidence)
    }

    /// Reject out-of-range or NaN scores
    #[inline]
    pub fn checked(self, kind: PredictorKind) -> Result<Self, PredictorUnavailable> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(PredictorUnavailable::new(kind, UnavailableReason::OutOfRange))
        }
    }
}

/// Whether a predictor may run on the tick path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyClass {
    /// Answers within [`HOT_PATH_BUDGET`] without blocking
    Bounded,
    /// Too slow for the tick; served from a cache
    Deferred,
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// Feedback delivered to predictors after the fact
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// A candidate was (or was not) picked on a tick
    Selection {
        task: TaskId,
        class: WorkloadClass,
        priority: PriorityLevel,
        selected: bool,
    },
    /// A task finished a run period
    Run {
        task: TaskId,
        class: WorkloadClass,
        ran: Nanoseconds,
        quantum: Nanoseconds,
    },
    /// Normalized load observed on a CPU
    Load { cpu: CpuId, load: f64 },
    /// A migration step finished
    Migration {
        task: TaskId,
        from: CpuId,
        to: CpuId,
        /// Normalized load carried by the task
        load: f64,
        succeeded: bool,
    },
}

// ============================================================================
// PREDICTOR TRAIT
// ============================================================================

/// Bounded-latency scoring capability.
///
/// Implementations guard their own mutable state; callers never synchronize
/// externally. Hot-path methods must not block: a predictor whose state is
/// busy reports [`UnavailableReason::Contended`] instead of waiting.
pub trait Predictor<I>: Send + Sync {
    /// Which signal this predictor produces
    fn kind(&self) -> PredictorKind;

    /// Latency class
    fn latency(&self) -> LatencyClass {
        LatencyClass::Bounded
    }

    /// Score `input`
    fn predict(&self, input: &I) -> Result<Score, PredictorUnavailable>;

    /// Refresh any cached state for `input` (balancer path only)
    fn refresh(&self, _input: &I) {}

    /// Consume feedback
    fn observe(&self, _outcome: &Outcome) {}

    /// Drop any per-task state for a task that left the scheduler
    fn forget(&self, _task: TaskId) {}

    /// Release resources; called exactly once during teardown
    fn shutdown(&self) {}
}

/// Predictor over task snapshots
pub type TaskPredictor = dyn Predictor<TaskContext>;

/// Predictor over per-CPU load
pub type LoadPredictor = dyn Predictor<CpuLoad>;
