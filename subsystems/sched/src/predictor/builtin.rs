//! Built-in deterministic predictors.
//!
//! None of these run a learned model. Each is a small statistical function of
//! the task snapshot (or per-CPU load), cheap enough for the tick path.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use super::{Outcome, Predictor, PredictorKind, Score};
use crate::balancer::CpuLoad;
use crate::classifier::{classify_with, WorkloadClass};
use crate::config::ClassifierThresholds;
use crate::context::{TaskContext, HISTORY_LEN};
use crate::error::{PredictorUnavailable, UnavailableReason};
use crate::math;
use crate::types::{CpuId, Nanoseconds};

#[inline]
fn unavailable(kind: PredictorKind, reason: UnavailableReason) -> PredictorUnavailable {
    PredictorUnavailable::new(kind, reason)
}

/// Usage weighted toward the newest samples (weights 1..=n)
fn recency_weighted_usage(usage: &[f32]) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (i, &u) in usage.iter().enumerate() {
        let w = (i + 1) as f64;
        weighted += w * u as f64;
        total += w;
    }
    if total == 0.0 {
        0.0
    } else {
        weighted / total
    }
}

/// Confidence from the fraction of the history that is filled
#[inline]
fn history_confidence(ctx: &TaskContext) -> f64 {
    ctx.sample_count() as f64 / HISTORY_LEN as f64
}

// ============================================================================
// PRIORITY PREDICTOR
// ============================================================================

/// Base priority: starving tasks rise, CPU-heavy tasks sink
#[derive(Debug)]
pub struct PriorityPredictor {
    /// Wait after which the starvation boost reaches ~63%
    starvation_scale: Nanoseconds,
}

impl PriorityPredictor {
    /// Create new priority predictor
    pub fn new() -> Self {
        Self {
            starvation_scale: Nanoseconds::from_millis(20),
        }
    }

    /// Set the starvation time constant
    pub fn with_starvation_scale(mut self, scale: Nanoseconds) -> Self {
        self.starvation_scale = scale;
        self
    }
}

impl Default for PriorityPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl Predictor<TaskContext> for PriorityPredictor {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Priority
    }

    fn predict(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        let scale = self.starvation_scale.raw().max(1) as f64;
        let starvation = 1.0 - math::exp(-(ctx.wait_time.raw() as f64) / scale);
        let value = math::unit(0.4 + 0.5 * starvation - 0.3 * ctx.mean_usage());
        let confidence = 0.5 + 0.5 * history_confidence(ctx);
        Score::new(value, confidence).checked(self.kind())
    }
}

// ============================================================================
// TEMPORAL PREDICTOR
// ============================================================================

/// Burst behaviour: short recent bursts score high
#[derive(Debug, Default)]
pub struct TemporalPredictor;

impl TemporalPredictor {
    /// Minimum samples before predicting
    pub const MIN_SAMPLES: usize = 2;

    /// Create new temporal predictor
    pub fn new() -> Self {
        Self
    }
}

impl Predictor<TaskContext> for TemporalPredictor {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Temporal
    }

    fn predict(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        if ctx.sample_count() < Self::MIN_SAMPLES {
            return Err(unavailable(self.kind(), UnavailableReason::InsufficientData));
        }
        let burst = recency_weighted_usage(ctx.recent_usage());
        Score::new(math::unit(1.0 - burst), history_confidence(ctx)).checked(self.kind())
    }
}

// ============================================================================
// CONTEXTUAL PREDICTOR
// ============================================================================

/// Declared importance plus I/O affinity
#[derive(Debug, Default)]
pub struct ContextualPredictor;

impl ContextualPredictor {
    /// Create new contextual predictor
    pub fn new() -> Self {
        Self
    }
}

impl Predictor<TaskContext> for ContextualPredictor {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Contextual
    }

    fn predict(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        let importance = (19 - ctx.nice as i32) as f64 / 39.0;
        let value = math::unit(0.7 * importance + 0.3 * ctx.io_wait_ratio);
        Score::new(value, 0.8).checked(self.kind())
    }
}

// ============================================================================
// POLICY PREDICTOR
// ============================================================================

/// Per-class reinforcement values.
///
/// Each class holds a value in 0..1 stored as f64 bits in an atomic, so both
/// prediction and feedback are lock-free. Rewards favour tasks that give the
/// CPU back before their quantum ends.
#[derive(Debug)]
pub struct PolicyPredictor {
    thresholds: ClassifierThresholds,
    values: [AtomicU64; WorkloadClass::COUNT],
    samples: [AtomicU64; WorkloadClass::COUNT],
    learning_rate: f64,
}

impl PolicyPredictor {
    /// Create new policy predictor
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self {
            thresholds,
            values: core::array::from_fn(|_| AtomicU64::new(0.5f64.to_bits())),
            samples: core::array::from_fn(|_| AtomicU64::new(0)),
            learning_rate: 0.1,
        }
    }

    /// Set learning rate
    #[inline(always)]
    pub fn set_learning_rate(&mut self, rate: f64) {
        self.learning_rate = rate.clamp(0.01, 0.5);
    }

    /// Current value for a class
    #[inline]
    pub fn value(&self, class: WorkloadClass) -> f64 {
        f64::from_bits(self.values[class.index()].load(Ordering::Relaxed))
    }

    /// Feedback samples seen for a class
    #[inline]
    pub fn samples(&self, class: WorkloadClass) -> u64 {
        self.samples[class.index()].load(Ordering::Relaxed)
    }

    fn reinforce(&self, class: WorkloadClass, reward: f64) {
        let rate = self.learning_rate;
        let _ = self.values[class.index()].fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            let v = f64::from_bits(bits);
            Some(math::unit(v + rate * (reward - v)).to_bits())
        });
        self.samples[class.index()].fetch_add(1, Ordering::Relaxed);
    }
}

impl Predictor<TaskContext> for PolicyPredictor {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Policy
    }

    fn predict(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        let class = classify_with(ctx, &self.thresholds);
        let samples = self.samples(class);
        if samples == 0 {
            return Err(unavailable(self.kind(), UnavailableReason::InsufficientData));
        }
        let confidence = (samples as f64 / (samples + 10) as f64).min(0.95);
        Score::new(self.value(class), confidence).checked(self.kind())
    }

    fn observe(&self, outcome: &Outcome) {
        if let Outcome::Run {
            class, ran, quantum, ..
        } = *outcome
        {
            if quantum == Nanoseconds::ZERO {
                return;
            }
            let used = math::unit(ran.raw() as f64 / quantum.raw() as f64);
            self.reinforce(class, 1.0 - used);
        }
    }
}

// ============================================================================
// QUANTUM PREDICTOR
// ============================================================================

/// Predicted fraction of the quantum range a task will use
#[derive(Debug, Default)]
pub struct QuantumPredictor;

impl QuantumPredictor {
    /// Create new quantum predictor
    pub fn new() -> Self {
        Self
    }
}

impl Predictor<TaskContext> for QuantumPredictor {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Quantum
    }

    fn predict(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        if ctx.sample_count() == 0 {
            return Err(unavailable(self.kind(), UnavailableReason::InsufficientData));
        }
        let burst = recency_weighted_usage(ctx.recent_usage());
        Score::new(burst, history_confidence(ctx)).checked(self.kind())
    }
}

// ============================================================================
// LOAD TREND PREDICTOR
// ============================================================================

/// Direction of a load series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    /// Rapidly increasing
    RapidIncrease,
    /// Slowly increasing
    SlowIncrease,
    /// Stable
    Stable,
    /// Slowly decreasing
    SlowDecrease,
    /// Rapidly decreasing
    RapidDecrease,
}

impl Trend {
    /// Get from gradient
    pub fn from_gradient(gradient: f64) -> Self {
        if gradient > 0.1 {
            Self::RapidIncrease
        } else if gradient > 0.01 {
            Self::SlowIncrease
        } else if gradient < -0.1 {
            Self::RapidDecrease
        } else if gradient < -0.01 {
            Self::SlowDecrease
        } else {
            Self::Stable
        }
    }

    /// Is load going up?
    #[inline(always)]
    pub fn is_rising(&self) -> bool {
        matches!(self, Self::RapidIncrease | Self::SlowIncrease)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LoadTrack {
    ema: f64,
    slope: f64,
    samples: u64,
}

/// Per-CPU load evolution: EMA plus smoothed gradient
#[derive(Debug)]
pub struct LoadTrendPredictor {
    tracks: Mutex<Vec<LoadTrack>>,
    /// EMA smoothing
    alpha: f64,
    /// Gradient smoothing
    beta: f64,
    /// Balancer intervals to project ahead
    horizon: f64,
    offline: AtomicBool,
}

impl LoadTrendPredictor {
    /// Create a predictor for `cpu_count` CPUs
    pub fn new(cpu_count: usize) -> Self {
        Self {
            tracks: Mutex::new(alloc::vec![LoadTrack::default(); cpu_count]),
            alpha: 0.3,
            beta: 0.5,
            horizon: 1.0,
            offline: AtomicBool::new(false),
        }
    }

    /// Set the projection horizon in balancer intervals
    pub fn with_horizon(mut self, horizon: f64) -> Self {
        self.horizon = horizon.max(0.0);
        self
    }

    /// Current trend for a CPU
    pub fn trend(&self, cpu: CpuId) -> Trend {
        let tracks = self.tracks.lock();
        tracks
            .get(cpu as usize)
            .map(|t| Trend::from_gradient(t.slope))
            .unwrap_or(Trend::Stable)
    }

    fn record(&self, cpu: CpuId, load: f64) {
        let mut tracks = self.tracks.lock();
        let Some(track) = tracks.get_mut(cpu as usize) else {
            return;
        };
        let load = math::unit(load);
        if track.samples == 0 {
            track.ema = load;
        } else {
            let ema = self.alpha * load + (1.0 - self.alpha) * track.ema;
            track.slope = self.beta * (ema - track.ema) + (1.0 - self.beta) * track.slope;
            track.ema = ema;
        }
        track.samples += 1;
    }

    fn shift(&self, cpu: CpuId, delta: f64) {
        let mut tracks = self.tracks.lock();
        if let Some(track) = tracks.get_mut(cpu as usize) {
            if track.samples > 0 {
                track.ema = math::unit(track.ema + delta);
            }
        }
    }
}

impl Predictor<CpuLoad> for LoadTrendPredictor {
    fn kind(&self) -> PredictorKind {
        PredictorKind::LoadEvolution
    }

    fn predict(&self, load: &CpuLoad) -> Result<Score, PredictorUnavailable> {
        if self.offline.load(Ordering::Acquire) {
            return Err(unavailable(self.kind(), UnavailableReason::Offline));
        }
        let tracks = self
            .tracks
            .try_lock()
            .ok_or(unavailable(self.kind(), UnavailableReason::Contended))?;
        let track = tracks
            .get(load.cpu as usize)
            .copied()
            .unwrap_or_default();
        if track.samples == 0 {
            return Score::new(math::unit(load.load), 0.25).checked(self.kind());
        }
        let projected = math::unit(track.ema + track.slope * self.horizon);
        let confidence = (track.samples as f64 / (track.samples + 4) as f64).min(0.9);
        Score::new(projected, confidence).checked(self.kind())
    }

    fn observe(&self, outcome: &Outcome) {
        match *outcome {
            Outcome::Load { cpu, load } => self.record(cpu, load),
            Outcome::Migration {
                from,
                to,
                load,
                succeeded: true,
                ..
            } => {
                self.shift(from, -load);
                self.shift(to, load);
            },
            _ => {},
        }
    }

    fn shutdown(&self) {
        self.offline.store(true, Ordering::Release);
    }
}
