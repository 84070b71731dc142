//! # Workload Classifier
//!
//! Maps a task snapshot to exactly one [`WorkloadClass`] with fixed feature
//! thresholds, evaluated most-specific first:
//!
//! 1. declared deadline → `RealTime`
//! 2. I/O wait ratio above `io_bound_ratio` → `IoBound`
//! 3. mean CPU usage at or above `cpu_bound_usage` → `CpuBound`
//! 4. steady usage and short waits → `Interactive`
//! 5. any usage history → `Batch`
//! 6. otherwise `Unknown`
//!
//! Classification is a pure function of the snapshot and the thresholds, so
//! reclassifying the same snapshot always yields the same class. Each class
//! carries a [`ClassPolicy`] that biases later priority and quantum decisions.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::ClassifierThresholds;
use crate::context::TaskContext;

// ============================================================================
// WORKLOAD CLASS
// ============================================================================

/// Coarse resource-usage category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum WorkloadClass {
    /// Latency-sensitive, short bursts
    Interactive = 0,
    /// Throughput-oriented background work
    Batch       = 1,
    /// Mostly blocked on I/O
    IoBound     = 2,
    /// Saturates its CPU
    CpuBound    = 3,
    /// Declared a deadline
    RealTime    = 4,
    /// Not enough information
    Unknown     = 5,
}

impl WorkloadClass {
    /// Number of classes
    pub const COUNT: usize = 6;

    /// All classes, by index
    pub const ALL: [WorkloadClass; Self::COUNT] = [
        Self::Interactive,
        Self::Batch,
        Self::IoBound,
        Self::CpuBound,
        Self::RealTime,
        Self::Unknown,
    ];

    /// Dense index
    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Specificity rank used for tie-breaking (higher wins)
    pub const fn specificity(self) -> u8 {
        match self {
            Self::RealTime => 4,
            Self::IoBound | Self::CpuBound => 3,
            Self::Interactive => 2,
            Self::Batch => 1,
            Self::Unknown => 0,
        }
    }

    /// Class name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Batch => "batch",
            Self::IoBound => "io-bound",
            Self::CpuBound => "cpu-bound",
            Self::RealTime => "real-time",
            Self::Unknown => "unknown",
        }
    }

    /// Policy hints for this class
    pub fn policy(&self) -> ClassPolicy {
        match self {
            Self::Interactive => ClassPolicy::new(0.05, 0.5),
            Self::Batch => ClassPolicy::new(-0.05, 1.5),
            Self::IoBound => ClassPolicy::new(0.03, 0.75),
            Self::CpuBound => ClassPolicy::new(-0.03, 2.0),
            Self::RealTime => ClassPolicy::new(0.0, 1.0),
            Self::Unknown => ClassPolicy::NEUTRAL,
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// CLASS POLICY
// ============================================================================

/// Class-specific hints applied to later decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassPolicy {
    /// Added to the fused score before finalizing
    pub priority_bias: f64,
    /// Multiplies the predicted quantum before clamping
    pub quantum_scale: f64,
}

impl ClassPolicy {
    /// No bias
    pub const NEUTRAL: Self = Self::new(0.0, 1.0);

    /// Create a policy
    pub const fn new(priority_bias: f64, quantum_scale: f64) -> Self {
        Self {
            priority_bias,
            quantum_scale,
        }
    }
}

/// Classify `ctx` under `thresholds`
pub fn classify_with(ctx: &TaskContext, thresholds: &ClassifierThresholds) -> WorkloadClass {
    if ctx.has_deadline() {
        return WorkloadClass::RealTime;
    }
    if ctx.io_wait_ratio > thresholds.io_bound_ratio {
        return WorkloadClass::IoBound;
    }
    if ctx.sample_count() == 0 {
        return WorkloadClass::Unknown;
    }
    if ctx.mean_usage() >= thresholds.cpu_bound_usage {
        return WorkloadClass::CpuBound;
    }
    if ctx.usage_variance() < thresholds.interactive_variance
        && ctx.wait_time < thresholds.interactive_wait
    {
        return WorkloadClass::Interactive;
    }
    WorkloadClass::Batch
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// Workload classifier with per-class counters
#[derive(Debug)]
pub struct WorkloadClassifier {
    thresholds: ClassifierThresholds,
    counts: [AtomicU64; WorkloadClass::COUNT],
}

impl WorkloadClassifier {
    /// Create a classifier
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self {
            thresholds,
            counts: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Classify a snapshot
    pub fn classify(&self, ctx: &TaskContext) -> WorkloadClass {
        let class = classify_with(ctx, &self.thresholds);
        self.counts[class.index()].fetch_add(1, Ordering::Relaxed);
        class
    }

    /// Classify and return the class policy
    pub fn classify_with_policy(&self, ctx: &TaskContext) -> (WorkloadClass, ClassPolicy) {
        let class = self.classify(ctx);
        (class, class.policy())
    }

    /// Times a class has been assigned
    #[inline]
    pub fn count(&self, class: WorkloadClass) -> u64 {
        self.counts[class.index()].load(Ordering::Relaxed)
    }

    /// Thresholds in use
    #[inline(always)]
    pub fn thresholds(&self) -> &ClassifierThresholds {
        &self.thresholds
    }
}

impl Default for WorkloadClassifier {
    fn default() -> Self {
        Self::new(ClassifierThresholds::default())
    }
}
