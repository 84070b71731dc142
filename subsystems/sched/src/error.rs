//! # Scheduler Error Types
//!
//! Error taxonomy for the scheduler core.
//!
//! | Error                  | Surfaced to       | Effect                                  |
//! |------------------------|-------------------|-----------------------------------------|
//! | `PredictorUnavailable` | nobody            | fusion skips the predictor              |
//! | `AdmissionRejected`    | RT requester      | no state change, `ENOSPC`               |
//! | `DeadlineMissed`       | observability     | fatal only under `DeadlineMissPolicy::Fatal` |
//! | `MigrationStepFailed`  | migration report  | entry skipped, plan continues           |
//! | `InitializationFailed` | `init()` caller   | reverse-order rollback                  |
//!
//! Tick-path code never returns an error: it produces a task or an explicit
//! idle result.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::predictor::PredictorKind;
use crate::types::{CpuId, Nanoseconds, TaskId};

// ============================================================================
// ERRNO
// ============================================================================

/// No such entry
pub const ENOENT: i32 = 2;
/// No such device
pub const ENODEV: i32 = 19;
/// Invalid argument
pub const EINVAL: i32 = 22;
/// No space left (resource exhausted)
pub const ENOSPC: i32 = 28;
/// Operation already in progress
pub const EALREADY: i32 = 114;
/// Timed out
pub const ETIMEDOUT: i32 = 110;

// ============================================================================
// RESULT TYPE
// ============================================================================

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

// ============================================================================
// PREDICTOR UNAVAILABLE
// ============================================================================

/// A predictor could not produce a score within its contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorUnavailable {
    /// Which predictor
    pub kind: PredictorKind,
    /// Why
    pub reason: UnavailableReason,
}

/// Reason a predictor is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// Not enough history to say anything
    InsufficientData,
    /// Internal state is busy; the hot path does not wait
    Contended,
    /// No cached result yet for a deferred predictor
    NotCached,
    /// Returned value was out of bounds or NaN
    OutOfRange,
    /// Predictor has been shut down
    Offline,
}

impl PredictorUnavailable {
    /// Create a new unavailable signal
    #[inline]
    pub const fn new(kind: PredictorKind, reason: UnavailableReason) -> Self {
        Self { kind, reason }
    }
}

impl fmt::Display for PredictorUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} predictor unavailable: {:?}", self.kind.name(), self.reason)
    }
}

// ============================================================================
// MIGRATION FAILURE
// ============================================================================

/// Why a single migration step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationFailure {
    /// Destination CPU went offline
    TargetOffline,
    /// Task is no longer queued on the source CPU
    SourceMissing,
    /// Destination is outside the task's affinity mask
    AffinityViolation,
    /// Could not take both run-queue locks in time
    LockTimeout,
    /// Step ran past its time budget
    BudgetExceeded,
    /// CPU index out of range
    InvalidCpu,
    /// Refused by the executor
    Rejected,
}

impl MigrationFailure {
    /// Short name
    pub fn name(&self) -> &'static str {
        match self {
            Self::TargetOffline => "target offline",
            Self::SourceMissing => "source missing",
            Self::AffinityViolation => "affinity violation",
            Self::LockTimeout => "lock timeout",
            Self::BudgetExceeded => "budget exceeded",
            Self::InvalidCpu => "invalid cpu",
            Self::Rejected => "rejected",
        }
    }
}

// ============================================================================
// INITIALIZATION
// ============================================================================

/// Construction stages, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum InitStage {
    /// Configuration validation (nothing to roll back)
    Config           = 0,
    /// Predictor set
    Predictors       = 1,
    /// Workload classifier
    Classifier       = 2,
    /// Deadline/real-time manager
    DeadlineManager  = 3,
    /// NUMA/cache placement optimizer
    PlacementOptimizer = 4,
    /// Load balancer
    LoadBalancer     = 5,
}

impl InitStage {
    /// Construction order
    pub const ORDER: [InitStage; 5] = [
        Self::Predictors,
        Self::Classifier,
        Self::DeadlineManager,
        Self::PlacementOptimizer,
        Self::LoadBalancer,
    ];

    /// Stage name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Predictors => "predictors",
            Self::Classifier => "classifier",
            Self::DeadlineManager => "deadline-manager",
            Self::PlacementOptimizer => "placement-optimizer",
            Self::LoadBalancer => "load-balancer",
        }
    }
}

/// Classification of initialization errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitErrorKind {
    /// Configuration rejected
    InvalidConfig,
    /// NUMA topology does not describe the configured CPUs
    InvalidTopology,
}

/// Scheduler initialization error
#[derive(Debug, Clone)]
pub struct InitError {
    /// Stage that failed
    pub stage: InitStage,
    /// Error kind
    pub kind: InitErrorKind,
    /// Description
    pub message: String,
    /// Stages torn down during rollback, in teardown order
    pub rolled_back: Vec<InitStage>,
}

impl InitError {
    /// Create new init error
    pub fn new(stage: InitStage, kind: InitErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            rolled_back: Vec::new(),
        }
    }

    /// Attach the rollback record
    pub fn with_rollback(mut self, rolled_back: Vec<InitStage>) -> Self {
        self.rolled_back = rolled_back;
        self
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scheduler init failed at {} ({:?}): {}",
            self.stage.name(),
            self.kind,
            self.message
        )?;
        if !self.rolled_back.is_empty() {
            write!(f, " [rolled back {} stage(s)]", self.rolled_back.len())?;
        }
        Ok(())
    }
}

/// Configuration validation error
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Field out of its allowed range
    OutOfRange { field: &'static str, reason: &'static str },
    /// Fields contradict each other
    Inconsistent { fields: &'static str, reason: &'static str },
    /// Unparseable command-line value
    Parse { key: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { field, reason } => write!(f, "'{}' out of range: {}", field, reason),
            Self::Inconsistent { fields, reason } => {
                write!(f, "inconsistent {}: {}", fields, reason)
            },
            Self::Parse { key } => write!(f, "cannot parse value for '{}'", key),
        }
    }
}

impl From<ConfigError> for InitError {
    fn from(e: ConfigError) -> Self {
        InitError::new(InitStage::Config, InitErrorKind::InvalidConfig, alloc::format!("{}", e))
    }
}

// ============================================================================
// MAIN ERROR ENUM
// ============================================================================

/// Main error type for the scheduler core
#[derive(Debug, Clone)]
pub enum SchedError {
    /// A predictor is unavailable
    PredictorUnavailable(PredictorUnavailable),

    /// Real-time admission failed the schedulability test
    AdmissionRejected {
        task: TaskId,
        cpu: CpuId,
        requested: f64,
        available: f64,
    },

    /// A real-time deadline passed without completion
    DeadlineMissed {
        task: TaskId,
        cpu: CpuId,
        deadline: Nanoseconds,
        now: Nanoseconds,
    },

    /// A single migration step failed
    MigrationStepFailed {
        task: TaskId,
        from: CpuId,
        to: CpuId,
        reason: MigrationFailure,
    },

    /// Scheduler startup failed
    InitializationFailed(InitError),

    /// Bounded operation ran out of time
    Timeout {
        operation: &'static str,
        budget: Nanoseconds,
    },

    /// CPU index out of range
    InvalidCpu(CpuId),

    /// Task not known to the component
    UnknownTask(TaskId),

    /// Task already holds a real-time reservation
    AlreadyAdmitted(TaskId),

    /// Argument failed validation
    InvalidArgument { field: &'static str, reason: &'static str },
}

impl SchedError {
    /// Kernel errno equivalent
    pub fn errno(&self) -> i32 {
        match self {
            Self::PredictorUnavailable(_) => ENODEV,
            Self::AdmissionRejected { .. } => ENOSPC,
            Self::DeadlineMissed { .. } => ETIMEDOUT,
            Self::MigrationStepFailed { .. } => ENODEV,
            Self::InitializationFailed(_) => EINVAL,
            Self::Timeout { .. } => ETIMEDOUT,
            Self::InvalidCpu(_) => EINVAL,
            Self::UnknownTask(_) => ENOENT,
            Self::AlreadyAdmitted(_) => EALREADY,
            Self::InvalidArgument { .. } => EINVAL,
        }
    }

    /// Is this a resource-exhaustion signal?
    #[inline]
    pub fn is_resource_exhausted(&self) -> bool {
        self.errno() == ENOSPC
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PredictorUnavailable(e) => write!(f, "{}", e),
            Self::AdmissionRejected {
                task,
                cpu,
                requested,
                available,
            } => write!(
                f,
                "admission rejected for {} on cpu {}: requested {:.3}, available {:.3}",
                task, cpu, requested, available
            ),
            Self::DeadlineMissed {
                task,
                cpu,
                deadline,
                now,
            } => write!(
                f,
                "{} missed deadline {} on cpu {} (now {})",
                task, deadline, cpu, now
            ),
            Self::MigrationStepFailed {
                task,
                from,
                to,
                reason,
            } => write!(
                f,
                "migration of {} from cpu {} to cpu {} failed: {}",
                task,
                from,
                to,
                reason.name()
            ),
            Self::InitializationFailed(e) => write!(f, "{}", e),
            Self::Timeout { operation, budget } => {
                write!(f, "operation '{}' exceeded its {} budget", operation, budget)
            },
            Self::InvalidCpu(cpu) => write!(f, "invalid cpu {}", cpu),
            Self::UnknownTask(task) => write!(f, "unknown {}", task),
            Self::AlreadyAdmitted(task) => write!(f, "{} already holds a reservation", task),
            Self::InvalidArgument { field, reason } => {
                write!(f, "invalid argument '{}': {}", field, reason)
            },
        }
    }
}

// ============================================================================
// CONVERSION TRAITS
// ============================================================================

impl From<PredictorUnavailable> for SchedError {
    fn from(e: PredictorUnavailable) -> Self {
        Self::PredictorUnavailable(e)
    }
}

impl From<InitError> for SchedError {
    fn from(e: InitError) -> Self {
        Self::InitializationFailed(e)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_rejected_is_enospc() {
        let err = SchedError::AdmissionRejected {
            task: TaskId::new(7),
            cpu: 1,
            requested: 0.2,
            available: 0.05,
        };
        assert_eq!(err.errno(), ENOSPC);
        assert!(err.is_resource_exhausted());
        let display = alloc::format!("{}", err);
        assert!(display.contains("task#7"));
        assert!(display.contains("cpu 1"));
    }

    #[test]
    fn test_init_error_display() {
        let err = InitError::new(
            InitStage::PlacementOptimizer,
            InitErrorKind::InvalidTopology,
            "cpu 3 has no node",
        )
        .with_rollback(alloc::vec![InitStage::Classifier, InitStage::Predictors]);
        let display = alloc::format!("{}", err);
        assert!(display.contains("placement-optimizer"));
        assert!(display.contains("rolled back 2"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: InitError = ConfigError::OutOfRange {
            field: "rt_utilization_bound",
            reason: "must be in (0, 1]",
        }
        .into();
        assert_eq!(err.stage, InitStage::Config);
        assert_eq!(err.kind, InitErrorKind::InvalidConfig);
    }

    #[test]
    fn test_predictor_unavailable_conversion() {
        let e = PredictorUnavailable::new(PredictorKind::Temporal, UnavailableReason::Contended);
        let sched: SchedError = e.into();
        assert!(matches!(sched, SchedError::PredictorUnavailable(_)));
    }
}
