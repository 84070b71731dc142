//! # Scheduler Configuration
//!
//! Every numeric threshold the scheduler uses is a configurable default.
//! Values can be set programmatically with the `with_*` setters or from the
//! kernel command line with [`SchedConfig::apply_cmdline`]:
//!
//! ```text
//! sched.rt_bound=0.9 sched.quantum_min_us=500 sched.quantum_max_us=50000
//! sched.imbalance_pct=25 sched.balance_ticks=50 sched.default_prio=40
//! sched.predictors=priority,temporal,quantum sched.miss_fatal=1
//! ```

extern crate alloc;

use alloc::string::ToString;

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::error::ConfigError;
use crate::numa::NumaTopology;
use crate::types::{Nanoseconds, PriorityLevel, MAX_CPUS};

// ============================================================================
// DEFAULTS
// ============================================================================

/// Default real-time utilization bound per CPU
pub const DEFAULT_RT_UTILIZATION_BOUND: f64 = 0.95;

/// Default quantum floor (1ms)
pub const DEFAULT_QUANTUM_FLOOR_NS: u64 = 1_000_000;

/// Default quantum when no predictor is available (10ms)
pub const DEFAULT_QUANTUM_NS: u64 = 10_000_000;

/// Default quantum ceiling (100ms)
pub const DEFAULT_QUANTUM_CEILING_NS: u64 = 100_000_000;

/// Default load-imbalance threshold (20% deviation from the mean)
pub const DEFAULT_IMBALANCE_THRESHOLD: f64 = 0.20;

/// Default balancer cadence in ticks
pub const DEFAULT_BALANCE_INTERVAL_TICKS: u64 = 100;

/// Maximum NUMA/cache adjustment as a fraction of the fused score
pub const MAX_PLACEMENT_ADJUSTMENT: f64 = 0.10;

const_assert!(DEFAULT_QUANTUM_FLOOR_NS <= DEFAULT_QUANTUM_NS);
const_assert!(DEFAULT_QUANTUM_NS <= DEFAULT_QUANTUM_CEILING_NS);
const_assert!(DEFAULT_BALANCE_INTERVAL_TICKS > 0);

// ============================================================================
// PREDICTOR SELECTION
// ============================================================================

bitflags! {
    /// Built-in predictors enabled at init
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PredictorSelection: u8 {
        /// Base priority from wait time and CPU consumption
        const PRIORITY       = 1 << 0;
        /// Burst behaviour over time
        const TEMPORAL       = 1 << 1;
        /// Declared importance and I/O context
        const CONTEXTUAL     = 1 << 2;
        /// Per-class reinforcement values
        const POLICY         = 1 << 3;
        /// Quantum length
        const QUANTUM        = 1 << 4;
        /// Per-CPU load evolution
        const LOAD_EVOLUTION = 1 << 5;
        /// The four fused priority signals
        const FUSED = Self::PRIORITY.bits()
            | Self::TEMPORAL.bits()
            | Self::CONTEXTUAL.bits()
            | Self::POLICY.bits();
    }
}

impl Default for PredictorSelection {
    fn default() -> Self {
        Self::all()
    }
}

impl PredictorSelection {
    /// Parse a comma-separated list of predictor names
    pub fn parse_list(list: &str) -> Option<Self> {
        let mut selection = Self::empty();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            selection |= match name {
                "priority" => Self::PRIORITY,
                "temporal" => Self::TEMPORAL,
                "contextual" => Self::CONTEXTUAL,
                "policy" => Self::POLICY,
                "quantum" => Self::QUANTUM,
                "load" | "load_evolution" => Self::LOAD_EVOLUTION,
                "all" => Self::all(),
                "none" => Self::empty(),
                _ => return None,
            };
        }
        Some(selection)
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Per-kind fusion weights, multiplied with each score's confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub priority: f64,
    pub temporal: f64,
    pub contextual: f64,
    pub policy: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            priority: 1.0,
            temporal: 1.0,
            contextual: 1.0,
            policy: 1.0,
        }
    }
}

impl FusionWeights {
    fn all_valid(&self) -> bool {
        [self.priority, self.temporal, self.contextual, self.policy]
            .iter()
            .all(|w| w.is_finite() && *w >= 0.0)
    }
}

/// Quantum bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantumConfig {
    /// Shortest quantum ever handed out
    pub floor: Nanoseconds,
    /// Longest quantum ever handed out
    pub ceiling: Nanoseconds,
    /// Quantum used when the quantum predictor is unavailable
    pub default: Nanoseconds,
}

impl Default for QuantumConfig {
    fn default() -> Self {
        Self {
            floor: Nanoseconds::new(DEFAULT_QUANTUM_FLOOR_NS),
            ceiling: Nanoseconds::new(DEFAULT_QUANTUM_CEILING_NS),
            default: Nanoseconds::new(DEFAULT_QUANTUM_NS),
        }
    }
}

/// What happens when an admitted task misses its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlineMissPolicy {
    /// Log, count and report
    #[default]
    Report,
    /// Surface `SchedError::DeadlineMissed` to the caller
    Fatal,
}

/// Real-time admission settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealtimeConfig {
    /// Per-CPU utilization bound for admitted tasks
    pub utilization_bound: f64,
    /// Miss handling
    pub miss_policy: DeadlineMissPolicy,
    /// Upper bound on one admission test
    pub admission_budget: Nanoseconds,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            utilization_bound: DEFAULT_RT_UTILIZATION_BOUND,
            miss_policy: DeadlineMissPolicy::Report,
            admission_budget: Nanoseconds::from_micros(50),
        }
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancerConfig {
    /// Run the balancer every N ticks
    pub interval_ticks: u64,
    /// Relative deviation from the mean load that triggers migration
    pub imbalance_threshold: f64,
    /// Runnable demand that maps to a normalized load of 1.0
    pub load_scale: f64,
    /// Cap on planned migrations per pass
    pub max_migrations: usize,
    /// Upper bound on one migration step
    pub migration_budget: Nanoseconds,
    /// `try_lock` attempts per run-queue lock before giving up
    pub lock_spin_limit: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            interval_ticks: DEFAULT_BALANCE_INTERVAL_TICKS,
            imbalance_threshold: DEFAULT_IMBALANCE_THRESHOLD,
            load_scale: 8.0,
            max_migrations: 8,
            migration_budget: Nanoseconds::from_micros(100),
            lock_spin_limit: 1024,
        }
    }
}

/// Placement optimizer weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementConfig {
    /// Bound on the priority adjustment, as a fraction of the fused score
    pub max_adjustment: f64,
    /// Time constant of cache-residency decay
    pub cache_decay: Nanoseconds,
    /// Normalized load a fully warm cache is worth
    pub cache_weight: f64,
    /// Normalized load per unit of relative NUMA distance
    pub numa_weight: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_adjustment: MAX_PLACEMENT_ADJUSTMENT,
            cache_decay: Nanoseconds::from_millis(10),
            cache_weight: 0.05,
            numa_weight: 0.05,
        }
    }
}

/// Workload classifier thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierThresholds {
    /// I/O wait ratio above which a task is I/O-bound
    pub io_bound_ratio: f64,
    /// Mean CPU usage at or above which a task is CPU-bound
    pub cpu_bound_usage: f64,
    /// Histogram variance below which usage counts as steady
    pub interactive_variance: f64,
    /// Wait time below which a task counts as responsive
    pub interactive_wait: Nanoseconds,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            io_bound_ratio: 0.6,
            cpu_bound_usage: 0.8,
            interactive_variance: 0.02,
            interactive_wait: Nanoseconds::from_millis(5),
        }
    }
}

// ============================================================================
// SCHEDULER CONFIG
// ============================================================================

/// Complete scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Number of CPUs managed
    pub cpu_count: usize,
    /// Built-in predictors to construct
    pub predictors: PredictorSelection,
    /// Priority used when no fused predictor is available
    pub default_priority: PriorityLevel,
    /// Fusion weights
    pub fusion: FusionWeights,
    /// Quantum bounds
    pub quantum: QuantumConfig,
    /// Real-time admission
    pub realtime: RealtimeConfig,
    /// Load balancing
    pub balancer: BalancerConfig,
    /// Placement optimizer
    pub placement: PlacementConfig,
    /// Classifier thresholds
    pub classifier: ClassifierThresholds,
    /// Static NUMA topology; `None` means one node holding every CPU
    pub topology: Option<NumaTopology>,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpu_count: 4,
            predictors: PredictorSelection::default(),
            default_priority: PriorityLevel::default(),
            fusion: FusionWeights::default(),
            quantum: QuantumConfig::default(),
            realtime: RealtimeConfig::default(),
            balancer: BalancerConfig::default(),
            placement: PlacementConfig::default(),
            classifier: ClassifierThresholds::default(),
            topology: None,
        }
    }
}

impl SchedConfig {
    /// Default configuration for `cpu_count` CPUs
    pub fn new(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            ..Self::default()
        }
    }

    /// Set the predictor selection
    pub fn with_predictors(mut self, predictors: PredictorSelection) -> Self {
        self.predictors = predictors;
        self
    }

    /// Set the degraded-mode priority
    pub fn with_default_priority(mut self, priority: PriorityLevel) -> Self {
        self.default_priority = priority;
        self
    }

    /// Set quantum floor and ceiling
    pub fn with_quantum_bounds(mut self, floor: Nanoseconds, ceiling: Nanoseconds) -> Self {
        self.quantum.floor = floor;
        self.quantum.ceiling = ceiling;
        self
    }

    /// Set the RT utilization bound
    pub fn with_rt_bound(mut self, bound: f64) -> Self {
        self.realtime.utilization_bound = bound;
        self
    }

    /// Set the deadline-miss policy
    pub fn with_miss_policy(mut self, policy: DeadlineMissPolicy) -> Self {
        self.realtime.miss_policy = policy;
        self
    }

    /// Set the imbalance threshold
    pub fn with_imbalance_threshold(mut self, threshold: f64) -> Self {
        self.balancer.imbalance_threshold = threshold;
        self
    }

    /// Set the balancer cadence
    pub fn with_balance_interval(mut self, ticks: u64) -> Self {
        self.balancer.interval_ticks = ticks;
        self
    }

    /// Set the NUMA topology
    pub fn with_topology(mut self, topology: NumaTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Validate every field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(ConfigError::OutOfRange {
                field: "cpu_count",
                reason: "must be in 1..=MAX_CPUS",
            });
        }
        if self.default_priority > PriorityLevel::NORMAL_MAX {
            return Err(ConfigError::OutOfRange {
                field: "default_priority",
                reason: "real-time levels are reserved for admitted tasks",
            });
        }
        if !self.fusion.all_valid() {
            return Err(ConfigError::OutOfRange {
                field: "fusion",
                reason: "weights must be finite and non-negative",
            });
        }
        let q = &self.quantum;
        if q.floor == Nanoseconds::ZERO {
            return Err(ConfigError::OutOfRange {
                field: "quantum.floor",
                reason: "must be positive",
            });
        }
        if q.floor > q.ceiling {
            return Err(ConfigError::Inconsistent {
                fields: "quantum.floor/quantum.ceiling",
                reason: "floor exceeds ceiling",
            });
        }
        if q.default < q.floor || q.default > q.ceiling {
            return Err(ConfigError::Inconsistent {
                fields: "quantum.default",
                reason: "default must lie within [floor, ceiling]",
            });
        }
        let bound = self.realtime.utilization_bound;
        if !(bound > 0.0 && bound <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "realtime.utilization_bound",
                reason: "must be in (0, 1]",
            });
        }
        let b = &self.balancer;
        if b.interval_ticks == 0 {
            return Err(ConfigError::OutOfRange {
                field: "balancer.interval_ticks",
                reason: "must be at least 1",
            });
        }
        if !(b.imbalance_threshold > 0.0 && b.imbalance_threshold.is_finite()) {
            return Err(ConfigError::OutOfRange {
                field: "balancer.imbalance_threshold",
                reason: "must be positive",
            });
        }
        if !(b.load_scale > 0.0 && b.load_scale.is_finite()) {
            return Err(ConfigError::OutOfRange {
                field: "balancer.load_scale",
                reason: "must be positive",
            });
        }
        let p = &self.placement;
        if !(p.max_adjustment >= 0.0 && p.max_adjustment <= MAX_PLACEMENT_ADJUSTMENT) {
            return Err(ConfigError::OutOfRange {
                field: "placement.max_adjustment",
                reason: "must be within [0, 0.10]",
            });
        }
        if !(p.cache_weight >= 0.0 && p.numa_weight >= 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "placement",
                reason: "weights must be non-negative",
            });
        }
        Ok(())
    }

    /// Apply `sched.*` options from a kernel command line.
    ///
    /// Unknown `sched.*` keys are logged and ignored; other tokens are not
    /// ours and are skipped silently.
    pub fn apply_cmdline(&mut self, cmdline: &str) -> Result<(), ConfigError> {
        for token in cmdline.split_whitespace() {
            let Some(option) = token.strip_prefix("sched.") else {
                continue;
            };
            let (key, value) = match option.split_once('=') {
                Some((k, v)) => (k, v),
                None => (option, "1"),
            };
            let parse_err = || ConfigError::Parse {
                key: key.to_string(),
            };
            match key {
                "rt_bound" => {
                    self.realtime.utilization_bound = value.parse().map_err(|_| parse_err())?;
                },
                "quantum_min_us" => {
                    let us: u64 = value.parse().map_err(|_| parse_err())?;
                    self.quantum.floor = Nanoseconds::from_micros(us);
                },
                "quantum_max_us" => {
                    let us: u64 = value.parse().map_err(|_| parse_err())?;
                    self.quantum.ceiling = Nanoseconds::from_micros(us);
                },
                "quantum_us" => {
                    let us: u64 = value.parse().map_err(|_| parse_err())?;
                    self.quantum.default = Nanoseconds::from_micros(us);
                },
                "imbalance_pct" => {
                    let pct: f64 = value.parse().map_err(|_| parse_err())?;
                    self.balancer.imbalance_threshold = pct / 100.0;
                },
                "balance_ticks" => {
                    self.balancer.interval_ticks = value.parse().map_err(|_| parse_err())?;
                },
                "default_prio" => {
                    let level: u8 = value.parse().map_err(|_| parse_err())?;
                    self.default_priority = PriorityLevel::new(level);
                },
                "predictors" => {
                    self.predictors = PredictorSelection::parse_list(value).ok_or_else(parse_err)?;
                },
                "nopredict" => self.predictors = PredictorSelection::empty(),
                "miss_fatal" => {
                    self.realtime.miss_policy = match value {
                        "1" | "y" | "yes" | "on" => DeadlineMissPolicy::Fatal,
                        "0" | "n" | "no" | "off" => DeadlineMissPolicy::Report,
                        _ => return Err(parse_err()),
                    };
                },
                _ => log::warn!("sched: ignoring unknown option '{}'", token),
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.realtime.utilization_bound, 0.95);
        assert_eq!(config.quantum.floor, Nanoseconds::from_millis(1));
        assert_eq!(config.quantum.ceiling, Nanoseconds::from_millis(100));
        assert_eq!(config.balancer.imbalance_threshold, 0.20);
    }

    #[test]
    fn test_validate_rejects_inverted_quantum() {
        let config = SchedConfig::default()
            .with_quantum_bounds(Nanoseconds::from_millis(50), Nanoseconds::from_millis(5));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_bound() {
        assert!(SchedConfig::default().with_rt_bound(0.0).validate().is_err());
        assert!(SchedConfig::default().with_rt_bound(1.5).validate().is_err());
        assert!(SchedConfig::default().with_rt_bound(f64::NAN).validate().is_err());
        assert!(SchedConfig::default().with_rt_bound(1.0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_rt_default_priority() {
        let config = SchedConfig::default().with_default_priority(PriorityLevel::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cmdline() {
        let mut config = SchedConfig::default();
        config
            .apply_cmdline(
                "quiet sched.rt_bound=0.9 sched.quantum_min_us=500 sched.imbalance_pct=25 \
                 sched.balance_ticks=50 sched.predictors=priority,quantum sched.miss_fatal=1 \
                 sched.bogus=3",
            )
            .unwrap();
        assert_eq!(config.realtime.utilization_bound, 0.9);
        assert_eq!(config.quantum.floor, Nanoseconds::from_micros(500));
        assert_eq!(config.balancer.imbalance_threshold, 0.25);
        assert_eq!(config.balancer.interval_ticks, 50);
        assert_eq!(
            config.predictors,
            PredictorSelection::PRIORITY | PredictorSelection::QUANTUM
        );
        assert_eq!(config.realtime.miss_policy, DeadlineMissPolicy::Fatal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cmdline_parse_error() {
        let mut config = SchedConfig::default();
        let err = config.apply_cmdline("sched.rt_bound=high").unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                key: "rt_bound".into()
            }
        );
        assert!(config.apply_cmdline("sched.predictors=oracle").is_err());
    }

    #[test]
    fn test_nopredict_flag() {
        let mut config = SchedConfig::default();
        config.apply_cmdline("sched.nopredict").unwrap();
        assert!(config.predictors.is_empty());
    }
}
