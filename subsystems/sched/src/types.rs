//! Core scheduler types: identifiers, time, priority scale, CPU masks.

use core::fmt;
use core::ops::{Add, Sub};

use static_assertions::const_assert;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// CPU identifier
pub type CpuId = u32;

/// NUMA node identifier
pub type NodeId = u32;

/// NUMA distance (SLIT encoding, local = 10)
pub type Distance = u8;

/// Maximum number of CPUs a scheduler instance can manage
pub const MAX_CPUS: usize = 64;

/// Task identifier, assigned by the task lifecycle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Create a task id
    #[inline(always)]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value
    #[inline(always)]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

// ============================================================================
// TIME
// ============================================================================

/// Monotonic time or duration in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Nanoseconds(u64);

impl Nanoseconds {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Largest representable value
    pub const MAX: Self = Self(u64::MAX);

    /// From raw nanoseconds
    #[inline(always)]
    pub const fn new(ns: u64) -> Self {
        Self(ns)
    }

    /// From microseconds
    #[inline(always)]
    pub const fn from_micros(us: u64) -> Self {
        Self(us.saturating_mul(1_000))
    }

    /// From milliseconds
    #[inline(always)]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Raw nanoseconds
    #[inline(always)]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// As whole microseconds
    #[inline(always)]
    pub const fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    /// Saturating subtraction
    #[inline(always)]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Saturating addition
    #[inline(always)]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    #[inline(always)]
    pub const fn since(self, earlier: Self) -> Self {
        self.saturating_sub(earlier)
    }
}

impl Add for Nanoseconds {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl Sub for Nanoseconds {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for Nanoseconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 && self.0 % 1_000_000 == 0 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else if self.0 >= 1_000 && self.0 % 1_000 == 0 {
            write!(f, "{}us", self.0 / 1_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

// ============================================================================
// PRIORITY SCALE
// ============================================================================

/// Finalized priority level. Higher runs first.
///
/// Best-effort tasks occupy `MIN..=NORMAL_MAX`; the levels above
/// `NORMAL_MAX` are reserved for admitted real-time tasks so that an RT
/// override always dominates any non-RT adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriorityLevel(u8);

impl PriorityLevel {
    /// Lowest level
    pub const MIN: Self = Self(0);

    /// Highest level reachable without a real-time reservation
    pub const NORMAL_MAX: Self = Self(89);

    /// Real-time level
    pub const MAX: Self = Self(99);

    /// Create a level, clamped to the scale
    #[inline]
    pub const fn new(level: u8) -> Self {
        if level > Self::MAX.0 {
            Self::MAX
        } else {
            Self(level)
        }
    }

    /// Create a best-effort level, clamped to `MIN..=NORMAL_MAX`
    #[inline]
    pub const fn normal(level: u8) -> Self {
        if level > Self::NORMAL_MAX.0 {
            Self::NORMAL_MAX
        } else {
            Self(level)
        }
    }

    /// Raw value
    #[inline(always)]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Is this a real-time level?
    #[inline(always)]
    pub const fn is_realtime(&self) -> bool {
        self.0 > Self::NORMAL_MAX.0
    }
}

impl Default for PriorityLevel {
    fn default() -> Self {
        Self(45)
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio {}", self.0)
    }
}

const_assert!(PriorityLevel::NORMAL_MAX.0 < PriorityLevel::MAX.0);

// ============================================================================
// CPU MASK
// ============================================================================

/// Set of CPUs a task may run on
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMask(u64);

const_assert!(MAX_CPUS <= 64);

impl CpuMask {
    /// No CPUs
    pub const EMPTY: Self = Self(0);

    /// Every CPU
    pub const ALL: Self = Self(u64::MAX);

    /// From a raw bitmask
    #[inline(always)]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Single CPU
    #[inline]
    pub const fn single(cpu: CpuId) -> Self {
        if (cpu as usize) < MAX_CPUS {
            Self(1 << cpu)
        } else {
            Self::EMPTY
        }
    }

    /// Build from a list of CPUs
    pub fn from_cpus(cpus: &[CpuId]) -> Self {
        cpus.iter().fold(Self::EMPTY, |mask, &cpu| mask.with(cpu))
    }

    /// Add a CPU
    #[inline]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | Self::single(cpu).0)
    }

    /// Raw bits
    #[inline(always)]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Does the mask allow `cpu`?
    #[inline]
    pub const fn contains(&self, cpu: CpuId) -> bool {
        (cpu as usize) < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    /// Number of CPUs allowed
    #[inline(always)]
    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Is the mask empty?
    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_level_clamping() {
        assert_eq!(PriorityLevel::new(200), PriorityLevel::MAX);
        assert_eq!(PriorityLevel::normal(95), PriorityLevel::NORMAL_MAX);
        assert!(PriorityLevel::MAX.is_realtime());
        assert!(!PriorityLevel::NORMAL_MAX.is_realtime());
    }

    #[test]
    fn test_cpu_mask() {
        let mask = CpuMask::from_cpus(&[0, 2, 5]);
        assert!(mask.contains(2));
        assert!(!mask.contains(1));
        assert!(!mask.contains(64));
        assert_eq!(mask.count(), 3);
        assert!(CpuMask::single(80).is_empty());
    }

    #[test]
    fn test_nanoseconds() {
        let a = Nanoseconds::from_millis(3);
        let b = Nanoseconds::from_micros(500);
        assert_eq!((a - b).raw(), 2_500_000);
        assert_eq!(b.since(a), Nanoseconds::ZERO);
        assert_eq!(alloc::format!("{}", a), "3ms");
        assert_eq!(alloc::format!("{}", b), "500us");
    }
}
