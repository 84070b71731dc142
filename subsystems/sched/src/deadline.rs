//! # Deadline / Real-Time Manager
//!
//! Admission control and reservation tracking for deadline-bound tasks.
//!
//! ```text
//!  Requested ──► Admitted ──► Running ──► Completed
//!      │            │            │
//!      ▼            ├────────────┴──────► Missed
//!   Rejected        └───────────────────► Completed
//! ```
//!
//! Admission is a Liu–Layland style utilization test per CPU: the sum of
//! reserved utilizations on the target CPU, including the new request, must
//! not exceed the configured bound. Utilization is kept in integer parts per
//! billion and new requests are rounded up, so a CPU sitting exactly at the
//! bound rejects any positive request and still admits a zero one.
//!
//! Reservations live in one table per CPU behind that CPU's own lock; the
//! tick path only ever touches its local table.

extern crate alloc;

use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use crate::clock::{Clock, TimeBudget};
use crate::config::{DeadlineMissPolicy, RealtimeConfig};
use crate::error::{SchedError, SchedResult};
use crate::math;
use crate::types::{CpuId, Nanoseconds, TaskId};

/// Utilization fixed-point scale (parts per billion)
const UTIL_SCALE: u64 = 1_000_000_000;

#[inline]
fn to_ppb(utilization: f64) -> u64 {
    math::round(utilization * UTIL_SCALE as f64) as u64
}

#[inline]
fn from_ppb(ppb: u64) -> f64 {
    ppb as f64 / UTIL_SCALE as f64
}

// ============================================================================
// REQUESTS AND DECISIONS
// ============================================================================

/// Real-time reservation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeRequest {
    /// Task asking for the reservation
    pub task: TaskId,
    /// CPU to reserve on
    pub cpu: CpuId,
    /// CPU time needed per period
    pub runtime: Nanoseconds,
    /// Period length
    pub period: Nanoseconds,
    /// Relative deadline (defaults to the period)
    pub deadline: Nanoseconds,
}

impl RealtimeRequest {
    /// Request `runtime` every `period` on `cpu`, deadline at period end
    pub fn new(task: TaskId, cpu: CpuId, runtime: Nanoseconds, period: Nanoseconds) -> Self {
        Self {
            task,
            cpu,
            runtime,
            period,
            deadline: period,
        }
    }

    /// Set a relative deadline shorter than the period
    pub fn with_deadline(mut self, deadline: Nanoseconds) -> Self {
        self.deadline = deadline;
        self
    }

    /// Requested utilization in parts per billion, rounded up
    fn utilization_ppb(&self) -> u64 {
        let period = self.period.raw().max(1) as u128;
        let scaled = self.runtime.raw() as u128 * UTIL_SCALE as u128;
        ((scaled + period - 1) / period) as u64
    }

    /// Requested utilization
    #[inline]
    pub fn utilization(&self) -> f64 {
        from_ppb(self.utilization_ppb())
    }

    fn validate(&self) -> SchedResult<()> {
        if self.period == Nanoseconds::ZERO {
            return Err(SchedError::InvalidArgument {
                field: "period",
                reason: "must be positive",
            });
        }
        if self.runtime > self.period {
            return Err(SchedError::InvalidArgument {
                field: "runtime",
                reason: "exceeds period",
            });
        }
        if self.deadline == Nanoseconds::ZERO || self.deadline > self.period {
            return Err(SchedError::InvalidArgument {
                field: "deadline",
                reason: "must lie within (0, period]",
            });
        }
        Ok(())
    }
}

/// Admission verdict.
///
/// [`RealtimeManager::check_admission`] reports both verdicts;
/// [`RealtimeManager::request`] turns `Rejected` into
/// [`SchedError::AdmissionRejected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admitted,
    Rejected,
}

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealtimeDecision {
    pub task: TaskId,
    pub cpu: CpuId,
    pub verdict: Verdict,
    /// Absolute deadline of the reservation window
    pub deadline: Nanoseconds,
    /// CPU time available before the deadline
    pub budget: Nanoseconds,
    /// Reserved utilization
    pub utilization: f64,
}

impl RealtimeDecision {
    /// Was the request admitted?
    #[inline(always)]
    pub fn is_admitted(&self) -> bool {
        self.verdict == Verdict::Admitted
    }
}

/// Reservation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtState {
    Requested,
    Admitted,
    Running,
    Missed,
    Completed,
    Rejected,
}

impl RtState {
    /// Is `self → next` a legal transition?
    pub fn can_transition_to(&self, next: RtState) -> bool {
        use RtState::*;
        matches!(
            (self, next),
            (Requested, Admitted)
                | (Requested, Rejected)
                | (Admitted, Running)
                | (Admitted, Missed)
                | (Admitted, Completed)
                | (Running, Missed)
                | (Running, Completed)
        )
    }

    /// Does the reservation still hold CPU capacity?
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, RtState::Admitted | RtState::Running)
    }
}

/// Live reservation as seen by callers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtReservation {
    pub task: TaskId,
    pub cpu: CpuId,
    pub state: RtState,
    /// Absolute deadline
    pub deadline: Nanoseconds,
    /// Budget left in the current window
    pub budget_remaining: Nanoseconds,
    pub utilization: f64,
}

/// A reservation whose deadline passed with budget still unspent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineMiss {
    pub task: TaskId,
    pub cpu: CpuId,
    pub deadline: Nanoseconds,
    pub detected_at: Nanoseconds,
    pub budget_remaining: Nanoseconds,
}

// ============================================================================
// PER-CPU TABLES
// ============================================================================

#[derive(Debug, Clone)]
struct Reservation {
    state: RtState,
    utilization_ppb: u64,
    deadline: Nanoseconds,
    budget_remaining: Nanoseconds,
}

impl Reservation {
    fn transition(&mut self, next: RtState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal rt transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

#[derive(Debug, Default)]
struct CpuReservations {
    reserved_ppb: u64,
    entries: HashMap<TaskId, Reservation>,
}

impl CpuReservations {
    fn remove(&mut self, task: TaskId) -> Option<Reservation> {
        let r = self.entries.remove(&task)?;
        self.reserved_ppb = self.reserved_ppb.saturating_sub(r.utilization_ppb);
        Some(r)
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Real-time admission controller
#[derive(Debug)]
pub struct RealtimeManager {
    cpus: Vec<Mutex<CpuReservations>>,
    bound_ppb: u64,
    config: RealtimeConfig,
}

impl RealtimeManager {
    /// Create a manager for `cpu_count` CPUs
    pub fn new(cpu_count: usize, config: RealtimeConfig) -> Self {
        Self {
            cpus: (0..cpu_count)
                .map(|_| Mutex::new(CpuReservations::default()))
                .collect(),
            bound_ppb: to_ppb(config.utilization_bound),
            config,
        }
    }

    fn table(&self, cpu: CpuId) -> SchedResult<&Mutex<CpuReservations>> {
        self.cpus.get(cpu as usize).ok_or(SchedError::InvalidCpu(cpu))
    }

    /// Configured utilization bound
    #[inline]
    pub fn bound(&self) -> f64 {
        from_ppb(self.bound_ppb)
    }

    /// Miss policy
    #[inline(always)]
    pub fn miss_policy(&self) -> DeadlineMissPolicy {
        self.config.miss_policy
    }

    /// Admission test without reserving anything.
    ///
    /// Returns the decision `request` would make right now, `Rejected`
    /// included.
    pub fn check_admission(&self, request: &RealtimeRequest, now: Nanoseconds) -> SchedResult<RealtimeDecision> {
        request.validate()?;
        let reserved = self.table(request.cpu)?.lock().reserved_ppb;
        Ok(self.decide(request, reserved, now))
    }

    fn decide(&self, request: &RealtimeRequest, reserved_ppb: u64, now: Nanoseconds) -> RealtimeDecision {
        let wanted = request.utilization_ppb();
        let verdict = if reserved_ppb.saturating_add(wanted) > self.bound_ppb {
            Verdict::Rejected
        } else {
            Verdict::Admitted
        };
        RealtimeDecision {
            task: request.task,
            cpu: request.cpu,
            verdict,
            deadline: now + request.deadline,
            budget: request.runtime,
            utilization: from_ppb(wanted),
        }
    }

    /// Admission test and, on success, reservation.
    ///
    /// Every CPU table is held, in index order, from the duplicate check to
    /// the insert, so a task is never admitted on two CPUs. A rejected or
    /// timed-out request leaves every table untouched.
    pub fn request(
        &self,
        request: &RealtimeRequest,
        now: Nanoseconds,
        clock: &dyn Clock,
    ) -> SchedResult<RealtimeDecision> {
        let budget = TimeBudget::start(clock, self.config.admission_budget);
        request.validate()?;
        self.table(request.cpu)?;

        let mut tables: Vec<MutexGuard<'_, CpuReservations>> =
            self.cpus.iter().map(|t| t.lock()).collect();
        if tables.iter().any(|t| t.entries.contains_key(&request.task)) {
            return Err(SchedError::AlreadyAdmitted(request.task));
        }
        if budget.exceeded(clock) {
            log::warn!(
                "sched: rt admission for {} exceeded {}",
                request.task,
                budget.limit()
            );
            return Err(SchedError::Timeout {
                operation: "rt admission",
                budget: budget.limit(),
            });
        }
        let reservations = tables
            .get_mut(request.cpu as usize)
            .ok_or(SchedError::InvalidCpu(request.cpu))?;

        let reserved = reservations.reserved_ppb;
        let wanted = request.utilization_ppb();
        let decision = self.decide(request, reserved, now);
        if decision.verdict == Verdict::Rejected {
            log::debug!(
                "sched: rt admission rejected for {} on cpu {} ({:.3} + {:.3} > {:.3})",
                request.task,
                request.cpu,
                from_ppb(reserved),
                from_ppb(wanted),
                self.bound()
            );
            return Err(SchedError::AdmissionRejected {
                task: request.task,
                cpu: request.cpu,
                requested: from_ppb(wanted),
                available: from_ppb(self.bound_ppb.saturating_sub(reserved)),
            });
        }

        let mut reservation = Reservation {
            state: RtState::Requested,
            utilization_ppb: wanted,
            deadline: decision.deadline,
            budget_remaining: decision.budget,
        };
        reservation.transition(RtState::Admitted);
        reservations.reserved_ppb += wanted;
        reservations.entries.insert(request.task, reservation);
        log::debug!(
            "sched: admitted {} on cpu {} (u={:.3}, deadline {})",
            request.task,
            request.cpu,
            decision.utilization,
            decision.deadline
        );
        Ok(decision)
    }

    /// Reservation of `task` on `cpu`, if any
    pub fn reservation(&self, cpu: CpuId, task: TaskId) -> Option<RtReservation> {
        let table = self.cpus.get(cpu as usize)?.lock();
        table.entries.get(&task).map(|r| RtReservation {
            task,
            cpu,
            state: r.state,
            deadline: r.deadline,
            budget_remaining: r.budget_remaining,
            utilization: from_ppb(r.utilization_ppb),
        })
    }

    /// CPU holding a reservation for `task` (scans every CPU)
    pub fn reserved_cpu(&self, task: TaskId) -> Option<CpuId> {
        self.cpus
            .iter()
            .position(|t| t.lock().entries.contains_key(&task))
            .map(|i| i as CpuId)
    }

    /// Reserved utilization on a CPU
    pub fn utilization(&self, cpu: CpuId) -> f64 {
        self.cpus
            .get(cpu as usize)
            .map(|t| from_ppb(t.lock().reserved_ppb))
            .unwrap_or(0.0)
    }

    /// Number of reservations on a CPU
    pub fn reserved_count(&self, cpu: CpuId) -> usize {
        self.cpus
            .get(cpu as usize)
            .map(|t| t.lock().entries.len())
            .unwrap_or(0)
    }

    /// The selection engine picked `task` inside its window
    pub fn mark_running(&self, cpu: CpuId, task: TaskId) {
        let Some(table) = self.cpus.get(cpu as usize) else {
            return;
        };
        if let Some(r) = table.lock().entries.get_mut(&task) {
            if r.state == RtState::Admitted {
                r.transition(RtState::Running);
            }
        }
    }

    /// Charge `ran` against the task's budget.
    ///
    /// Exhausting the budget completes the window and releases the
    /// reservation. Returns the resulting state, or `None` if the task holds
    /// no reservation on `cpu`.
    pub fn charge(&self, cpu: CpuId, task: TaskId, ran: Nanoseconds) -> Option<RtState> {
        let mut table = self.cpus.get(cpu as usize)?.lock();
        let r = table.entries.get_mut(&task)?;
        r.budget_remaining = r.budget_remaining.saturating_sub(ran);
        if r.budget_remaining > Nanoseconds::ZERO {
            return Some(r.state);
        }
        r.transition(RtState::Completed);
        table.remove(task);
        log::trace!("sched: {} completed its rt window on cpu {}", task, cpu);
        Some(RtState::Completed)
    }

    /// Release a reservation when the task finishes
    pub fn complete(&self, task: TaskId) -> SchedResult<()> {
        let cpu = self.reserved_cpu(task).ok_or(SchedError::UnknownTask(task))?;
        let mut table = self.table(cpu)?.lock();
        if let Some(mut r) = table.remove(task) {
            r.transition(RtState::Completed);
        }
        Ok(())
    }

    /// Detect reservations on `cpu` whose deadline passed with budget left.
    ///
    /// Missed reservations are logged and released; the task must request
    /// again. Under [`DeadlineMissPolicy::Fatal`] the first miss is returned
    /// as an error (after every miss has been released).
    pub fn check_deadlines(&self, cpu: CpuId, now: Nanoseconds) -> SchedResult<Vec<DeadlineMiss>> {
        let mut table = self.table(cpu)?.lock();
        let missed: Vec<TaskId> = table
            .entries
            .iter()
            .filter(|(_, r)| r.state.is_active() && now > r.deadline)
            .map(|(task, _)| *task)
            .collect();

        let mut misses = Vec::with_capacity(missed.len());
        for task in missed {
            if let Some(mut r) = table.remove(task) {
                r.transition(RtState::Missed);
                log::warn!(
                    "sched: {} missed deadline {} on cpu {} ({} budget left)",
                    task,
                    r.deadline,
                    cpu,
                    r.budget_remaining
                );
                misses.push(DeadlineMiss {
                    task,
                    cpu,
                    deadline: r.deadline,
                    detected_at: now,
                    budget_remaining: r.budget_remaining,
                });
            }
        }
        misses.sort_by_key(|m| (m.deadline, m.task));

        if self.config.miss_policy == DeadlineMissPolicy::Fatal {
            if let Some(first) = misses.first() {
                return Err(SchedError::DeadlineMissed {
                    task: first.task,
                    cpu,
                    deadline: first.deadline,
                    now,
                });
            }
        }
        Ok(misses)
    }

    /// Drop every reservation
    pub fn shutdown(&self) {
        for table in &self.cpus {
            let mut t = table.lock();
            t.entries.clear();
            t.reserved_ppb = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn ms(v: u64) -> Nanoseconds {
        Nanoseconds::from_millis(v)
    }

    fn manager() -> RealtimeManager {
        RealtimeManager::new(2, RealtimeConfig::default())
    }

    #[test]
    fn test_admission_at_exact_bound() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let rt = manager();
        let full = RealtimeRequest::new(TaskId::new(1), 0, ms(95), ms(100));
        assert!(rt.request(&full, clock.now(), &clock).unwrap().is_admitted());
        assert_eq!(rt.utilization(0), 0.95);

        let tiny = RealtimeRequest::new(TaskId::new(2), 0, Nanoseconds::new(1), ms(100));
        let err = rt.request(&tiny, clock.now(), &clock).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(rt.reserved_count(0), 1);

        let zero = RealtimeRequest::new(TaskId::new(3), 0, Nanoseconds::ZERO, ms(100));
        assert!(rt.request(&zero, clock.now(), &clock).unwrap().is_admitted());
    }

    #[test]
    fn test_rejection_leaves_state_unchanged() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let rt = manager();
        rt.request(&RealtimeRequest::new(TaskId::new(1), 1, ms(60), ms(100)), ms(0), &clock)
            .unwrap();
        let before = rt.utilization(1);
        let err = rt
            .request(&RealtimeRequest::new(TaskId::new(2), 1, ms(40), ms(100)), ms(0), &clock)
            .unwrap_err();
        match err {
            SchedError::AdmissionRejected {
                requested,
                available,
                ..
            } => {
                assert!((requested - 0.4).abs() < 1e-9);
                assert!((available - 0.35).abs() < 1e-9);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rt.utilization(1), before);
        assert!(rt.reservation(1, TaskId::new(2)).is_none());
    }

    #[test]
    fn test_duplicate_request_needs_completion() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let rt = manager();
        let req = RealtimeRequest::new(TaskId::new(1), 0, ms(10), ms(100));
        rt.request(&req, ms(0), &clock).unwrap();
        let moved = RealtimeRequest { cpu: 1, ..req };
        assert!(matches!(
            rt.request(&moved, ms(0), &clock),
            Err(SchedError::AlreadyAdmitted(_))
        ));
        rt.complete(TaskId::new(1)).unwrap();
        assert!(rt.request(&moved, ms(0), &clock).is_ok());
        assert!(matches!(
            rt.complete(TaskId::new(9)),
            Err(SchedError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_check_admission_reports_rejection() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let rt = manager();
        rt.request(&RealtimeRequest::new(TaskId::new(1), 0, ms(80), ms(100)), ms(0), &clock)
            .unwrap();

        let fits = RealtimeRequest::new(TaskId::new(2), 0, ms(15), ms(100));
        let decision = rt.check_admission(&fits, ms(5)).unwrap();
        assert_eq!(decision.verdict, Verdict::Admitted);
        assert_eq!(decision.deadline, ms(105));
        assert_eq!(decision.budget, ms(15));

        let too_big = RealtimeRequest::new(TaskId::new(3), 0, ms(20), ms(100));
        let decision = rt.check_admission(&too_big, ms(5)).unwrap();
        assert_eq!(decision.verdict, Verdict::Rejected);
        assert!(!decision.is_admitted());
        assert_eq!(rt.reserved_count(0), 1);
        assert!((rt.utilization(0) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_requests_admit_once() {
        for round in 0..200 {
            let rt = RealtimeManager::new(4, RealtimeConfig::default());
            let task = TaskId::new(round);
            let admitted: usize = std::thread::scope(|s| {
                let handles: Vec<_> = (0..4)
                    .map(|cpu| {
                        let rt = &rt;
                        s.spawn(move || {
                            let clock = ManualClock::new(Nanoseconds::ZERO);
                            let req = RealtimeRequest::new(task, cpu, ms(1), ms(10));
                            rt.request(&req, ms(0), &clock).is_ok() as usize
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).sum()
            });
            assert_eq!(admitted, 1);
            let reserved: usize = (0..4).map(|cpu| rt.reserved_count(cpu)).sum();
            assert_eq!(reserved, 1);
        }
    }

    #[test]
    fn test_invalid_requests() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let rt = manager();
        let bad_period = RealtimeRequest::new(TaskId::new(1), 0, ms(1), Nanoseconds::ZERO);
        assert!(rt.request(&bad_period, ms(0), &clock).is_err());
        let too_long = RealtimeRequest::new(TaskId::new(1), 0, ms(20), ms(10));
        assert!(rt.request(&too_long, ms(0), &clock).is_err());
        let bad_cpu = RealtimeRequest::new(TaskId::new(1), 7, ms(1), ms(10));
        assert!(matches!(
            rt.request(&bad_cpu, ms(0), &clock),
            Err(SchedError::InvalidCpu(7))
        ));
    }

    #[test]
    fn test_budget_charging_completes_window() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let rt = manager();
        let task = TaskId::new(4);
        rt.request(&RealtimeRequest::new(task, 0, ms(10), ms(50)), ms(0), &clock)
            .unwrap();
        rt.mark_running(0, task);
        assert_eq!(rt.charge(0, task, ms(4)), Some(RtState::Running));
        assert_eq!(rt.reservation(0, task).unwrap().budget_remaining, ms(6));
        assert_eq!(rt.charge(0, task, ms(6)), Some(RtState::Completed));
        assert!(rt.reservation(0, task).is_none());
        assert_eq!(rt.utilization(0), 0.0);
    }

    #[test]
    fn test_deadline_miss_reported() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let rt = manager();
        let task = TaskId::new(5);
        rt.request(&RealtimeRequest::new(task, 0, ms(10), ms(20)), ms(0), &clock)
            .unwrap();
        rt.mark_running(0, task);
        assert!(rt.check_deadlines(0, ms(20)).unwrap().is_empty());

        let misses = rt.check_deadlines(0, ms(21)).unwrap();
        assert_eq!(misses.len(), 1);
        assert_eq!(misses[0].task, task);
        assert_eq!(misses[0].budget_remaining, ms(10));
        assert!(rt.reservation(0, task).is_none());
    }

    #[test]
    fn test_fatal_miss_policy() {
        let clock = ManualClock::new(Nanoseconds::ZERO);
        let config = RealtimeConfig {
            miss_policy: DeadlineMissPolicy::Fatal,
            ..RealtimeConfig::default()
        };
        let rt = RealtimeManager::new(1, config);
        rt.request(&RealtimeRequest::new(TaskId::new(6), 0, ms(1), ms(5)), ms(0), &clock)
            .unwrap();
        let err = rt.check_deadlines(0, ms(6)).unwrap_err();
        assert!(matches!(err, SchedError::DeadlineMissed { .. }));
        assert_eq!(rt.reserved_count(0), 0);
    }

    #[test]
    fn test_admission_timeout() {
        struct SlowClock(ManualClock);
        impl Clock for SlowClock {
            fn now(&self) -> Nanoseconds {
                self.0.advance(Nanoseconds::from_micros(60));
                self.0.now()
            }
        }
        let clock = SlowClock(ManualClock::new(Nanoseconds::ZERO));
        let rt = manager();
        let err = rt
            .request(&RealtimeRequest::new(TaskId::new(1), 0, ms(1), ms(10)), ms(0), &clock)
            .unwrap_err();
        assert!(matches!(err, SchedError::Timeout { .. }));
        assert_eq!(rt.reserved_count(0), 0);
    }

    #[test]
    fn test_state_transitions() {
        assert!(RtState::Requested.can_transition_to(RtState::Admitted));
        assert!(RtState::Requested.can_transition_to(RtState::Rejected));
        assert!(RtState::Running.can_transition_to(RtState::Missed));
        assert!(!RtState::Rejected.can_transition_to(RtState::Admitted));
        assert!(!RtState::Completed.can_transition_to(RtState::Requested));
        assert!(!RtState::Missed.can_transition_to(RtState::Running));
    }
}
