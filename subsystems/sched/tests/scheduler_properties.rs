//! End-to-end scheduler properties through the public API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use helix_sched::config::QuantumConfig;
use helix_sched::error::ENOSPC;
use helix_sched::{
    init, shutdown, InitStage, LoadBalancer, MigrationEntry, MigrationFailure, MigrationPlan,
    MigrationStep, Nanoseconds, NumaTopology, Predictor, PredictorKind, PredictorSelection,
    PredictorUnavailable, PriorityLevel, RealtimeRequest, SchedConfig, SchedError,
    SchedulerBuilder, Score, TaskContext, TaskId, WorkloadClass,
};

fn ms(v: u64) -> Nanoseconds {
    Nanoseconds::from_millis(v)
}

fn quiet_config(cpus: usize) -> SchedConfig {
    SchedConfig::new(cpus).with_predictors(PredictorSelection::empty())
}

/// Fixed per-task priority scores
struct TableScores {
    scores: HashMap<u64, f64>,
}

impl Predictor<TaskContext> for TableScores {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Priority
    }

    fn predict(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        self.scores
            .get(&ctx.task.raw())
            .map(|&v| Score::new(v, 1.0))
            .ok_or(PredictorUnavailable::new(
                PredictorKind::Priority,
                helix_sched::error::UnavailableReason::InsufficientData,
            ))
    }
}

/// Always-unavailable predictor of a given kind
struct Silent(PredictorKind);

impl Predictor<TaskContext> for Silent {
    fn kind(&self) -> PredictorKind {
        self.0
    }

    fn predict(&self, _ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        Err(PredictorUnavailable::new(
            self.0,
            helix_sched::error::UnavailableReason::Offline,
        ))
    }
}

/// Quantum predictor returning a raw, possibly nonsensical value
struct RawQuantum(f64);

impl Predictor<TaskContext> for RawQuantum {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Quantum
    }

    fn predict(&self, _ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        Ok(Score::new(self.0, 1.0))
    }
}

/// Counts shutdown calls
struct Counting(Arc<AtomicUsize>);

impl Predictor<TaskContext> for Counting {
    fn kind(&self) -> PredictorKind {
        PredictorKind::Contextual
    }

    fn predict(&self, _ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        Ok(Score::new(0.5, 0.5))
    }

    fn shutdown(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Migration step that fails on one call
struct FailOnCall {
    calls: Mutex<usize>,
    fail_on: usize,
}

impl MigrationStep for FailOnCall {
    fn migrate(&self, _entry: &MigrationEntry) -> Result<(), MigrationFailure> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls == self.fail_on {
            Err(MigrationFailure::LockTimeout)
        } else {
            Ok(())
        }
    }
}

#[test]
fn test_realtime_override_gives_max_priority() {
    let sched = init(SchedConfig::new(2)).unwrap();
    let ctx = TaskContext::new(TaskId::new(9)).with_usage(&[0.9, 0.95, 0.9]);
    let before = sched.calculate_priority(&ctx, 1);
    assert!(before.priority <= PriorityLevel::NORMAL_MAX);

    let req = RealtimeRequest::new(TaskId::new(9), 1, ms(1), ms(10));
    assert!(sched.request_realtime(&req, ms(0)).unwrap().is_admitted());
    let after = sched.calculate_priority(&ctx, 1);
    assert!(after.realtime_override);
    assert_eq!(after.priority, PriorityLevel::MAX);
}

#[test]
fn test_all_predictors_unavailable_yields_default() {
    let config = quiet_config(1).with_default_priority(PriorityLevel::new(33));
    let sched = SchedulerBuilder::new(config)
        .with_predictor(Box::new(Silent(PredictorKind::Priority)))
        .with_predictor(Box::new(Silent(PredictorKind::Temporal)))
        .with_predictor(Box::new(Silent(PredictorKind::Contextual)))
        .with_predictor(Box::new(Silent(PredictorKind::Policy)))
        .build()
        .unwrap();
    let ctx = TaskContext::new(TaskId::new(1)).with_usage(&[0.3, 0.4]);
    let calc = sched.calculate_priority(&ctx, 0);
    assert!(calc.degraded);
    assert_eq!(calc.priority, PriorityLevel::new(33));
    assert_eq!(sched.stats().degraded, 1);
}

#[test]
fn test_classification_is_idempotent() {
    let sched = init(SchedConfig::new(1)).unwrap();
    let contexts = [
        TaskContext::new(TaskId::new(1)),
        TaskContext::new(TaskId::new(2)).with_usage(&[0.9, 0.95, 0.85]),
        TaskContext::new(TaskId::new(3)).with_io_wait(0.8),
        TaskContext::new(TaskId::new(4)).with_deadline(ms(50)),
        TaskContext::new(TaskId::new(5)).with_usage(&[0.2, 0.2, 0.2]),
    ];
    for ctx in &contexts {
        let first = sched.classify(ctx);
        for _ in 0..4 {
            assert_eq!(sched.classify(ctx), first);
        }
    }
    assert_eq!(sched.classify(&contexts[3]), WorkloadClass::RealTime);
    assert_eq!(sched.classify(&contexts[0]), WorkloadClass::Unknown);
}

#[test]
fn test_no_candidates_means_idle() {
    let sched = init(SchedConfig::new(2)).unwrap();
    assert_eq!(sched.select_next(0, &[]), None);
    assert_eq!(sched.tick(1, ms(1)), None);

    let pinned_away = TaskContext::new(TaskId::new(1))
        .with_affinity(helix_sched::CpuMask::single(1));
    assert_eq!(sched.select_next(0, &[pinned_away]), None);
    assert_eq!(sched.stats().idle_picks, 3);
}

#[test]
fn test_quantum_always_within_bounds() {
    let bounds = QuantumConfig::default();
    for raw in [-3.0, 0.0, 0.25, 1.0, 7.5, 1e300, f64::NAN, f64::NEG_INFINITY] {
        let sched = SchedulerBuilder::new(quiet_config(1))
            .with_predictor(Box::new(RawQuantum(raw)))
            .build()
            .unwrap();
        let candidates = [
            TaskContext::new(TaskId::new(1)).with_usage(&[0.1, 0.1, 0.1]),
            TaskContext::new(TaskId::new(2)).with_usage(&[1.0, 1.0, 1.0]),
            TaskContext::new(TaskId::new(3)).with_io_wait(0.9),
        ];
        for ctx in &candidates {
            let sel = sched.select_next(0, std::slice::from_ref(ctx)).unwrap();
            assert!(
                sel.quantum >= bounds.floor && sel.quantum <= bounds.ceiling,
                "raw {} gave {}",
                raw,
                sel.quantum
            );
        }
    }
}

#[test]
fn test_admission_at_exact_bound() {
    let sched = init(SchedConfig::new(2)).unwrap();
    let full = RealtimeRequest::new(TaskId::new(1), 0, ms(95), ms(100));
    assert!(sched.request_realtime(&full, ms(0)).unwrap().is_admitted());
    assert!((sched.realtime().utilization(0) - 0.95).abs() < 1e-9);

    let tiny = RealtimeRequest::new(TaskId::new(2), 0, Nanoseconds::new(1), ms(100));
    let err = sched.request_realtime(&tiny, ms(0)).unwrap_err();
    assert!(matches!(err, SchedError::AdmissionRejected { .. }));
    assert_eq!(err.errno(), ENOSPC);
    assert_eq!(sched.realtime().reserved_count(0), 1);

    let zero = RealtimeRequest::new(TaskId::new(3), 0, Nanoseconds::ZERO, ms(100));
    assert!(sched.request_realtime(&zero, ms(0)).unwrap().is_admitted());

    let stats = sched.stats();
    assert_eq!(stats.rt_admitted, 2);
    assert_eq!(stats.rt_rejected, 1);
}

#[test]
fn test_failed_step_does_not_abort_plan() {
    let balancer = LoadBalancer::new(Default::default());
    let entries = (0..5)
        .map(|i| MigrationEntry::new(TaskId::new(i), 0, 1, 0.1, 0.125))
        .collect();
    let step = FailOnCall {
        calls: Mutex::new(0),
        fail_on: 3,
    };
    let report = balancer.execute(MigrationPlan::from_entries(entries), &step);
    assert_eq!(*step.calls.lock().unwrap(), 5);
    assert_eq!(report.succeeded(), 4);
    let errors: Vec<SchedError> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        SchedError::MigrationStepFailed {
            reason: MigrationFailure::LockTimeout,
            ..
        }
    ));
}

#[test]
fn test_end_to_end_priority_ordering() {
    let scores = TableScores {
        scores: [(1, 0.9), (2, 0.5), (3, 0.5)].into_iter().collect(),
    };
    let sched = SchedulerBuilder::new(quiet_config(1))
        .with_predictor(Box::new(scores))
        .build()
        .unwrap();

    let a = TaskContext::new(TaskId::new(1)).with_wait(ms(3), Nanoseconds::ZERO);
    let b = TaskContext::new(TaskId::new(2)).with_wait(ms(1), Nanoseconds::ZERO);
    let c = TaskContext::new(TaskId::new(3)).with_wait(ms(2), Nanoseconds::ZERO);
    sched.enqueue(0, c, ms(3)).unwrap();
    sched.enqueue(0, b, ms(3)).unwrap();
    sched.enqueue(0, a, ms(3)).unwrap();

    let mut order = Vec::new();
    let mut now = ms(4);
    while let Some(sel) = sched.tick(0, now) {
        order.push(sel.task.raw());
        sched.report_run(0, &sel, ms(1));
        sched.remove_task(sel.task).unwrap();
        now = now + ms(1);
    }
    assert_eq!(order, vec![1, 2, 3]);
}

#[test]
fn test_placement_failure_rolls_back_once_in_reverse() {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let config = SchedConfig::new(4).with_topology(NumaTopology::uniform(1, 2, 20));
    let err = SchedulerBuilder::new(config)
        .with_predictor(Box::new(Counting(shutdowns.clone())))
        .build()
        .unwrap_err();

    assert_eq!(err.stage, InitStage::PlacementOptimizer);
    assert_eq!(
        err.rolled_back,
        vec![
            InitStage::DeadlineManager,
            InitStage::Classifier,
            InitStage::Predictors
        ]
    );
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_tears_down_once() {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let sched = SchedulerBuilder::new(SchedConfig::new(2))
        .with_predictor(Box::new(Counting(shutdowns.clone())))
        .build()
        .unwrap();
    let order = shutdown(sched);
    assert_eq!(order.first(), Some(&InitStage::LoadBalancer));
    assert_eq!(order.last(), Some(&InitStage::Predictors));
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

    let dropped = Arc::new(AtomicUsize::new(0));
    {
        let _sched = SchedulerBuilder::new(SchedConfig::new(1))
            .with_predictor(Box::new(Counting(dropped.clone())))
            .build()
            .unwrap();
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}
