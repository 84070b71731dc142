//! # Scheduler Context
//!
//! Owns every component and exposes the dispatcher, lifecycle and
//! init/teardown surface.
//!
//! ```text
//!                    tick(cpu, now)
//!                          │
//!      ┌───────────────────┼──────────────────────┐
//!      ▼                   ▼                      ▼
//!  deadlines         run queue (local)      classifier
//!                          │                      │
//!                          ▼                      ▼
//!                   priority engine ◄──── predictor set
//!                          │
//!                          ▼
//!                 selection engine ──► (task, quantum)
//!
//!                  on_tick(tick, now)   every interval_ticks
//!                          │
//!     feedback drain ─► plan ─► placement filter ─► execute ─► report
//! ```
//!
//! There is no global instance: the caller owns the [`SchedulerContext`]
//! returned by [`init`] and shares it by reference across CPUs.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::balancer::{LoadBalancer, MigrationPlan, MigrationReport, SystemLoad};
use crate::classifier::{WorkloadClass, WorkloadClassifier};
use crate::clock::{Clock, ManualClock};
use crate::config::SchedConfig;
use crate::context::{TaskAccount, TaskContext, TaskContextAnalyzer};
use crate::deadline::{DeadlineMiss, RealtimeDecision, RealtimeManager, RealtimeRequest};
use crate::error::{InitError, InitStage, SchedError, SchedResult};
use crate::init::{StageGuard, TeardownLog};
use crate::numa::NumaTopology;
use crate::placement::PlacementOptimizer;
use crate::predictor::{LoadPredictor, Outcome, PredictorSet, TaskPredictor};
use crate::priority::{PriorityCalculation, PriorityEngine};
use crate::runqueue::{QueueMigrator, QueuedTask, RunQueueSet};
use crate::selection::{estimate_switch_cost, Selection, SelectionCriteria, SelectionEngine};
use crate::stats::{SchedStats, StatsSnapshot};
use crate::types::{CpuId, CpuMask, Nanoseconds, TaskId};

// ============================================================================
// BUILDER
// ============================================================================

/// Builds a [`SchedulerContext`] with custom predictors or a clock
pub struct SchedulerBuilder {
    config: SchedConfig,
    predictors: Vec<Box<TaskPredictor>>,
    load: Option<Box<LoadPredictor>>,
    clock: Option<Box<dyn Clock>>,
}

impl SchedulerBuilder {
    /// Builder for `config`
    pub fn new(config: SchedConfig) -> Self {
        Self {
            config,
            predictors: Vec::new(),
            load: None,
            clock: None,
        }
    }

    /// Install a task predictor, replacing the built-in one of its kind
    pub fn with_predictor(mut self, predictor: Box<TaskPredictor>) -> Self {
        self.predictors.push(predictor);
        self
    }

    /// Install the load-evolution predictor
    pub fn with_load_predictor(mut self, predictor: Box<LoadPredictor>) -> Self {
        self.load = Some(predictor);
        self
    }

    /// Time source for admission and migration budgets.
    ///
    /// Without one the budgets are never exceeded.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Construct every component in order.
    ///
    /// On failure the stages already built are torn down newest first and
    /// listed in [`InitError::rolled_back`].
    pub fn build(self) -> Result<SchedulerContext, InitError> {
        let teardown = TeardownLog::new();
        self.construct(&teardown).map_err(|e| {
            let e = e.with_rollback(teardown.stages());
            log::error!("sched: {}", e);
            e
        })
    }

    fn construct(self, teardown: &TeardownLog) -> Result<SchedulerContext, InitError> {
        let Self {
            config,
            predictors: custom,
            load,
            clock,
        } = self;
        config.validate()?;
        let cpu_count = config.cpu_count;

        let mut predictors = PredictorSet::from_config(&config);
        for predictor in custom {
            predictors.add(predictor);
        }
        if let Some(load) = load {
            predictors.set_load(load);
        }
        if !predictors.has_fused() {
            log::warn!("sched: no fused predictor installed, priorities run degraded");
        }
        let predictors_guard =
            StageGuard::new(InitStage::Predictors, teardown, || predictors.shutdown());

        let classifier = WorkloadClassifier::new(config.classifier);
        let classifier_guard = StageGuard::new(InitStage::Classifier, teardown, || {});

        let realtime = RealtimeManager::new(cpu_count, config.realtime);
        let realtime_guard =
            StageGuard::new(InitStage::DeadlineManager, teardown, || realtime.shutdown());

        let topology = config
            .topology
            .clone()
            .unwrap_or_else(|| NumaTopology::single_node(cpu_count));
        let placement = PlacementOptimizer::new(topology, cpu_count, config.placement)?;
        let placement_guard = StageGuard::new(InitStage::PlacementOptimizer, teardown, || {});

        let balancer = LoadBalancer::new(config.balancer);
        let balancer_guard = StageGuard::new(InitStage::LoadBalancer, teardown, || {});

        balancer_guard.disarm();
        placement_guard.disarm();
        realtime_guard.disarm();
        classifier_guard.disarm();
        predictors_guard.disarm();

        log::info!(
            "sched: initialized {} cpu(s) on {} node(s), predictors {:?}",
            cpu_count,
            placement.topology().node_count(),
            predictors
        );

        Ok(SchedulerContext {
            analyzer: TaskContextAnalyzer::new(placement.cpu_nodes().to_vec()),
            priority: PriorityEngine::new(config.default_priority),
            selection: SelectionEngine::new(config.quantum),
            queues: RunQueueSet::new(cpu_count, config.balancer.lock_spin_limit),
            clock: clock.unwrap_or_else(|| Box::new(ManualClock::new(Nanoseconds::ZERO))),
            stats: SchedStats::new(),
            torn_down: AtomicBool::new(false),
            config,
            predictors,
            classifier,
            realtime,
            placement,
            balancer,
        })
    }
}

impl core::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("custom_predictors", &self.predictors.len())
            .field("load_predictor", &self.load.is_some())
            .field("clock", &self.clock.is_some())
            .finish()
    }
}

/// Initialize a scheduler with the built-in predictors
pub fn init(config: SchedConfig) -> Result<SchedulerContext, InitError> {
    SchedulerBuilder::new(config).build()
}

/// Tear a scheduler down; returns the stages in teardown order
pub fn shutdown(context: SchedulerContext) -> Vec<InitStage> {
    context.teardown()
}

// ============================================================================
// CONTEXT
// ============================================================================

/// A running scheduler core
pub struct SchedulerContext {
    config: SchedConfig,
    clock: Box<dyn Clock>,
    predictors: PredictorSet,
    classifier: WorkloadClassifier,
    realtime: RealtimeManager,
    placement: PlacementOptimizer,
    balancer: LoadBalancer,
    analyzer: TaskContextAnalyzer,
    priority: PriorityEngine,
    selection: SelectionEngine,
    queues: RunQueueSet,
    stats: SchedStats,
    torn_down: AtomicBool,
}

impl SchedulerContext {
    /// Configuration in effect
    #[inline(always)]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Predictor set
    #[inline(always)]
    pub fn predictors(&self) -> &PredictorSet {
        &self.predictors
    }

    /// Real-time manager
    #[inline(always)]
    pub fn realtime(&self) -> &RealtimeManager {
        &self.realtime
    }

    /// Placement optimizer
    #[inline(always)]
    pub fn placement(&self) -> &PlacementOptimizer {
        &self.placement
    }

    /// Run queues
    #[inline(always)]
    pub fn queues(&self) -> &RunQueueSet {
        &self.queues
    }

    /// Priority engine
    #[inline(always)]
    pub fn priority_engine(&self) -> &PriorityEngine {
        &self.priority
    }

    // ------------------------------------------------------------------------
    // Context, classification, priority
    // ------------------------------------------------------------------------

    /// Snapshot a task account
    #[inline]
    pub fn capture(&self, account: &TaskAccount, now: Nanoseconds) -> TaskContext {
        self.analyzer.capture(account, now)
    }

    /// Workload class of a snapshot
    #[inline]
    pub fn classify(&self, ctx: &TaskContext) -> WorkloadClass {
        self.classifier.classify(ctx)
    }

    /// Priority of `ctx` for running on `cpu`
    pub fn calculate_priority(&self, ctx: &TaskContext, cpu: CpuId) -> PriorityCalculation {
        let class = self.classify(ctx);
        self.calculate(ctx, cpu, class)
    }

    fn calculate(&self, ctx: &TaskContext, cpu: CpuId, class: WorkloadClass) -> PriorityCalculation {
        let admitted = self
            .realtime
            .reservation(cpu, ctx.task)
            .is_some_and(|r| r.state.is_active());
        let calc = self.priority.calculate(
            ctx,
            cpu,
            class,
            admitted,
            &self.predictors,
            &self.placement,
        );
        if calc.degraded {
            SchedStats::bump(&self.stats.degraded);
        }
        if calc.realtime_override {
            SchedStats::bump(&self.stats.realtime_overrides);
        }
        calc
    }

    fn criteria_for(&self, ctx: &TaskContext, cpu: CpuId) -> SelectionCriteria {
        let class = self.classify(ctx);
        let calc = self.calculate(ctx, cpu, class);
        let mut criteria = SelectionCriteria::new(*ctx, calc.priority, class)
            .with_switch_cost(estimate_switch_cost(ctx, cpu, &self.placement));
        criteria.runnable = ctx.affinity.contains(cpu);
        if calc.realtime_override {
            if let Some(r) = self.realtime.reservation(cpu, ctx.task) {
                criteria = criteria.with_rt_budget(r.budget_remaining);
            }
        }
        criteria
    }

    // ------------------------------------------------------------------------
    // Dispatcher
    // ------------------------------------------------------------------------

    /// Pick the next task among `candidates` for `cpu`.
    ///
    /// Candidates whose affinity excludes `cpu` are never picked. `None`
    /// means the CPU should idle.
    pub fn select_next(&self, cpu: CpuId, candidates: &[TaskContext]) -> Option<Selection> {
        let criteria: Vec<SelectionCriteria> = candidates
            .iter()
            .map(|ctx| self.criteria_for(ctx, cpu))
            .collect();
        let Some(selection) = self.selection.select_next(&criteria, &self.predictors) else {
            SchedStats::bump(&self.stats.idle_picks);
            log::trace!("sched: cpu {} idle", cpu);
            return None;
        };
        SchedStats::bump(&self.stats.selections);
        if selection.priority.is_realtime() {
            self.realtime.mark_running(cpu, selection.task);
        }
        self.priority.report(Outcome::Selection {
            task: selection.task,
            class: selection.class,
            priority: selection.priority,
            selected: true,
        });
        #[cfg(feature = "trace-tick")]
        log::trace!(
            "sched: cpu {} -> {} ({}, {})",
            cpu,
            selection.task,
            selection.priority,
            selection.quantum
        );
        Some(selection)
    }

    /// Scheduling tick for `cpu`: deadline check, then selection from the
    /// CPU's own run queue. Errors are logged, never returned.
    ///
    /// A feedback backlog past the drain mark is delivered in one bounded
    /// batch after the pick.
    pub fn tick(&self, cpu: CpuId, now: Nanoseconds) -> Option<Selection> {
        if let Err(e) = self.check_deadlines(cpu, now) {
            log::error!("sched: cpu {}: {}", cpu, e);
        }
        let candidates: Vec<TaskContext> = {
            let queue = self.queues.lock(cpu).ok()?;
            queue.tasks().iter().map(|t| t.context.aged(now)).collect()
        };
        let selection = self.select_next(cpu, &candidates);
        if let Ok(mut queue) = self.queues.lock(cpu) {
            let current = selection.map(|s| s.task).filter(|t| queue.contains(*t));
            queue.set_current(current);
        }
        self.priority.relieve_feedback(&self.predictors);
        selection
    }

    /// A selected task stopped after running for `ran`
    pub fn report_run(&self, cpu: CpuId, selection: &Selection, ran: Nanoseconds) {
        if self.realtime.charge(cpu, selection.task, ran).is_some() {
            self.sync_pins(cpu);
        }
        self.priority.report(Outcome::Run {
            task: selection.task,
            class: selection.class,
            ran,
            quantum: selection.quantum,
        });
        if let Ok(mut queue) = self.queues.lock(cpu) {
            if queue.current() == Some(selection.task) {
                queue.set_current(None);
            }
        }
        self.priority.relieve_feedback(&self.predictors);
    }

    /// Balancer cadence hook; runs a full pass when one is due
    pub fn on_tick(&self, tick: u64, now: Nanoseconds) -> Option<MigrationReport> {
        if !self.balancer.claim(tick) {
            return None;
        }
        SchedStats::bump(&self.stats.balance_passes);
        let delivered = self.priority.deliver_feedback(&self.predictors);
        self.refresh_predictions(now);
        let plan = self.plan_migrations(now);
        let report = self.execute_plan(plan);
        log::debug!(
            "sched: balance pass at tick {}: {} outcome(s) delivered, {} moved, {} failed",
            tick,
            delivered,
            report.succeeded(),
            report.failed()
        );
        Some(report)
    }

    fn refresh_predictions(&self, now: Nanoseconds) {
        for cpu in 0..self.queues.cpu_count() as CpuId {
            for entry in self.queues.tasks_on(cpu) {
                self.predictors.refresh(&entry.context.aged(now));
            }
        }
    }

    /// Snapshot load, plan migrations and run them through the placement
    /// filter
    pub fn plan_migrations(&self, now: Nanoseconds) -> MigrationPlan {
        let system = SystemLoad::capture(&self.queues, self.config.balancer.load_scale);
        let plan = self.balancer.plan_migrations(&system, &self.predictors, |cpu, task| {
            self.realtime.reservation(cpu, task).is_some()
        });
        SchedStats::add(&self.stats.migrations_planned, plan.len() as u64);
        let context_of = |task: TaskId| {
            system
                .tasks
                .iter()
                .flatten()
                .find(|t| t.task == task)
                .map(|t| t.context.aged(now))
        };
        let plan = self.placement.filter(plan, context_of, now);
        SchedStats::add(&self.stats.migrations_filtered, plan.rejected as u64);
        plan
    }

    /// Execute a plan entry by entry and report the results
    pub fn execute_plan(&self, plan: MigrationPlan) -> MigrationReport {
        let migrator = QueueMigrator::new(
            &self.queues,
            self.clock.as_ref(),
            self.config.balancer.migration_budget,
        );
        let report = self.balancer.execute(plan, &migrator);
        self.balancer.report(&report, &self.predictors);
        SchedStats::add(&self.stats.migrations_executed, report.succeeded() as u64);
        SchedStats::add(&self.stats.migrations_failed, report.failed() as u64);
        report
    }

    // ------------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------------

    /// Queue (or requeue) a task on `cpu` with a fresh snapshot.
    ///
    /// A task holding a real-time reservation may only be queued on its
    /// reserved CPU.
    pub fn enqueue(&self, cpu: CpuId, ctx: TaskContext, now: Nanoseconds) -> SchedResult<()> {
        let reserved = self.realtime.reserved_cpu(ctx.task);
        if reserved.is_some_and(|r| r != cpu) {
            return Err(SchedError::InvalidArgument {
                field: "cpu",
                reason: "real-time task is pinned to its reserved cpu",
            });
        }
        let previous = self.queues.find(ctx.task);
        let mut entry = QueuedTask::from_context(ctx, now);
        entry.realtime = reserved.is_some();
        self.queues.enqueue(cpu, entry)?;
        if let Some(prev) = previous.filter(|&p| p != cpu) {
            self.queues.dequeue(prev, ctx.task);
        }
        Ok(())
    }

    /// Remove a task from its queue, release any reservation and drop its
    /// cached predictions
    pub fn remove_task(&self, task: TaskId) -> SchedResult<()> {
        let removed = self
            .queues
            .find(task)
            .and_then(|cpu| self.queues.dequeue(cpu, task));
        let released = match self.realtime.complete(task) {
            Ok(()) => true,
            Err(SchedError::UnknownTask(_)) => false,
            Err(e) => return Err(e),
        };
        if removed.is_none() && !released {
            return Err(SchedError::UnknownTask(task));
        }
        self.predictors.forget(task);
        Ok(())
    }

    /// Bring a CPU online or take it offline.
    ///
    /// Going offline moves every unpinned task to the least loaded online
    /// CPU its affinity allows. Returns the number of tasks moved.
    pub fn set_cpu_online(&self, cpu: CpuId, online: bool) -> SchedResult<usize> {
        self.queues.set_online(cpu, online)?;
        if online {
            log::info!("sched: cpu {} online", cpu);
            return Ok(0);
        }
        self.queues.lock(cpu)?.set_current(None);

        let mut moved = 0;
        for entry in self.queues.tasks_on(cpu) {
            if entry.realtime {
                log::warn!("sched: {} stays pinned to offline cpu {}", entry.task, cpu);
                continue;
            }
            let Some(target) = self.least_loaded(entry.affinity, cpu) else {
                log::warn!("sched: no online cpu accepts {}", entry.task);
                continue;
            };
            match self.queues.migrate(
                entry.task,
                cpu,
                target,
                self.clock.as_ref(),
                self.config.balancer.migration_budget,
            ) {
                Ok(()) => moved += 1,
                Err(reason) => log::warn!(
                    "sched: evacuating {} from cpu {} failed: {}",
                    entry.task,
                    cpu,
                    reason.name()
                ),
            }
        }
        log::info!("sched: cpu {} offline, {} task(s) moved", cpu, moved);
        Ok(moved)
    }

    fn least_loaded(&self, affinity: CpuMask, except: CpuId) -> Option<CpuId> {
        self.queues
            .snapshot()
            .into_iter()
            .filter(|s| s.online && s.cpu != except && affinity.contains(s.cpu))
            .min_by(|a, b| a.demand.total_cmp(&b.demand).then(a.cpu.cmp(&b.cpu)))
            .map(|s| s.cpu)
    }

    // ------------------------------------------------------------------------
    // Real-time
    // ------------------------------------------------------------------------

    /// Request a real-time reservation.
    ///
    /// An admitted task is pinned to the requested CPU; if it is queued
    /// elsewhere it moves there.
    pub fn request_realtime(
        &self,
        request: &RealtimeRequest,
        now: Nanoseconds,
    ) -> SchedResult<RealtimeDecision> {
        let queued = self.queues.find(request.task);
        if let Some(cpu) = queued {
            let allowed = self
                .queues
                .lock(cpu)?
                .get(request.task)
                .map(|e| e.affinity.contains(request.cpu))
                .unwrap_or(true);
            if !allowed {
                return Err(SchedError::InvalidArgument {
                    field: "cpu",
                    reason: "outside task affinity",
                });
            }
        }

        let decision = match self.realtime.request(request, now, self.clock.as_ref()) {
            Ok(decision) => decision,
            Err(e) => {
                if matches!(e, SchedError::AdmissionRejected { .. }) {
                    SchedStats::bump(&self.stats.rt_rejected);
                }
                return Err(e);
            },
        };
        SchedStats::bump(&self.stats.rt_admitted);

        if let Some(from) = queued {
            let entry = if from != request.cpu {
                self.queues.dequeue(from, request.task)
            } else {
                self.queues.lock(from)?.remove(request.task)
            };
            if let Some(mut entry) = entry {
                entry.realtime = true;
                self.queues.lock(request.cpu)?.push(entry);
            }
        }
        Ok(decision)
    }

    /// Release a task's reservation
    pub fn complete_realtime(&self, task: TaskId) -> SchedResult<()> {
        let cpu = self.realtime.reserved_cpu(task);
        self.realtime.complete(task)?;
        if let Some(cpu) = cpu {
            self.sync_pins(cpu);
        }
        Ok(())
    }

    /// Report reservations on `cpu` that missed their deadline
    pub fn check_deadlines(&self, cpu: CpuId, now: Nanoseconds) -> SchedResult<Vec<DeadlineMiss>> {
        let before = self.realtime.reserved_count(cpu);
        let result = self.realtime.check_deadlines(cpu, now);
        let missed = match &result {
            Ok(misses) => misses.len(),
            Err(_) => before.saturating_sub(self.realtime.reserved_count(cpu)),
        };
        if missed > 0 {
            SchedStats::add(&self.stats.deadline_misses, missed as u64);
            self.sync_pins(cpu);
        }
        result
    }

    /// Clear the pin on queued tasks that lost their reservation
    fn sync_pins(&self, cpu: CpuId) {
        let Ok(mut queue) = self.queues.lock(cpu) else {
            return;
        };
        let stale: Vec<TaskId> = queue
            .tasks()
            .iter()
            .filter(|t| t.realtime && self.realtime.reservation(cpu, t.task).is_none())
            .map(|t| t.task)
            .collect();
        for task in stale {
            if let Some(entry) = queue.get_mut(task) {
                entry.realtime = false;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Statistics and teardown
    // ------------------------------------------------------------------------

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.priority.feedback().dropped())
    }

    fn teardown(&self) -> Vec<InitStage> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let mut order = Vec::with_capacity(InitStage::ORDER.len());
        for stage in InitStage::ORDER.iter().rev().copied() {
            match stage {
                InitStage::DeadlineManager => self.realtime.shutdown(),
                InitStage::Predictors => self.predictors.shutdown(),
                _ => {},
            }
            log::info!("sched: {} torn down", stage.name());
            order.push(stage);
        }
        order
    }
}

impl Drop for SchedulerContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl core::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("cpus", &self.config.cpu_count)
            .field("predictors", &self.predictors)
            .field("torn_down", &self.torn_down.load(Ordering::Relaxed))
            .finish()
    }
}
