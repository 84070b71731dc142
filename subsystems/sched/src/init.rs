//! # Initialization Guards
//!
//! Components are constructed in [`InitStage::ORDER`]. Each constructed
//! component is covered by a [`StageGuard`] until the whole chain commits.
//! If a later stage fails, the guards go out of scope in reverse declaration
//! order and each tears its component down exactly once:
//!
//! ```text
//! predictors ─► classifier ─► deadline ─► placement ✗
//!      ▲             ▲            │
//!      └─────────────┴────────────┘  teardown, newest first
//! ```
//!
//! Every teardown is written to a shared [`TeardownLog`], which becomes
//! [`InitError::rolled_back`](crate::error::InitError).

extern crate alloc;

use alloc::vec::Vec;

use spin::Mutex;

use crate::error::InitStage;

// ============================================================================
// TEARDOWN LOG
// ============================================================================

/// Stages torn down so far, in teardown order
#[derive(Debug, Default)]
pub struct TeardownLog {
    stages: Mutex<Vec<InitStage>>,
}

impl TeardownLog {
    /// Empty log
    pub const fn new() -> Self {
        Self {
            stages: Mutex::new(Vec::new()),
        }
    }

    /// Record a teardown; returns `false` if the stage was already torn down
    pub fn record(&self, stage: InitStage) -> bool {
        let mut stages = self.stages.lock();
        if stages.contains(&stage) {
            return false;
        }
        stages.push(stage);
        true
    }

    /// Has `stage` been torn down?
    pub fn contains(&self, stage: InitStage) -> bool {
        self.stages.lock().contains(&stage)
    }

    /// Copy of the teardown order
    pub fn stages(&self) -> Vec<InitStage> {
        self.stages.lock().clone()
    }
}

// ============================================================================
// STAGE GUARD
// ============================================================================

/// Tears one constructed stage down on drop unless disarmed
pub struct StageGuard<'a, F: FnOnce()> {
    stage: InitStage,
    log: &'a TeardownLog,
    undo: Option<F>,
}

impl<'a, F: FnOnce()> StageGuard<'a, F> {
    /// Arm a guard for a constructed stage
    pub fn new(stage: InitStage, log: &'a TeardownLog, undo: F) -> Self {
        log::debug!("sched: {} constructed", stage.name());
        Self {
            stage,
            log,
            undo: Some(undo),
        }
    }

    /// Stage covered by this guard
    #[inline(always)]
    pub fn stage(&self) -> InitStage {
        self.stage
    }

    /// Keep the component: the chain committed
    pub fn disarm(mut self) {
        self.undo = None;
    }
}

impl<F: FnOnce()> Drop for StageGuard<'_, F> {
    fn drop(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        if self.log.record(self.stage) {
            undo();
            log::info!("sched: {} rolled back", self.stage.name());
        }
    }
}

impl<F: FnOnce()> core::fmt::Debug for StageGuard<'_, F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StageGuard")
            .field("stage", &self.stage)
            .field("armed", &self.undo.is_some())
            .finish()
    }
}
