//! # Helix Predictive Scheduler Core
//!
//! Prediction-driven process scheduling for multi-core Helix kernels.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        SCHEDULER CONTEXT                             │
//! │                                                                      │
//! │   tick path (per CPU, bounded)          balancer path (periodic)     │
//! │   ─────────────────────────────         ─────────────────────────    │
//! │   context snapshot                      feedback drain               │
//! │        │                                load snapshot                │
//! │        ▼                                     │                       │
//! │   classifier ──► priority engine             ▼                       │
//! │                      │   ▲             load-evolution projection     │
//! │                      │   │                   │                       │
//! │                      │   predictors          ▼                       │
//! │                      ▼                  migration plan               │
//! │               selection engine               │                       │
//! │                      │                 placement filter              │
//! │                      ▼                       │                       │
//! │              (task, quantum)                 ▼                       │
//! │                                      per-entry execution             │
//! │                                                                      │
//! │   deadline manager: admission, budgets, miss detection               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Module        | Role                                                  |
//! |---------------|-------------------------------------------------------|
//! | `predictor`   | Scoring interface, built-in predictors, caching       |
//! | `context`     | Task snapshots and accounting                         |
//! | `priority`    | Confidence-weighted fusion, RT override, finalization |
//! | `classifier`  | Workload classes and their policies                   |
//! | `selection`   | Next-task pick and quantum sizing                     |
//! | `deadline`    | Real-time admission and deadline tracking             |
//! | `placement`   | NUMA/cache-aware adjustments and migration costs      |
//! | `balancer`    | Load projection, migration planning and execution     |
//! | `runqueue`    | Per-CPU run queues and ordered pair locking           |
//! | `scheduler`   | Init/teardown and the dispatcher surface              |
//!
//! ## Example
//!
//! ```ignore
//! let sched = helix_sched::init(SchedConfig::new(4))?;
//! sched.enqueue(0, sched.capture(&account, now), now)?;
//! if let Some(sel) = sched.tick(0, now) {
//!     // run sel.task for sel.quantum, then:
//!     sched.report_run(0, &sel, ran);
//! }
//! sched.on_tick(tick, now);
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod balancer;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod context;
pub mod deadline;
pub mod error;
pub mod feedback;
pub mod init;
pub mod math;
pub mod numa;
pub mod placement;
pub mod predictor;
pub mod priority;
pub mod runqueue;
pub mod scheduler;
pub mod selection;
pub mod stats;
pub mod types;

pub use balancer::{CpuLoad, LoadBalancer, MigrationEntry, MigrationPlan, MigrationReport, MigrationStep};
pub use classifier::{ClassPolicy, WorkloadClass, WorkloadClassifier};
pub use clock::{Clock, ManualClock};
pub use config::{DeadlineMissPolicy, PredictorSelection, SchedConfig};
pub use context::{TaskAccount, TaskContext, TaskContextAnalyzer};
pub use deadline::{DeadlineMiss, RealtimeDecision, RealtimeManager, RealtimeRequest, RtState};
pub use error::{InitError, InitStage, MigrationFailure, PredictorUnavailable, SchedError, SchedResult};
pub use numa::NumaTopology;
pub use placement::PlacementOptimizer;
pub use predictor::{LatencyClass, Outcome, Predictor, PredictorKind, PredictorSet, Score};
pub use priority::{PriorityCalculation, PriorityEngine};
pub use scheduler::{init, shutdown, SchedulerBuilder, SchedulerContext};
pub use selection::{Selection, SelectionCriteria, SelectionEngine};
pub use stats::StatsSnapshot;
pub use types::{CpuId, CpuMask, Nanoseconds, NodeId, PriorityLevel, TaskId};
