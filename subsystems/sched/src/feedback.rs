//! Lock-free outcome queue between the tick path and the predictors.
//!
//! The tick path pushes [`Outcome`]s without blocking; when the queue is full
//! the outcome is dropped and counted. Dispatcher calls drain a bounded batch
//! once the backlog reaches [`FEEDBACK_DRAIN_MARK`]; the balancer drains
//! whatever is left on its own cadence.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use heapless::mpmc::MpMcQueue;
use static_assertions::const_assert;

use crate::predictor::Outcome;

/// Queue capacity (power of two, below the u8 index limit)
pub const FEEDBACK_CAPACITY: usize = 128;

/// Backlog at which dispatcher calls start draining
pub const FEEDBACK_DRAIN_MARK: usize = FEEDBACK_CAPACITY / 4;

const_assert!(FEEDBACK_CAPACITY.is_power_of_two());
const_assert!(FEEDBACK_DRAIN_MARK > 0 && FEEDBACK_DRAIN_MARK < FEEDBACK_CAPACITY);

/// Bounded multi-producer multi-consumer outcome queue
pub struct FeedbackQueue {
    queue: MpMcQueue<Outcome, FEEDBACK_CAPACITY>,
    pushed: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl FeedbackQueue {
    /// Empty queue
    pub const fn new() -> Self {
        Self {
            queue: MpMcQueue::new(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Push an outcome; returns `false` if it was dropped
    #[inline]
    pub fn push(&self, outcome: Outcome) -> bool {
        match self.queue.enqueue(outcome) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            },
        }
    }

    /// Hand queued outcomes to `sink`, at most one queue's worth per call
    pub fn drain<F: FnMut(&Outcome)>(&self, sink: F) -> usize {
        self.drain_up_to(FEEDBACK_CAPACITY, sink)
    }

    /// Hand at most `max` queued outcomes to `sink`
    pub fn drain_up_to<F: FnMut(&Outcome)>(&self, max: usize, mut sink: F) -> usize {
        let mut n = 0;
        while n < max {
            let Some(outcome) = self.queue.dequeue() else {
                break;
            };
            sink(&outcome);
            n += 1;
        }
        self.delivered.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Outcomes accepted
    #[inline]
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Accepted outcomes not yet delivered
    #[inline]
    pub fn pending(&self) -> u64 {
        self.pushed().saturating_sub(self.delivered())
    }

    /// Outcomes dropped because the queue was full
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Outcomes delivered to predictors
    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Default for FeedbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FeedbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackQueue")
            .field("pushed", &self.pushed())
            .field("dropped", &self.dropped())
            .field("delivered", &self.delivered())
            .finish()
    }
}
