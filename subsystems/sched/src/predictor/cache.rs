//! Result cache for deferred predictors.

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use super::{LatencyClass, Outcome, Predictor, PredictorKind, Score, TaskPredictor};
use crate::context::TaskContext;
use crate::error::{PredictorUnavailable, UnavailableReason};
use crate::types::TaskId;

/// Wraps a [`LatencyClass::Deferred`] predictor for use on the tick path.
///
/// The inner predictor only runs from [`Predictor::refresh`], which the
/// scheduler calls on the balancer cadence. `predict` serves the last valid
/// result per task and never waits for the cache lock.
pub struct CachedPredictor {
    inner: Box<TaskPredictor>,
    cache: Mutex<HashMap<TaskId, Score>>,
    /// Lookups served from the cache
    hits: AtomicU64,
    /// Lookups that found nothing or lost the lock
    misses: AtomicU64,
}

impl CachedPredictor {
    /// Wrap `inner`
    pub fn new(inner: Box<TaskPredictor>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached entries
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    #[inline]
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl core::fmt::Debug for CachedPredictor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CachedPredictor")
            .field("kind", &self.inner.kind())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

impl Predictor<TaskContext> for CachedPredictor {
    fn kind(&self) -> PredictorKind {
        self.inner.kind()
    }

    fn latency(&self) -> LatencyClass {
        LatencyClass::Bounded
    }

    fn predict(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
        let Some(cache) = self.cache.try_lock() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(PredictorUnavailable::new(self.kind(), UnavailableReason::Contended));
        };
        match cache.get(&ctx.task) {
            Some(score) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(*score)
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(PredictorUnavailable::new(self.kind(), UnavailableReason::NotCached))
            },
        }
    }

    fn refresh(&self, ctx: &TaskContext) {
        // A failed refresh keeps the previous valid result
        if let Ok(score) = self.inner.predict(ctx).and_then(|s| s.checked(self.kind())) {
            self.cache.lock().insert(ctx.task, score);
        }
    }

    fn observe(&self, outcome: &Outcome) {
        self.inner.observe(outcome);
    }

    fn forget(&self, task: TaskId) {
        self.cache.lock().remove(&task);
        self.inner.forget(task);
    }

    fn shutdown(&self) {
        self.cache.lock().clear();
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    struct Slow;

    impl Predictor<TaskContext> for Slow {
        fn kind(&self) -> PredictorKind {
            PredictorKind::Temporal
        }

        fn latency(&self) -> LatencyClass {
            LatencyClass::Deferred
        }

        fn predict(&self, ctx: &TaskContext) -> Result<Score, PredictorUnavailable> {
            if ctx.nice > 0 {
                return Ok(Score::new(7.0, 1.0));
            }
            Ok(Score::new(0.75, 0.9))
        }
    }

    #[test]
    fn test_serves_only_refreshed_results() {
        let cached = CachedPredictor::new(Box::new(Slow));
        let ctx = TaskContext::new(TaskId::new(1));
        let err = cached.predict(&ctx).unwrap_err();
        assert_eq!(err.reason, UnavailableReason::NotCached);

        cached.refresh(&ctx);
        assert_eq!(cached.predict(&ctx).unwrap(), Score::new(0.75, 0.9));
        assert_eq!(cached.hit_stats(), (1, 1));
        assert_eq!(cached.latency(), LatencyClass::Bounded);
    }

    #[test]
    fn test_invalid_refresh_keeps_previous() {
        let cached = CachedPredictor::new(Box::new(Slow));
        let ctx = TaskContext::new(TaskId::new(2));
        cached.refresh(&ctx);
        cached.refresh(&ctx.with_nice(5));
        assert_eq!(cached.predict(&ctx).unwrap().value, 0.75);
    }

    #[test]
    fn test_contended_cache_is_unavailable() {
        let cached = CachedPredictor::new(Box::new(Slow));
        let ctx = TaskContext::new(TaskId::new(3));
        cached.refresh(&ctx);
        let _held = cached.cache.lock();
        let err = cached.predict(&ctx).unwrap_err();
        assert_eq!(err.reason, UnavailableReason::Contended);
    }

    #[test]
    fn test_forget_and_shutdown() {
        let cached = CachedPredictor::new(Box::new(Slow));
        cached.refresh(&TaskContext::new(TaskId::new(1)));
        cached.refresh(&TaskContext::new(TaskId::new(2)));
        cached.forget(TaskId::new(1));
        assert_eq!(cached.len(), 1);
        cached.shutdown();
        assert!(cached.is_empty());
    }
}
