use std::sync::atomic::{AtomicU64, Ordering};

/// Per-thread event counters exposed to embedders.
///
/// Updates are relaxed single-writer increments from the owning thread;
/// readers may observe slightly stale values, which is fine for a stats
/// surface.
#[derive(Debug, Default)]
pub struct Activity {
    /// Connections torn down after a transport error.
    pub conn_dead: AtomicU64,
    /// Scheduler entered with nothing runnable.
    pub empty_rq: AtomicU64,
    /// Scheduler left with work still pending (budget exhausted).
    pub long_rq: AtomicU64,
    /// Tasks migrated from a runqueue tree into the local lists.
    pub tasksw: AtomicU64,
    /// Task/tasklet executions.
    pub ctxsw: AtomicU64,
    /// Failed pool allocations.
    pub pool_fail: AtomicU64,
}

impl Activity {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> [u64; 6] {
        [
            self.conn_dead.load(Ordering::Relaxed),
            self.empty_rq.load(Ordering::Relaxed),
            self.long_rq.load(Ordering::Relaxed),
            self.tasksw.load(Ordering::Relaxed),
            self.ctxsw.load(Ordering::Relaxed),
            self.pool_fail.load(Ordering::Relaxed),
        ]
    }
}
