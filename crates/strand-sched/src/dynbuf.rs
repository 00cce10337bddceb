use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use strand_buf::Buffer;
use tracing::trace;

use crate::{Scheduler, TaskRef};

/// Budgeted buffer allocation with a wait queue.
///
/// Muxes draw their io buffers from here; when the process-wide budget is
/// exhausted the caller parks its tasklet and is woken as soon as any
/// buffer is released.
pub struct DynBuf {
    sched: Arc<Scheduler>,
    buf_size: usize,
    /// Max live buffers; 0 means unlimited.
    limit: u32,
    in_use: AtomicU32,
    wait_list: spin::Mutex<VecDeque<TaskRef>>,
}

impl DynBuf {
    pub fn new(sched: Arc<Scheduler>, buf_size: usize, limit: u32) -> Arc<Self> {
        Arc::new(Self {
            sched,
            buf_size,
            limit,
            in_use: AtomicU32::new(0),
            wait_list: spin::Mutex::new(VecDeque::new()),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Takes a buffer if the budget allows.
    pub fn alloc(&self) -> Option<Buffer> {
        loop {
            let cur = self.in_use.load(Ordering::Relaxed);
            if self.limit != 0 && cur >= self.limit {
                return None;
            }
            if self
                .in_use
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(Buffer::with_capacity(self.buf_size));
            }
        }
    }

    /// Returns a buffer to the budget and retries one parked waiter.
    pub fn release(&self, buf: Buffer) {
        drop(buf);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.offer(1);
    }

    /// Parks `tasklet` until a buffer may be available again. Duplicate
    /// parks of the same tasklet are collapsed.
    pub fn wait(&self, tasklet: &TaskRef) {
        let mut wl = self.wait_list.lock();
        if !wl.iter().any(|t| Arc::ptr_eq(t, tasklet)) {
            wl.push_back(tasklet.clone());
        }
    }

    /// Wakes up to `n` waiters, FIFO.
    pub fn offer(&self, n: usize) {
        let mut woken = Vec::with_capacity(n);
        {
            let mut wl = self.wait_list.lock();
            for _ in 0..n {
                match wl.pop_front() {
                    Some(t) => woken.push(t),
                    None => break,
                }
            }
        }
        for t in woken {
            trace!("buffer available, waking waiter");
            self.sched.tasklet_wakeup(&t);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{SchedThread, SchedTune, TaskAction};

    #[test]
    fn budget_and_wait_queue() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let db = DynBuf::new(sched.clone(), 1024, 2);

        let a = db.alloc().unwrap();
        let b = db.alloc().unwrap();
        assert!(db.alloc().is_none(), "budget exhausted");

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let tl = sched.tasklet_new(0, Arc::new(move |_t: &TaskRef, _s: u32| {
            h.fetch_add(1, Ordering::Relaxed);
            TaskAction::Keep
        }));
        db.wait(&tl);
        db.wait(&tl);

        db.release(a);
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 1, "woken exactly once");
        assert!(db.alloc().is_some());
        db.release(b);
    }

    #[test]
    fn unlimited_when_zero() {
        let sched = Scheduler::new(1, SchedTune::default());
        let db = DynBuf::new(sched, 64, 0);
        let bufs: Vec<_> = (0..100).map(|_| db.alloc().unwrap()).collect();
        assert_eq!(db.in_use(), 100);
        for b in bufs {
            db.release(b);
        }
        assert_eq!(db.in_use(), 0);
    }
}
