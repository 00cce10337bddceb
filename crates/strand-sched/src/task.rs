use std::sync::{
    Arc,
    atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use strand_timing::Tick;

/// Tasklet classes, walked in index order by the scheduler.
pub const TL_URGENT: usize = 0;
pub const TL_NORMAL: usize = 1;
pub const TL_BULK: usize = 2;
pub const TL_CLASSES: usize = 3;

/// The reserved nice value marking a tasklet.
pub const TASKLET_NICE: i16 = -32768;

/// Task state bits, all living in one machine word so the whole scheduling
/// discipline is CAS on a single atomic.
pub mod state {
    pub const RUNNING: u32 = 0x0001;
    /// Task sits in the global runqueue tree.
    pub const GLOBAL: u32 = 0x0002;
    pub const QUEUED: u32 = 0x0004;
    /// Timer lives in the shared (multi-thread) wait queue.
    pub const SHARED_WQ: u32 = 0x0008;
    /// Tasklet keeps waking itself; demoted to the bulk class.
    pub const SELF_WAKING: u32 = 0x0010;
    pub const KILLED: u32 = 0x0020;
    /// Tasklet is linked in a per-thread list.
    pub const IN_LIST: u32 = 0x0040;
    /// Long-running task; may be rate limited by embedders.
    pub const HEAVY: u32 = 0x0080;

    pub const WOKEN_INIT: u32 = 0x0100;
    pub const WOKEN_TIMER: u32 = 0x0200;
    pub const WOKEN_IO: u32 = 0x0400;
    pub const WOKEN_SIGNAL: u32 = 0x0800;
    pub const WOKEN_MSG: u32 = 0x1000;
    pub const WOKEN_RES: u32 = 0x2000;
    pub const WOKEN_OTHER: u32 = 0x4000;
    pub const WOKEN_ANY: u32 = 0x7F00;
}

/// What the process callback wants done with its task afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAction {
    /// Requeue by woken bits or expiry date as usual.
    Keep,
    /// The task is finished; the scheduler drops it.
    Destroy,
}

/// Verdict of an action handler, inspected by the machinery that invoked it.
/// `Abort` and `Deny` are distinct on purpose; the rule layer discriminates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActRet {
    Continue,
    Stop,
    Yield,
    Done,
    Deny,
    Abort,
    Error,
    Invalid,
}

pub type TaskFn = dyn Fn(&TaskRef, u32) -> TaskAction + Send + Sync;

pub type TaskRef = Arc<Task>;

/// A schedulable unit. Tasks carry a timer and a nice bias and travel
/// through the runqueue trees; tasklets (nice == -32768) have neither and
/// go straight to the per-thread class lists.
pub struct Task {
    pub(crate) state: AtomicU32,
    /// Expiry `Tick`; 0 = never.
    pub(crate) expire: AtomicU32,
    pub(crate) nice: i16,
    pub(crate) thread_mask: AtomicU64,
    /// Owning thread for local-tree membership and tasklet pinning.
    pub(crate) tid: AtomicUsize,
    pub(crate) calls: AtomicU32,
    pub(crate) process: spin::Mutex<Option<Arc<TaskFn>>>,
    /// Node handle in a runqueue tree, 0 when absent.
    pub(crate) rq_node: AtomicU64,
    /// Node handle in a timer tree, 0 when absent.
    pub(crate) wq_node: AtomicU64,
    /// Intrusive link for the shared tasklet list.
    pub(crate) shared_next: AtomicPtr<Task>,
}

impl Task {
    pub(crate) fn alloc(thread_mask: u64, nice: i16, process: Arc<TaskFn>) -> TaskRef {
        Arc::new(Task {
            state: AtomicU32::new(0),
            expire: AtomicU32::new(0),
            nice,
            thread_mask: AtomicU64::new(thread_mask),
            tid: AtomicUsize::new(usize::MAX),
            calls: AtomicU32::new(0),
            process: spin::Mutex::new(Some(process)),
            rq_node: AtomicU64::new(0),
            wq_node: AtomicU64::new(0),
            shared_next: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    #[inline]
    pub fn is_tasklet(&self) -> bool {
        self.nice == TASKLET_NICE
    }

    #[inline]
    pub fn nice(&self) -> i16 {
        self.nice
    }

    #[inline]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn expire(&self) -> Tick {
        Tick(self.expire.load(Ordering::Relaxed))
    }

    /// Sets the timer date; takes effect at the next `task_queue`.
    #[inline]
    pub fn set_expire(&self, t: Tick) {
        self.expire.store(t.0, Ordering::Relaxed);
    }

    #[inline]
    pub fn thread_mask(&self) -> u64 {
        self.thread_mask.load(Ordering::Relaxed)
    }

    /// Marks the heavy-workload hint.
    pub fn set_heavy(&self) {
        self.state.fetch_or(state::HEAVY, Ordering::AcqRel);
    }

    pub(crate) fn take_process(&self) -> Option<Arc<TaskFn>> {
        self.process.lock().clone()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &format_args!("{:#x}", self.state.load(Ordering::Relaxed)))
            .field("nice", &self.nice)
            .field("expire", &self.expire.load(Ordering::Relaxed))
            .finish()
    }
}

/// Multi-producer, single-beheader list feeding cross-thread tasklet
/// wakeups.
///
/// Pushes CAS the head of an intrusive stack; `behead` detaches the whole
/// chain at once and restores FIFO order. The `IN_LIST` state bit guarantees
/// single membership, so `shared_next` is exclusively owned between a
/// successful push and the behead that consumes it.
#[derive(Default)]
pub(crate) struct SharedList {
    head: AtomicPtr<Task>,
}

impl SharedList {
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn push(&self, t: TaskRef) {
        let p = Arc::into_raw(t) as *mut Task;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*p).shared_next.store(head, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(head, p, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(h) => head = h,
            }
        }
    }

    /// Detaches everything, oldest first.
    pub(crate) fn behead(&self) -> Vec<TaskRef> {
        let mut p = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let mut out = Vec::new();
        while !p.is_null() {
            let next = unsafe { (*p).shared_next.load(Ordering::Relaxed) };
            out.push(unsafe { Arc::from_raw(p) });
            p = next;
        }
        out.reverse();
        out
    }
}

impl Drop for SharedList {
    fn drop(&mut self) {
        let _ = self.behead();
    }
}
