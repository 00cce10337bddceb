mod activity;
mod dynbuf;
mod fd;
mod pool;
mod poller;
mod sched;
mod task;
mod tree;

pub use activity::Activity;
pub use dynbuf::DynBuf;
pub use fd::{
    DEAD_FD_MAGIC, FdEntry, FdFlags, FdHandler, FdTab, ev, fdstate,
};
pub use pool::{Pool, PoolBox, PoolRegistry, registry as pool_registry, size_class};
pub use poller::{EpollPoller, PollPoller, Poller, best_poller};
pub use sched::{SchedThread, SchedTune, Scheduler};
pub use task::{
    ActRet, TL_BULK, TL_CLASSES, TL_NORMAL, TL_URGENT, Task, TaskAction, TaskFn, TaskRef, state,
};
pub use tree::{WrapTree, node_key};

/// Threads are identified by a bit in a 64-bit mask.
pub const MAX_THREADS: usize = 64;

#[inline]
pub const fn tid_bit(tid: usize) -> u64 {
    1u64 << tid
}

/// "Not an engine thread" marker for [`cur_tid`].
pub(crate) const TID_UNBOUND: usize = usize::MAX;

thread_local! {
    static CUR_TID: std::cell::Cell<usize> = const { std::cell::Cell::new(TID_UNBOUND) };
}

/// Declares the calling thread's engine id. Workers call this once at boot;
/// the pool caches and the scheduler's local-queue fast paths key off it.
pub fn bind_thread_tid(tid: usize) {
    assert!(tid < MAX_THREADS);
    CUR_TID.with(|c| c.set(tid));
}

#[inline]
pub(crate) fn cur_tid() -> usize {
    CUR_TID.with(std::cell::Cell::get)
}
