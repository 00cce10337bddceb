use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use strand_timing::{TIMER_LOOK_BACK, Tick, now_ms};
use strand_utils::safe_assert;
use tracing::trace;

use crate::{
    Activity, MAX_THREADS, TID_UNBOUND, cur_tid,
    fd::{FdHandler, FdTab},
    poller::Poller,
    task::{
        SharedList, TASKLET_NICE, TL_BULK, TL_CLASSES, TL_NORMAL, TL_URGENT, Task, TaskAction,
        TaskFn, TaskRef, state,
    },
    tid_bit,
    tree::{WrapTree, node_key},
};

/// Scheduler tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct SchedTune {
    /// Items processed per scheduler pass, and the nice scaling base.
    pub runqueue_depth: u32,
    /// Preempt lower classes as soon as higher-priority work shows up.
    pub low_latency: bool,
}

impl Default for SchedTune {
    fn default() -> Self {
        Self { runqueue_depth: 200, low_latency: false }
    }
}

struct LocalCtx {
    rqueue: WrapTree<TaskRef>,
    rqueue_size: u32,
    timers: WrapTree<TaskRef>,
    tasklets: [VecDeque<TaskRef>; TL_CLASSES],
    tl_class_mask: u8,
    current: Option<TaskRef>,
}

impl LocalCtx {
    fn new() -> Self {
        Self {
            rqueue: WrapTree::new(),
            rqueue_size: 0,
            timers: WrapTree::new(),
            tasklets: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            tl_class_mask: 0,
            current: None,
        }
    }
}

struct ThreadCtx {
    /// Owner-thread-only state, reached through short-lived scoped borrows.
    local: UnsafeCell<LocalCtx>,
    shared_list: SharedList,
    /// Tasks currently parked in this thread's class lists.
    task_list_size: AtomicU32,
    wake_pipe_r: i32,
    wake_pipe_w: i32,
}

// `local` is only dereferenced by the thread bound to this slot.
unsafe impl Sync for ThreadCtx {}

fn make_wake_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let r = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(r, 0, "wake pipe creation failed");
    for fd in fds {
        unsafe {
            let fl = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
            let fdfl = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, fdfl | libc::FD_CLOEXEC);
        }
    }
    (fds[0], fds[1])
}

/// The process-wide scheduler: per-thread queues plus the global trees work
/// gets stolen from.
pub struct Scheduler {
    tune: SchedTune,
    nbthread: usize,
    threads: Box<[ThreadCtx]>,
    global_rq: spin::Mutex<WrapTree<TaskRef>>,
    global_rqueue_size: AtomicU32,
    global_wq: spin::RwLock<WrapTree<TaskRef>>,
    rqueue_ticks: AtomicU32,
    tasks_run_queue: AtomicU32,
    nb_tasks: AtomicU32,
    niced_tasks: AtomicU32,
    global_tasks_mask: AtomicU64,
    sleeping_thread_mask: AtomicU64,
    activity: Box<[Activity]>,
}

impl Scheduler {
    pub fn new(nbthread: usize, tune: SchedTune) -> Arc<Self> {
        assert!(nbthread >= 1 && nbthread <= MAX_THREADS);
        Arc::new(Self {
            tune,
            nbthread,
            threads: (0..nbthread)
                .map(|_| {
                    let (r, w) = make_wake_pipe();
                    ThreadCtx {
                        local: UnsafeCell::new(LocalCtx::new()),
                        shared_list: SharedList::default(),
                        task_list_size: AtomicU32::new(0),
                        wake_pipe_r: r,
                        wake_pipe_w: w,
                    }
                })
                .collect(),
            global_rq: spin::Mutex::new(WrapTree::new()),
            global_rqueue_size: AtomicU32::new(0),
            global_wq: spin::RwLock::new(WrapTree::new()),
            rqueue_ticks: AtomicU32::new(0),
            tasks_run_queue: AtomicU32::new(0),
            nb_tasks: AtomicU32::new(0),
            niced_tasks: AtomicU32::new(0),
            global_tasks_mask: AtomicU64::new(0),
            sleeping_thread_mask: AtomicU64::new(0),
            activity: (0..nbthread).map(|_| Activity::default()).collect(),
        })
    }

    pub fn nbthread(&self) -> usize {
        self.nbthread
    }

    pub fn tune(&self) -> &SchedTune {
        &self.tune
    }

    pub fn activity(&self, tid: usize) -> &Activity {
        &self.activity[tid]
    }

    /// Total schedulable items: runqueue trees plus class lists.
    pub fn tasks_run_queue(&self) -> u32 {
        self.tasks_run_queue.load(Ordering::Relaxed)
    }

    pub fn nb_tasks(&self) -> u32 {
        self.nb_tasks.load(Ordering::Relaxed)
    }

    /// Scoped access to a thread's local queues. Only the owning thread may
    /// call this; the borrow must not outlive `f`, which is what keeps the
    /// aliasing discipline honest across reentrant scheduler calls.
    fn with_local<R>(&self, tid: usize, f: impl FnOnce(&mut LocalCtx) -> R) -> R {
        f(unsafe { &mut *self.threads[tid].local.get() })
    }

    // -- construction ------------------------------------------------------

    /// A timer-carrying task runnable on every thread of `thread_mask`.
    pub fn task_new(&self, thread_mask: u64, nice: i16, process: Arc<TaskFn>) -> TaskRef {
        assert!(nice != TASKLET_NICE, "use tasklet_new");
        assert!((-1024..=1024).contains(&i32::from(nice)));
        let t = Task::alloc(thread_mask, nice, process);
        if thread_mask.count_ones() > 1 {
            t.state.fetch_or(state::SHARED_WQ, Ordering::Relaxed);
        } else {
            t.tid.store(thread_mask.trailing_zeros() as usize, Ordering::Relaxed);
        }
        self.nb_tasks.fetch_add(1, Ordering::Relaxed);
        t
    }

    /// A lightweight timer-less item pinned to `tid`.
    pub fn tasklet_new(&self, tid: usize, process: Arc<TaskFn>) -> TaskRef {
        let t = Task::alloc(tid_bit(tid), TASKLET_NICE, process);
        t.tid.store(tid, Ordering::Relaxed);
        self.nb_tasks.fetch_add(1, Ordering::Relaxed);
        t
    }

    // -- wakeups -----------------------------------------------------------

    /// Records the wake reason and queues the task unless it is already
    /// queued or running (those pick the new bits up on their own).
    pub fn task_wakeup(&self, t: &TaskRef, reason: u32) {
        safe_assert!(!t.is_tasklet());
        t.state.fetch_or(reason & state::WOKEN_ANY, Ordering::AcqRel);
        let mut s = t.state.load(Ordering::Acquire);
        while s & (state::RUNNING | state::QUEUED) == 0 {
            match t.state.compare_exchange_weak(
                s,
                s | state::QUEUED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.enqueue_rq(t);
                    return;
                }
                Err(ns) => s = ns,
            }
        }
    }

    /// Inserts into a runqueue tree at the next insertion position biased by
    /// nice: the local tree when the task belongs solely to this thread,
    /// the shared one otherwise.
    fn enqueue_rq(&self, t: &TaskRef) {
        let tmask = t.thread_mask();
        let cur = cur_tid();
        let local = cur != TID_UNBOUND && tmask == tid_bit(cur);

        self.tasks_run_queue.fetch_add(1, Ordering::Relaxed);
        let mut key = self.rqueue_ticks.fetch_add(1, Ordering::Relaxed);
        if t.nice() != 0 {
            self.niced_tasks.fetch_add(1, Ordering::Relaxed);
            let offset = i64::from(t.nice()) * i64::from(self.tune.runqueue_depth);
            key = key.wrapping_add(offset as u32);
        }

        if local {
            self.with_local(cur, |ctx| {
                let node = ctx.rqueue.insert(key, t.clone());
                t.rq_node.store(node, Ordering::Relaxed);
                ctx.rqueue_size += 1;
            });
        } else {
            let mut rq = self.global_rq.lock();
            self.global_tasks_mask.fetch_or(tmask, Ordering::AcqRel);
            let node = rq.insert(key, t.clone());
            t.rq_node.store(node, Ordering::Relaxed);
            t.state.fetch_or(state::GLOBAL, Ordering::AcqRel);
            self.global_rqueue_size.fetch_add(1, Ordering::Relaxed);
        }

        // if every thread able to run it sleeps, kick one of them
        let sleeping = self.sleeping_thread_mask.load(Ordering::Acquire);
        let eligible = tmask & self.all_threads_mask();
        if eligible != 0 && eligible & sleeping == eligible {
            let others = if cur == TID_UNBOUND { eligible } else { eligible & !tid_bit(cur) };
            let pick = if others != 0 { others } else { eligible };
            self.wake_thread(pick.trailing_zeros() as usize);
        }
    }

    fn all_threads_mask(&self) -> u64 {
        if self.nbthread == MAX_THREADS { u64::MAX } else { (1u64 << self.nbthread) - 1 }
    }

    /// Wakes a tasklet: guarantees single list membership via `IN_LIST`,
    /// then queues locally or hands off through the owner's shared list.
    pub fn tasklet_wakeup(&self, t: &TaskRef) {
        safe_assert!(t.is_tasklet());
        let mut s = t.state.load(Ordering::Acquire);
        loop {
            if s & state::IN_LIST != 0 {
                return;
            }
            match t.state.compare_exchange_weak(
                s,
                s | state::IN_LIST,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(ns) => s = ns,
            }
        }

        let target = t.tid.load(Ordering::Relaxed);
        if target == cur_tid() {
            let self_waking = self.with_local(target, |ctx| {
                s & state::SELF_WAKING != 0
                    || ctx.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, t))
            });
            self.with_local(target, |ctx| {
                if self_waking {
                    t.state.fetch_or(state::SELF_WAKING, Ordering::AcqRel);
                    ctx.tasklets[TL_BULK].push_back(t.clone());
                    ctx.tl_class_mask |= 1 << TL_BULK;
                } else {
                    ctx.tasklets[TL_URGENT].push_back(t.clone());
                    ctx.tl_class_mask |= 1 << TL_URGENT;
                }
            });
            self.tasks_run_queue.fetch_add(1, Ordering::Relaxed);
        } else {
            self.threads[target].shared_list.push(t.clone());
            self.tasks_run_queue.fetch_add(1, Ordering::Relaxed);
            self.wake_if_sleeping(target);
        }
    }

    /// Flags `t` for destruction and rushes it through the owner's shared
    /// list, bypassing priority scheduling. Not idempotent: one killer only.
    pub fn task_kill(&self, t: &TaskRef) {
        safe_assert!(!t.is_tasklet());
        let mut s = t.state.load(Ordering::Acquire);
        loop {
            safe_assert!(s & state::KILLED == 0);
            while s & (state::RUNNING | state::QUEUED) != 0 {
                // already on its way to execution; the run loop will reap it
                match t.state.compare_exchange_weak(
                    s,
                    s | state::KILLED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(ns) => s = ns,
                }
            }
            match t.state.compare_exchange_weak(
                s,
                s | state::QUEUED | state::KILLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let thr = t.thread_mask().trailing_zeros() as usize;
                    self.threads[thr].shared_list.push(t.clone());
                    self.tasks_run_queue.fetch_add(1, Ordering::Relaxed);
                    self.threads[thr].task_list_size.fetch_add(1, Ordering::Relaxed);
                    self.wake_if_sleeping(thr);
                    return;
                }
                Err(ns) => s = ns,
            }
        }
    }

    /// Releases a task that is no longer wanted. Deferred when queued or
    /// running: the scheduler reaps it on dequeue or at exit.
    pub fn task_destroy(&self, t: &TaskRef) {
        *t.process.lock() = None;
        let s = t.state.fetch_or(state::KILLED, Ordering::AcqRel);
        if s & (state::QUEUED | state::RUNNING) == 0 {
            self.reap(t);
        }
    }

    /// Drops bookkeeping for a dead task.
    fn reap(&self, t: &TaskRef) {
        self.unlink_wq(t);
        *t.process.lock() = None;
        self.nb_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    // -- timers ------------------------------------------------------------

    /// (Re)queues by the task's expiry date. A stale, later tree position is
    /// left alone; the expiry walk fixes it up lazily.
    pub fn task_queue(&self, t: &TaskRef) {
        let exp = t.expire();
        if !exp.is_set() {
            return;
        }
        let node = t.wq_node.load(Ordering::Relaxed);
        if node != 0 && !exp.is_lt(Tick(node_key(node))) {
            return;
        }

        if t.state.load(Ordering::Relaxed) & state::SHARED_WQ != 0 {
            let mut wq = self.global_wq.write();
            if node != 0 {
                wq.remove(node);
            }
            let n = wq.insert(exp.0, t.clone());
            t.wq_node.store(n, Ordering::Relaxed);
        } else {
            let tid = t.tid.load(Ordering::Relaxed);
            safe_assert!(tid == cur_tid(), "local wait queue touched off-thread");
            self.with_local(tid, |ctx| {
                if node != 0 {
                    ctx.timers.remove(node);
                }
                let n = ctx.timers.insert(exp.0, t.clone());
                t.wq_node.store(n, Ordering::Relaxed);
            });
        }
    }

    pub fn unlink_wq(&self, t: &TaskRef) {
        let node = t.wq_node.swap(0, Ordering::Relaxed);
        if node == 0 {
            return;
        }
        if t.state.load(Ordering::Relaxed) & state::SHARED_WQ != 0 {
            self.global_wq.write().remove(node);
        } else {
            let tid = t.tid.load(Ordering::Relaxed);
            self.with_local(tid, |ctx| {
                ctx.timers.remove(node);
            });
        }
    }

    fn wake_thread(&self, tid: usize) {
        self.sleeping_thread_mask.fetch_and(!tid_bit(tid), Ordering::AcqRel);
        let b = [0u8; 1];
        unsafe { libc::write(self.threads[tid].wake_pipe_w, b.as_ptr().cast(), 1) };
    }

    fn wake_if_sleeping(&self, tid: usize) {
        if self.sleeping_thread_mask.load(Ordering::Acquire) & tid_bit(tid) != 0 {
            self.wake_thread(tid);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for t in self.threads.iter() {
            unsafe {
                libc::close(t.wake_pipe_r);
                libc::close(t.wake_pipe_w);
            }
        }
    }
}

/// Drains the wake pipe when the poller reports it readable.
struct WakePipeHandler;

impl FdHandler for WakePipeHandler {
    fn io_event(&self, fd: i32) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

/// A scheduler bound to the calling thread. The handle is not `Send`, so
/// local-queue access stays single-threaded by construction.
pub struct SchedThread {
    sched: Arc<Scheduler>,
    tid: usize,
    _not_send: PhantomData<*mut ()>,
}

impl SchedThread {
    pub fn bind(sched: Arc<Scheduler>, tid: usize) -> Self {
        assert!(tid < sched.nbthread);
        crate::bind_thread_tid(tid);
        Self { sched, tid, _not_send: PhantomData }
    }

    pub fn sched(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Registers this thread's wake pipe with the fd table so cross-thread
    /// wakeups interrupt the poller.
    pub fn register_wake_pipe(&self, tab: &FdTab) {
        let fd = self.sched.threads[self.tid].wake_pipe_r;
        tab.insert(fd, fd as u64, Arc::new(WakePipeHandler), tid_bit(self.tid));
        tab.want_recv(fd);
    }

    pub fn thread_has_tasks(&self) -> bool {
        let (mask, rq) =
            self.sched.with_local(self.tid, |ctx| (ctx.tl_class_mask, ctx.rqueue_size));
        mask != 0
            || rq > 0
            || self.sched.global_tasks_mask.load(Ordering::Acquire) & tid_bit(self.tid) != 0
            || !self.sched.threads[self.tid].shared_list.is_empty()
    }

    // -- timer side --------------------------------------------------------

    /// Pops expired entries, fixing up stale positions along the way, and
    /// wakes their tasks with the TIMER reason.
    pub fn wake_expired_tasks(&self) {
        let sched = &self.sched;
        let now = now_ms();
        let mut max_processed = i64::from(sched.tune.runqueue_depth);

        enum Walk {
            Fire(TaskRef),
            Requeued,
            Done,
        }

        while max_processed > 0 {
            max_processed -= 1;
            let step = sched.with_local(self.tid, |ctx| {
                let Some((node, t)) = ctx.timers.lookup_ge(now.0.wrapping_sub(TIMER_LOOK_BACK))
                else {
                    return Walk::Done;
                };
                let t = t.clone();
                let key = Tick(node_key(node));
                let exp = t.expire();
                if exp.is_expired(now) {
                    ctx.timers.remove(node);
                    t.wq_node.store(0, Ordering::Relaxed);
                    Walk::Fire(t)
                } else if exp != key {
                    // deferred requeue: position went stale when the expiry
                    // was pushed back
                    ctx.timers.remove(node);
                    t.wq_node.store(0, Ordering::Relaxed);
                    if exp.is_set() {
                        let n = ctx.timers.insert(exp.0, t.clone());
                        t.wq_node.store(n, Ordering::Relaxed);
                    }
                    Walk::Requeued
                } else {
                    Walk::Done
                }
            });
            match step {
                Walk::Fire(t) => sched.task_wakeup(&t, state::WOKEN_TIMER),
                Walk::Requeued => continue,
                Walk::Done => break,
            }
        }

        // global tree: cheap read-side check before taking the write lock
        {
            let wq = sched.global_wq.read();
            match wq.lookup_ge(now.0.wrapping_sub(TIMER_LOOK_BACK)) {
                Some((node, _)) if Tick(node_key(node)).is_le(now) => {}
                _ => return,
            }
        }

        while max_processed > 0 {
            max_processed -= 1;
            let fire = {
                let mut wq = sched.global_wq.write();
                let Some((node, t)) = wq.lookup_ge(now.0.wrapping_sub(TIMER_LOOK_BACK)) else {
                    break;
                };
                let t = t.clone();
                let key = Tick(node_key(node));
                let exp = t.expire();
                if exp.is_expired(now) {
                    wq.remove(node);
                    t.wq_node.store(0, Ordering::Relaxed);
                    Some(t)
                } else if exp != key {
                    wq.remove(node);
                    t.wq_node.store(0, Ordering::Relaxed);
                    if exp.is_set() {
                        let n = wq.insert(exp.0, t.clone());
                        t.wq_node.store(n, Ordering::Relaxed);
                    }
                    None
                } else {
                    break;
                }
            };
            if let Some(t) = fire {
                sched.task_wakeup(&t, state::WOKEN_TIMER);
            }
        }
    }

    /// Earliest timer over the local and global trees; possibly slightly in
    /// the past when a stale position has not been fixed up yet.
    pub fn next_timer_expiry(&self) -> Tick {
        let now = now_ms();
        let mut ret = self.sched.with_local(self.tid, |ctx| {
            ctx.timers
                .lookup_ge(now.0.wrapping_sub(TIMER_LOOK_BACK))
                .map_or(Tick::ETERNITY, |(node, _)| Tick(node_key(node)))
        });
        let wq = self.sched.global_wq.read();
        if let Some((node, _)) = wq.lookup_ge(now.0.wrapping_sub(TIMER_LOOK_BACK)) {
            ret = ret.first(Tick(node_key(node)));
        }
        ret
    }

    // -- run side ----------------------------------------------------------

    /// One scheduler pass: migrate runqueue work into the class lists, fold
    /// in cross-thread wakeups, then execute under per-class budgets.
    pub fn process_runnable_tasks(&self) {
        let sched = &self.sched;
        let tid = self.tid;
        let bit = tid_bit(tid);

        if !self.thread_has_tasks() {
            Activity::bump(&sched.activity[tid].empty_rq);
            return;
        }

        let mut max_processed = i64::from(sched.tune.runqueue_depth);
        if sched.niced_tasks.load(Ordering::Relaxed) > 0 {
            max_processed = (max_processed + 3) / 4;
        }

        loop {
            let mut max = [0u32; TL_CLASSES];
            let (class_mask, rqueue_size) =
                sched.with_local(tid, |ctx| (ctx.tl_class_mask, ctx.rqueue_size));

            // urgent ~50%, normal ~37%, bulk ~13%, granted only to classes
            // with work
            if class_mask & (1 << TL_URGENT) != 0 || !sched.threads[tid].shared_list.is_empty() {
                max[TL_URGENT] = 64;
            }
            if class_mask & (1 << TL_NORMAL) != 0
                || rqueue_size > 0
                || sched.global_tasks_mask.load(Ordering::Acquire) & bit != 0
            {
                max[TL_NORMAL] = 48;
            }
            if class_mask & (1 << TL_BULK) != 0 {
                max[TL_BULK] = 16;
            }

            let max_total: u32 = max.iter().sum();
            if max_total == 0 {
                return;
            }
            for m in &mut max {
                *m = (max_processed as u32 * *m).div_ceil(max_total);
            }

            self.pick_from_runqueues(max[TL_NORMAL]);

            // fold cross-thread wakeups into the urgent class
            let beheaded = sched.threads[tid].shared_list.behead();
            if !beheaded.is_empty() {
                sched.with_local(tid, |ctx| {
                    for t in beheaded {
                        ctx.tasklets[TL_URGENT].push_back(t);
                    }
                    ctx.tl_class_mask |= 1 << TL_URGENT;
                });
            }

            let done = self.run_tasks_from_lists(&mut max);
            max_processed -= i64::from(done);

            if max_processed > 0 && self.thread_has_tasks() {
                continue;
            }
            break;
        }

        if self.sched.with_local(tid, |ctx| ctx.tl_class_mask) != 0 {
            Activity::bump(&sched.activity[tid].long_rq);
        }
    }

    /// Migrates up to `budget` tasks from the local and global runqueue
    /// trees into the NORMAL class list, most urgent key first.
    fn pick_from_runqueues(&self, budget: u32) {
        let sched = &self.sched;
        let tid = self.tid;
        let bit = tid_bit(tid);
        let start = sched.rqueue_ticks.load(Ordering::Relaxed).wrapping_sub(TIMER_LOOK_BACK);

        let mut grq = None;

        while sched.threads[tid].task_list_size.load(Ordering::Relaxed) < budget {
            if sched.global_tasks_mask.load(Ordering::Acquire) & bit != 0 && grq.is_none() {
                grq = Some(sched.global_rq.lock());
            }

            let lcand = sched.with_local(tid, |ctx| {
                ctx.rqueue.walk_from(start).next().map(|(n, t)| (n, t.clone()))
            });
            let gcand = grq.as_ref().and_then(|g| {
                g.walk_from(start)
                    .find(|(_, t)| t.thread_mask() & bit != 0)
                    .map(|(n, t)| (n, t.clone()))
            });

            let (node, t, global) = match (&lcand, &gcand) {
                (None, None) => break,
                (Some((ln, lt)), None) => (*ln, lt.clone(), false),
                (None, Some((gn, gt))) => (*gn, gt.clone(), true),
                (Some((ln, lt)), Some((gn, gt))) => {
                    let lk = node_key(*ln);
                    let gk = node_key(*gn);
                    if (lk.wrapping_sub(gk) as i32) <= 0 {
                        (*ln, lt.clone(), false)
                    } else {
                        (*gn, gt.clone(), true)
                    }
                }
            };

            if global {
                let g = grq.as_mut().unwrap();
                g.remove(node);
                t.rq_node.store(0, Ordering::Relaxed);
                t.state.fetch_and(!state::GLOBAL, Ordering::AcqRel);
                sched.global_rqueue_size.fetch_sub(1, Ordering::Relaxed);
                if !g.walk_from(start).any(|(_, t)| t.thread_mask() & bit != 0) {
                    sched.global_tasks_mask.fetch_and(!bit, Ordering::AcqRel);
                }
            } else {
                sched.with_local(tid, |ctx| {
                    ctx.rqueue.remove(node);
                    ctx.rqueue_size -= 1;
                });
                t.rq_node.store(0, Ordering::Relaxed);
            }
            if t.nice() != 0 {
                sched.niced_tasks.fetch_sub(1, Ordering::Relaxed);
            }

            sched.with_local(tid, |ctx| {
                ctx.tasklets[TL_NORMAL].push_back(t);
                ctx.tl_class_mask |= 1 << TL_NORMAL;
            });
            sched.threads[tid].task_list_size.fetch_add(1, Ordering::Relaxed);
            Activity::bump(&sched.activity[tid].tasksw);
        }
    }

    /// Executes the class lists under `budgets`, preempting to a more
    /// urgent class in low-latency mode. Returns entries processed.
    fn run_tasks_from_lists(&self, budgets: &mut [u32; TL_CLASSES]) -> u32 {
        let sched = &self.sched;
        let tid = self.tid;
        let bit = tid_bit(tid);
        let mut budget_mask: u8 = (1 << TL_CLASSES) - 1;
        let mut done = 0u32;
        let mut queue = 0usize;

        while queue < TL_CLASSES {
            let (class_mask, rqueue_size, queue_empty) = sched.with_local(tid, |ctx| {
                (ctx.tl_class_mask, ctx.rqueue_size, ctx.tasklets[queue].is_empty())
            });

            if sched.tune.low_latency {
                if class_mask & budget_mask & ((1 << queue) - 1) != 0 {
                    // a more urgent class has fresh work and budget left
                    queue = if class_mask & 1 != 0 {
                        0
                    } else if class_mask & 2 != 0 {
                        1
                    } else {
                        2
                    };
                    continue;
                }
                if queue > TL_URGENT
                    && budget_mask & (1 << TL_URGENT) != 0
                    && !sched.threads[tid].shared_list.is_empty()
                {
                    break;
                }
                if queue > TL_NORMAL
                    && budget_mask & (1 << TL_NORMAL) != 0
                    && (rqueue_size > 0
                        || sched.global_tasks_mask.load(Ordering::Acquire) & bit != 0)
                {
                    break;
                }
            }

            if queue_empty {
                sched.with_local(tid, |ctx| ctx.tl_class_mask &= !(1 << queue));
                queue += 1;
                continue;
            }
            if budgets[queue] == 0 {
                budget_mask &= !(1 << queue);
                queue += 1;
                continue;
            }
            budgets[queue] -= 1;

            let t = sched
                .with_local(tid, |ctx| ctx.tasklets[queue].pop_front())
                .expect("class list emptied under our feet");
            let keep = t.state.load(Ordering::Acquire)
                & (state::SHARED_WQ | state::SELF_WAKING | state::KILLED);

            Activity::bump(&sched.activity[tid].ctxsw);
            t.calls.fetch_add(1, Ordering::Relaxed);
            sched.tasks_run_queue.fetch_sub(1, Ordering::Relaxed);

            if t.is_tasklet() {
                sched.with_local(tid, |ctx| ctx.current = Some(t.clone()));
                let prev = t.state.swap(keep, Ordering::AcqRel);
                if let Some(f) = t.take_process() {
                    f(&t, prev);
                }
                sched.with_local(tid, |ctx| ctx.current = None);
                done += 1;
                continue;
            }

            // a regular task
            let prev = t.state.swap(keep | state::RUNNING, Ordering::AcqRel);
            sched.threads[tid].task_list_size.fetch_sub(1, Ordering::Relaxed);

            let process = t.take_process();
            if prev & state::KILLED != 0 || process.is_none() {
                sched.reap(&t);
                continue;
            }

            sched.with_local(tid, |ctx| ctx.current = Some(t.clone()));
            let action = process.unwrap()(&t, prev);
            sched.with_local(tid, |ctx| ctx.current = None);

            match action {
                TaskAction::Destroy => {
                    t.state.fetch_or(state::KILLED, Ordering::AcqRel);
                    sched.reap(&t);
                }
                TaskAction::Keep => {
                    let after = t.state.fetch_and(!state::RUNNING, Ordering::AcqRel);
                    if after & state::KILLED != 0 {
                        sched.reap(&t);
                    } else if after & state::WOKEN_ANY != 0 {
                        sched.task_wakeup(&t, 0);
                    } else {
                        sched.task_queue(&t);
                    }
                }
            }
            done += 1;
        }

        done
    }

    // -- loop glue ---------------------------------------------------------

    /// One iteration of the engine loop: expire timers, run the queues,
    /// then sleep in the poller until io or a cross-thread wakeup.
    pub fn poll_round(&self, poller: &mut dyn Poller) {
        self.wake_expired_tasks();
        self.process_runnable_tasks();

        let exp = self.next_timer_expiry();
        let mut stay_awake = self.thread_has_tasks();
        if !stay_awake {
            self.sched.sleeping_thread_mask.fetch_or(tid_bit(self.tid), Ordering::AcqRel);
            // recheck after publishing: a waker may have raced us
            if self.thread_has_tasks() {
                stay_awake = true;
            }
        }
        poller.poll(exp, stay_awake);
        self.sched.sleeping_thread_mask.fetch_and(!tid_bit(self.tid), Ordering::AcqRel);
        trace!(tid = self.tid, "poll round complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter_task(sched: &Arc<Scheduler>, mask: u64, hits: Arc<AtomicUsize>) -> TaskRef {
        sched.task_new(
            mask,
            0,
            Arc::new(move |_t: &TaskRef, _s: u32| {
                hits.fetch_add(1, Ordering::Relaxed);
                TaskAction::Keep
            }),
        )
    }

    #[test]
    fn wakeup_runs_once() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counter_task(&sched, tid_bit(0), hits.clone());

        sched.task_wakeup(&t, state::WOKEN_MSG);
        assert_eq!(sched.tasks_run_queue(), 1);
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(sched.tasks_run_queue(), 0);

        // no rewake, no rerun
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn wakeup_while_queued_coalesces() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counter_task(&sched, tid_bit(0), hits.clone());

        sched.task_wakeup(&t, state::WOKEN_MSG);
        sched.task_wakeup(&t, state::WOKEN_IO);
        assert_eq!(sched.tasks_run_queue(), 1);
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tasklet_runs_and_single_membership() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        let tl = sched.tasklet_new(
            0,
            Arc::new(move |_t: &TaskRef, _s: u32| {
                h2.fetch_add(1, Ordering::Relaxed);
                TaskAction::Keep
            }),
        );

        sched.tasklet_wakeup(&tl);
        sched.tasklet_wakeup(&tl);
        assert_eq!(sched.tasks_run_queue(), 1, "double wake collapses");
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        // can be requeued afterwards
        sched.tasklet_wakeup(&tl);
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn self_waking_tasklet_demoted_to_bulk() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let hits = Arc::new(AtomicUsize::new(0));

        let sched2 = sched.clone();
        let h2 = hits.clone();
        let tl = sched.tasklet_new(
            0,
            Arc::new(move |t: &TaskRef, _s: u32| {
                if h2.fetch_add(1, Ordering::Relaxed) < 3 {
                    sched2.tasklet_wakeup(t);
                }
                TaskAction::Keep
            }),
        );

        sched.tasklet_wakeup(&tl);
        st.process_runnable_tasks();
        assert!(hits.load(Ordering::Relaxed) >= 3);
        assert!(tl.state() & state::SELF_WAKING != 0);
    }

    #[test]
    fn timer_fires_after_expiry() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counter_task(&sched, tid_bit(0), hits.clone());

        let now = now_ms();
        t.set_expire(now.add_ms(10_000));
        sched.task_queue(&t);

        st.wake_expired_tasks();
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 0, "not due yet");
        assert!(st.next_timer_expiry().is_set());

        // drop the date into the past
        t.set_expire(now);
        sched.unlink_wq(&t);
        sched.task_queue(&t);
        st.wake_expired_tasks();
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stale_timer_position_requeued_lazily() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counter_task(&sched, tid_bit(0), hits.clone());

        let now = now_ms();
        t.set_expire(now.add_ms(5));
        sched.task_queue(&t);
        // push the date back without requeueing: position is now stale
        t.set_expire(now.add_ms(100_000));
        sched.task_queue(&t);

        std::thread::sleep(std::time::Duration::from_millis(10));
        st.wake_expired_tasks();
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 0, "not really expired");
        // it must have been moved to its real position
        assert!(st.next_timer_expiry().remaining_from(now_ms()) > 50_000);
    }

    #[test]
    fn kill_queued_task_never_runs() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counter_task(&sched, tid_bit(0), hits.clone());

        sched.task_wakeup(&t, state::WOKEN_MSG);
        t.state.fetch_or(state::KILLED, Ordering::AcqRel);
        st.process_runnable_tasks();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(sched.tasks_run_queue(), 0);
    }

    #[test]
    fn conservation_counter_matches_queues() {
        let sched = Scheduler::new(1, SchedTune::default());
        let st = SchedThread::bind(sched.clone(), 0);
        let hits = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> =
            (0..10).map(|_| counter_task(&sched, tid_bit(0), hits.clone())).collect();
        for t in &tasks {
            sched.task_wakeup(t, state::WOKEN_MSG);
        }
        let tl = sched.tasklet_new(0, Arc::new(|_t: &TaskRef, _s: u32| TaskAction::Keep));
        sched.tasklet_wakeup(&tl);

        assert_eq!(sched.tasks_run_queue(), 11);
        st.process_runnable_tasks();
        assert_eq!(sched.tasks_run_queue(), 0);
        assert_eq!(hits.load(Ordering::Relaxed), 10);
    }
}
