use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use tracing::trace;

use crate::tid_bit;

/// Poisons the owner slot of a freed-but-not-closed fd so that stale users
/// fault loudly instead of silently driving someone else's socket.
pub const DEAD_FD_MAGIC: u64 = 0xFDDE_ADFD;

/// Packed per-direction polling state, CAS'd by whoever flips it.
pub mod fdstate {
    pub const ACTIVE_R: u32 = 0x01;
    pub const READY_R: u32 = 0x02;
    pub const SHUT_R: u32 = 0x04;
    pub const ACTIVE_W: u32 = 0x10;
    pub const READY_W: u32 = 0x20;
    pub const SHUT_W: u32 = 0x40;
    /// Error seen on the socket; covers both directions.
    pub const ERR: u32 = 0x80;
}

/// Events reported by the last poll.
pub mod ev {
    pub const IN: u32 = 0x01;
    pub const PRI: u32 = 0x02;
    pub const OUT: u32 = 0x04;
    pub const ERR: u32 = 0x08;
    pub const HUP: u32 = 0x10;
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        /// Closing while unread input remains risks a TIME_WAIT flood;
        /// disable lingering before close.
        const LINGER_RISK = 0x01;
        /// fd was dup'ed; the kernel registration may outlive this slot.
        const CLONED = 0x02;
        /// fd has been seen by the poller backend at least once.
        const INITIALIZED = 0x04;
        /// Edge-triggered registration is usable for this fd.
        const ET_POSSIBLE = 0x08;
    }
}

/// Callback attached to an fd, invoked from the poll loop on events.
pub trait FdHandler: Send + Sync {
    fn io_event(&self, fd: i32);
}

pub struct FdEntry {
    /// `fdstate::*` bits.
    pub state: AtomicU32,
    /// `ev::*` bits from the last poll report.
    pub ev: AtomicU32,
    /// Threads allowed to process this fd.
    pub thread_mask: AtomicU64,
    /// Threads currently processing this fd; at most one bit set.
    pub running_mask: AtomicU64,
    /// Threads with a coalesced polling-state change pending.
    pub update_mask: AtomicU64,
    /// Opaque owner token, or `DEAD_FD_MAGIC` once released.
    pub owner: AtomicU64,
    pub flags: AtomicU32,
    iocb: spin::Mutex<Option<Arc<dyn FdHandler>>>,
}

impl Default for FdEntry {
    fn default() -> Self {
        Self {
            state: AtomicU32::new(0),
            ev: AtomicU32::new(0),
            thread_mask: AtomicU64::new(0),
            running_mask: AtomicU64::new(0),
            update_mask: AtomicU64::new(0),
            owner: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            iocb: spin::Mutex::new(None),
        }
    }
}

impl FdEntry {
    pub fn flags(&self) -> FdFlags {
        FdFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_flags(&self, f: FdFlags) {
        self.flags.fetch_or(f.bits(), Ordering::Relaxed);
    }
}

/// One fixed-size table of fd states, indexed by the raw descriptor.
pub struct FdTab {
    entries: Box<[FdEntry]>,
    /// Per-thread coalesced update lists drained at poll entry.
    updates: Box<[spin::Mutex<Vec<i32>>]>,
}

impl FdTab {
    pub fn new(maxfd: usize, nbthread: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: (0..maxfd).map(|_| FdEntry::default()).collect(),
            updates: (0..nbthread).map(|_| spin::Mutex::new(Vec::new())).collect(),
        })
    }

    #[inline]
    pub fn maxfd(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn entry(&self, fd: i32) -> &FdEntry {
        &self.entries[fd as usize]
    }

    /// Registers a ready-to-use fd with its owner token and io callback.
    pub fn insert(&self, fd: i32, owner: u64, iocb: Arc<dyn FdHandler>, thread_mask: u64) {
        let e = self.entry(fd);
        e.state.store(0, Ordering::Relaxed);
        e.ev.store(0, Ordering::Relaxed);
        e.thread_mask.store(thread_mask, Ordering::Relaxed);
        e.running_mask.store(0, Ordering::Relaxed);
        e.update_mask.store(0, Ordering::Relaxed);
        e.owner.store(owner, Ordering::Relaxed);
        e.flags.store(0, Ordering::Relaxed);
        *e.iocb.lock() = Some(iocb);
        trace!(fd, thread_mask, "fd inserted");
    }

    /// Unregisters and closes the fd, lowering lingering first when the slot
    /// was flagged at risk and a shutdown was observed.
    pub fn delete(&self, fd: i32) {
        let e = self.entry(fd);
        let st = e.state.load(Ordering::Relaxed);
        if e.flags().contains(FdFlags::LINGER_RISK)
            && st & (fdstate::SHUT_R | fdstate::ERR) != 0
        {
            let nolinger = libc::linger { l_onoff: 1, l_linger: 0 };
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    std::ptr::addr_of!(nolinger).cast(),
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
        }
        *e.iocb.lock() = None;
        e.owner.store(DEAD_FD_MAGIC, Ordering::Relaxed);
        e.thread_mask.store(0, Ordering::Relaxed);
        e.update_mask.store(0, Ordering::Relaxed);
        e.state.store(0, Ordering::Relaxed);
        unsafe { libc::close(fd) };
        trace!(fd, "fd deleted");
    }

    pub fn is_dead(&self, fd: i32) -> bool {
        self.entry(fd).owner.load(Ordering::Relaxed) == DEAD_FD_MAGIC
    }

    /// Queues a coalesced polling change for every thread allowed on `fd`.
    /// Repeated calls within one wakeup collapse into a single kernel update
    /// at the next poll entry.
    fn updt_fd_polling(&self, fd: i32) {
        let e = self.entry(fd);
        let tmask = e.thread_mask.load(Ordering::Relaxed);
        for tid in 0..self.updates.len() {
            let bit = tid_bit(tid);
            if tmask & bit == 0 {
                continue;
            }
            if e.update_mask.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
                self.updates[tid].lock().push(fd);
            }
        }
    }

    /// Takes this thread's pending update list.
    pub fn take_updates(&self, tid: usize) -> Vec<i32> {
        std::mem::take(&mut *self.updates[tid].lock())
    }

    pub fn clear_update(&self, fd: i32, tid: usize) {
        self.entry(fd).update_mask.fetch_and(!tid_bit(tid), Ordering::AcqRel);
    }

    // -- direction state machine -------------------------------------------

    pub fn want_recv(&self, fd: i32) {
        let e = self.entry(fd);
        if e.state.fetch_or(fdstate::ACTIVE_R, Ordering::AcqRel) & fdstate::ACTIVE_R == 0 {
            self.updt_fd_polling(fd);
        }
    }

    pub fn stop_recv(&self, fd: i32) {
        let e = self.entry(fd);
        if e.state.fetch_and(!fdstate::ACTIVE_R, Ordering::AcqRel) & fdstate::ACTIVE_R != 0 {
            self.updt_fd_polling(fd);
        }
    }

    /// `recv()` returned EAGAIN: the fd is no longer ready.
    pub fn cant_recv(&self, fd: i32) {
        self.entry(fd).state.fetch_and(!fdstate::READY_R, Ordering::AcqRel);
    }

    pub fn may_recv(&self, fd: i32) {
        self.entry(fd).state.fetch_or(fdstate::READY_R, Ordering::AcqRel);
    }

    pub fn recv_ready(&self, fd: i32) -> bool {
        self.entry(fd).state.load(Ordering::Relaxed) & fdstate::READY_R != 0
    }

    /// Read side definitely closed; ACTIVE and READY are dropped with it.
    pub fn shut_recv(&self, fd: i32) {
        let e = self.entry(fd);
        e.state.fetch_and(!(fdstate::ACTIVE_R | fdstate::READY_R), Ordering::AcqRel);
        e.state.fetch_or(fdstate::SHUT_R, Ordering::AcqRel);
    }

    pub fn want_send(&self, fd: i32) {
        let e = self.entry(fd);
        if e.state.fetch_or(fdstate::ACTIVE_W, Ordering::AcqRel) & fdstate::ACTIVE_W == 0 {
            self.updt_fd_polling(fd);
        }
    }

    pub fn stop_send(&self, fd: i32) {
        let e = self.entry(fd);
        if e.state.fetch_and(!fdstate::ACTIVE_W, Ordering::AcqRel) & fdstate::ACTIVE_W != 0 {
            self.updt_fd_polling(fd);
        }
    }

    pub fn cant_send(&self, fd: i32) {
        self.entry(fd).state.fetch_and(!fdstate::READY_W, Ordering::AcqRel);
    }

    pub fn may_send(&self, fd: i32) {
        self.entry(fd).state.fetch_or(fdstate::READY_W, Ordering::AcqRel);
    }

    pub fn send_ready(&self, fd: i32) -> bool {
        self.entry(fd).state.load(Ordering::Relaxed) & fdstate::READY_W != 0
    }

    pub fn shut_send(&self, fd: i32) {
        let e = self.entry(fd);
        e.state.fetch_and(!(fdstate::ACTIVE_W | fdstate::READY_W), Ordering::AcqRel);
        e.state.fetch_or(fdstate::SHUT_W, Ordering::AcqRel);
    }

    pub fn set_error(&self, fd: i32) {
        self.entry(fd).state.fetch_or(fdstate::ERR, Ordering::AcqRel);
    }

    pub fn error_seen(&self, fd: i32) -> bool {
        self.entry(fd).state.load(Ordering::Relaxed) & fdstate::ERR != 0
    }

    // -- poll-loop entry points --------------------------------------------

    /// Applies a poll report and runs the io callback, provided this thread
    /// can claim the fd. Exactly one thread holds `running_mask` at a time;
    /// losing the claim means another thread is already on it.
    pub fn update_events(&self, fd: i32, evts: u32, tid: usize) {
        let e = self.entry(fd);
        if e.thread_mask.load(Ordering::Relaxed) & tid_bit(tid) == 0 {
            return;
        }
        if e
            .running_mask
            .compare_exchange(0, tid_bit(tid), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        e.ev.store(evts, Ordering::Relaxed);
        if evts & (ev::IN | ev::HUP | ev::ERR) != 0 {
            self.may_recv(fd);
        }
        if evts & (ev::OUT | ev::ERR) != 0 {
            self.may_send(fd);
        }
        if evts & ev::ERR != 0 {
            self.set_error(fd);
        }

        let iocb = e.iocb.lock().clone();
        if let Some(cb) = iocb {
            cb.io_event(fd);
        }

        e.running_mask.fetch_and(!tid_bit(tid), Ordering::AcqRel);
    }

    /// Moves the fd to another thread. Succeeds only when no thread is
    /// processing it; afterwards only `new_tid` may touch it.
    pub fn takeover(&self, fd: i32, new_tid: usize) -> bool {
        let e = self.entry(fd);
        if e.owner.load(Ordering::Relaxed) == DEAD_FD_MAGIC {
            return false;
        }
        if e
            .running_mask
            .compare_exchange(0, tid_bit(new_tid), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        e.thread_mask.store(tid_bit(new_tid), Ordering::Release);
        e.running_mask.fetch_and(!tid_bit(new_tid), Ordering::AcqRel);
        self.updt_fd_polling(fd);
        true
    }
}
