use std::{
    cell::UnsafeCell,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    ptr,
    sync::{
        Arc,
        atomic::{AtomicPtr, AtomicU32, Ordering},
    },
};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::{MAX_THREADS, TID_UNBOUND};

/// Per-pool, per-thread cache budget before eviction to the global list.
const CACHE_BYTES: usize = 256 * 1024;
/// EMA window for the "needed" estimate; the add weight is 4/1024 = 1/256.
const AVG_SAMPLES: u32 = 256;

/// Cache slot for the calling thread; unbound threads share slot 0.
#[inline]
fn cur_tid() -> usize {
    let tid = crate::cur_tid();
    if tid == TID_UNBOUND { 0 } else { tid }
}

/// Maps an object size to one of 16 power-of-two classes, so same-class
/// pools can be found in O(1) by embedders keeping an index.
pub const fn size_class(size: usize) -> usize {
    let mut cls = 0;
    let mut sz = 16usize; // class 0 holds everything up to 16 bytes
    while cls < 15 && sz < size {
        sz <<= 1;
        cls += 1;
    }
    cls
}

#[repr(C)]
struct Slot<T> {
    /// Freelist link; the first word of every free object.
    next: *mut Slot<T>,
    val: ManuallyDrop<T>,
}

/// Contention sentinel for the lock-free global freelist.
fn busy<T>() -> *mut Slot<T> {
    1usize as *mut Slot<T>
}

struct ThreadCache<T> {
    list: UnsafeCell<Vec<*mut Slot<T>>>,
}

// Each cache slot is only touched by its owning thread (or by Drop once no
// other thread can reach the pool).
unsafe impl<T> Sync for ThreadCache<T> {}

impl<T> Default for ThreadCache<T> {
    fn default() -> Self {
        Self { list: UnsafeCell::new(Vec::new()) }
    }
}

/// A sized object pool: per-thread freelist caches backed by a shared
/// lock-free global freelist.
///
/// `allocated >= used` always holds, and
/// `used + cached + global_free == allocated`.
pub struct Pool<T> {
    name: &'static str,
    /// Hard cap on live objects; 0 means none.
    limit: u32,
    allocated: AtomicU32,
    used: AtomicU32,
    cached: AtomicU32,
    global_free: AtomicU32,
    failed: AtomicU32,
    /// Scaled EMA of `allocated` sampled at refill time.
    needed_avg: AtomicU32,
    /// Percentage of allocations to fail on purpose, to fuzz recovery paths.
    fail_rate: AtomicU32,
    free_list: AtomicPtr<Slot<T>>,
    caches: Box<[ThreadCache<T>]>,
}

unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T: Default + Send + 'static> Pool<T> {
    pub fn new(name: &'static str, limit: u32) -> Arc<Self> {
        let pool = Arc::new(Self {
            name,
            limit,
            allocated: AtomicU32::new(0),
            used: AtomicU32::new(0),
            cached: AtomicU32::new(0),
            global_free: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            needed_avg: AtomicU32::new(0),
            fail_rate: AtomicU32::new(0),
            free_list: AtomicPtr::new(ptr::null_mut()),
            caches: (0..MAX_THREADS).map(|_| ThreadCache::default()).collect(),
        });
        registry().register(pool.clone());
        pool
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn obj_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn set_fail_rate(&self, percent: u32) {
        self.fail_rate.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn needed_avg(&self) -> u32 {
        self.needed_avg.load(Ordering::Relaxed) / AVG_SAMPLES
    }

    fn should_fail(&self) -> bool {
        let rate = self.fail_rate.load(Ordering::Relaxed);
        rate > 0 && rand::random_range(0..100) < rate
    }

    /// Takes an object, preferring the thread cache, then the global list,
    /// then a fresh OS allocation. Returns `None` on limit/fuzz failure
    /// after one GC retry.
    pub fn alloc(self: &Arc<Self>) -> Option<PoolBox<T>> {
        if self.should_fail() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let slot = self
            .take_cached()
            .or_else(|| self.pop_global())
            .map(|s| {
                // recycled storage: hand back a fresh value
                unsafe { *(*s).val = T::default() };
                s
            })
            .or_else(|| self.refill())?;

        self.used.fetch_add(1, Ordering::Relaxed);
        Some(PoolBox { pool: self.clone(), slot })
    }

    fn take_cached(&self) -> Option<*mut Slot<T>> {
        let cache = unsafe { &mut *self.caches[cur_tid()].list.get() };
        let s = cache.pop()?;
        self.cached.fetch_sub(1, Ordering::Relaxed);
        Some(s)
    }

    /// Pops the global list head under the BUSY sentinel protocol.
    fn pop_global(&self) -> Option<*mut Slot<T>> {
        let mut head = self.free_list.load(Ordering::Acquire);
        loop {
            while head == busy::<T>() {
                std::hint::spin_loop();
                head = self.free_list.load(Ordering::Acquire);
            }
            if head.is_null() {
                return None;
            }
            match self.free_list.compare_exchange_weak(
                head,
                busy::<T>(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        let next = unsafe { (*head).next };
        self.free_list.store(next, Ordering::Release);
        self.global_free.fetch_sub(1, Ordering::Relaxed);
        Some(head)
    }

    fn push_global(&self, slot: *mut Slot<T>) {
        let mut head = self.free_list.load(Ordering::Acquire);
        loop {
            while head == busy::<T>() {
                std::hint::spin_loop();
                head = self.free_list.load(Ordering::Acquire);
            }
            unsafe { (*slot).next = head };
            match self.free_list.compare_exchange_weak(
                head,
                slot,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        self.global_free.fetch_add(1, Ordering::Relaxed);
    }

    /// Fresh OS allocation with the limit check, one GC retry and failure
    /// accounting.
    fn refill(&self) -> Option<*mut Slot<T>> {
        let mut gc_done = false;
        loop {
            let allocated = self.allocated.load(Ordering::Relaxed);
            if self.limit != 0 && allocated >= self.limit {
                if !gc_done {
                    gc_done = true;
                    registry().gc();
                    // a freed object may now be reachable
                    if let Some(s) = self.pop_global() {
                        unsafe { *(*s).val = T::default() };
                        return Some(s);
                    }
                    continue;
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            self.update_needed_avg(allocated + 1);
            let slot = Box::into_raw(Box::new(Slot {
                next: ptr::null_mut(),
                val: ManuallyDrop::new(T::default()),
            }));
            self.allocated.fetch_add(1, Ordering::Relaxed);
            return Some(slot);
        }
    }

    fn update_needed_avg(&self, sample: u32) {
        // sum = sum - sum/N + v, average read as sum/N
        let _ = self.needed_avg.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |sum| {
            Some(sum - sum / AVG_SAMPLES + sample)
        });
    }

    fn release(&self, slot: *mut Slot<T>) {
        self.used.fetch_sub(1, Ordering::Relaxed);
        let cache = unsafe { &mut *self.caches[cur_tid()].list.get() };
        cache.push(slot);
        let n = self.cached.fetch_add(1, Ordering::Relaxed) + 1;

        let obj = std::mem::size_of::<Slot<T>>().max(1);
        if cache.len() * obj > CACHE_BYTES {
            // evict the oldest quarter to the global freelist
            let evict = cache.len() / 4;
            debug!(pool = self.name, evict, "pool cache over budget");
            for s in cache.drain(..evict) {
                self.push_global(s);
            }
            self.cached.fetch_sub(evict as u32, Ordering::Relaxed);
        }
        let _ = n;
    }

    fn dealloc_slot(&self, slot: *mut Slot<T>) {
        unsafe {
            let mut boxed = Box::from_raw(slot);
            ManuallyDrop::drop(&mut boxed.val);
        }
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Releases the whole global freelist back to the OS.
    pub fn flush(&self) {
        let mut head = self.free_list.load(Ordering::Acquire);
        loop {
            while head == busy::<T>() {
                std::hint::spin_loop();
                head = self.free_list.load(Ordering::Acquire);
            }
            if head.is_null() {
                return;
            }
            match self.free_list.compare_exchange_weak(
                head,
                busy::<T>(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        self.free_list.store(ptr::null_mut(), Ordering::Release);

        let mut next = head;
        let mut removed = 0u32;
        while !next.is_null() {
            let cur = next;
            next = unsafe { (*cur).next };
            self.dealloc_slot(cur);
            removed += 1;
        }
        self.global_free.fetch_sub(removed, Ordering::Relaxed);
    }

    /// Releases global-freelist surplus beyond the needed-average estimate.
    fn flush_surplus(&self) {
        while self.allocated().saturating_sub(self.used()) > self.needed_avg() {
            match self.pop_global() {
                Some(s) => self.dealloc_slot(s),
                None => break,
            }
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        // no other thread can reach the pool here
        let mut next = *self.free_list.get_mut();
        while !next.is_null() && next != busy::<T>() {
            let cur = next;
            unsafe {
                next = (*cur).next;
                let mut boxed = Box::from_raw(cur);
                ManuallyDrop::drop(&mut boxed.val);
            }
        }
        for cache in self.caches.iter() {
            for &s in unsafe { &*cache.list.get() } {
                unsafe {
                    let mut boxed = Box::from_raw(s);
                    ManuallyDrop::drop(&mut boxed.val);
                }
            }
        }
    }
}

/// An object leased from a [`Pool`]; returns to the lessor's thread cache on
/// drop.
pub struct PoolBox<T: Default + Send + 'static> {
    pool: Arc<Pool<T>>,
    slot: *mut Slot<T>,
}

unsafe impl<T: Default + Send + 'static> Send for PoolBox<T> {}

impl<T: Default + Send + 'static> PoolBox<T> {
    /// Stable address of the leased object, for diagnostics.
    pub fn as_ptr(&self) -> *const T {
        unsafe { &*(*self.slot).val as *const T }
    }
}

impl<T: Default + Send + 'static> Deref for PoolBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &(*self.slot).val }
    }
}

impl<T: Default + Send + 'static> DerefMut for PoolBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut (*self.slot).val }
    }
}

impl<T: Default + Send + 'static> Drop for PoolBox<T> {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

/// Dyn-erased view of a pool, for the process-wide registry.
trait PoolOps: Send + Sync {
    fn flush_surplus(&self);
    fn stats(&self) -> (&'static str, u32, u32, u32);
}

impl<T: Default + Send + 'static> PoolOps for Pool<T> {
    fn flush_surplus(&self) {
        Pool::flush_surplus(self);
    }

    fn stats(&self) -> (&'static str, u32, u32, u32) {
        (self.name, self.allocated(), self.used(), self.failed())
    }
}

/// Process-wide list of live pools, driving the emergency GC.
pub struct PoolRegistry {
    pools: spin::Mutex<Vec<std::sync::Weak<dyn PoolOps>>>,
}

impl PoolRegistry {
    fn register<T: Default + Send + 'static>(&self, pool: Arc<Pool<T>>) {
        let pool: Arc<dyn PoolOps> = pool;
        self.pools.lock().push(Arc::downgrade(&pool));
    }

    /// Flushes surplus from every pool. The caller is expected to be
    /// thread-isolated when invoking this from an emergency path.
    pub fn gc(&self) {
        let mut pools = self.pools.lock();
        pools.retain(|w| w.strong_count() > 0);
        for w in pools.iter() {
            if let Some(p) = w.upgrade() {
                p.flush_surplus();
            }
        }
    }

    /// (name, allocated, used, failed) per live pool.
    pub fn stats(&self) -> Vec<(&'static str, u32, u32, u32)> {
        self.pools.lock().iter().filter_map(|w| w.upgrade().map(|p| p.stats())).collect()
    }
}

static REGISTRY: Lazy<PoolRegistry> = Lazy::new(|| PoolRegistry { pools: spin::Mutex::new(Vec::new()) });

pub fn registry() -> &'static PoolRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting() {
        let pool: Arc<Pool<[u8; 32]>> = Pool::new("t32", 0);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.used(), 2);
        drop(a);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.used(), 1);
        drop(b);
        assert_eq!(pool.used(), 0);
        assert!(pool.allocated() >= pool.used());
    }

    #[test]
    fn same_thread_reuse_returns_same_address() {
        let pool: Arc<Pool<u64>> = Pool::new("t64", 0);
        let a = pool.alloc().unwrap();
        let addr = a.as_ptr();
        drop(a);
        let b = pool.alloc().unwrap();
        assert_eq!(addr, b.as_ptr());
    }

    #[test]
    fn limit_stops_allocation() {
        let pool: Arc<Pool<u64>> = Pool::new("tlim", 2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.failed(), 1);
        drop(a);
        // freed object goes back to the thread cache and satisfies the next
        // alloc even though `allocated` is at the limit
        assert!(pool.alloc().is_some());
        drop(b);
    }

    #[test]
    fn fail_rate_fuzzing() {
        let pool: Arc<Pool<u64>> = Pool::new("tfuzz", 0);
        pool.set_fail_rate(100);
        assert!(pool.alloc().is_none());
        pool.set_fail_rate(0);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn flush_returns_global_list() {
        let pool: Arc<Pool<[u8; 16]>> = Pool::new("tflush", 0);
        let boxes: Vec<_> = (0..64).filter_map(|_| pool.alloc()).collect();
        assert_eq!(pool.allocated(), 64);
        drop(boxes);
        // everything sits in the thread cache; push it out by hand
        let cache = unsafe { &mut *pool.caches[cur_tid()].list.get() };
        let drained: Vec<_> = cache.drain(..).collect();
        let ndrained = drained.len() as u32;
        for s in drained {
            pool.push_global(s);
        }
        pool.cached.fetch_sub(ndrained, Ordering::Relaxed);
        pool.flush();
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn fresh_value_after_reuse() {
        let pool: Arc<Pool<u64>> = Pool::new("treset", 0);
        let mut a = pool.alloc().unwrap();
        *a = 42;
        drop(a);
        let b = pool.alloc().unwrap();
        assert_eq!(*b, 0);
    }
}
