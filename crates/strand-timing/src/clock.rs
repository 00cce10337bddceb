use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use once_cell::sync::OnceCell;

use crate::Tick;

enum Source {
    Monotonic,
    Mock(Arc<AtomicU32>),
}

static GLOBAL_CLOCK: OnceCell<Source> = OnceCell::new();

/// Controller for a mocked global clock. Tests drive the engine's notion of
/// "now" through this handle; nothing in the engine ever sleeps on it.
#[derive(Clone)]
pub struct MockClock(Arc<AtomicU32>);

impl MockClock {
    pub fn set(&self, tick: Tick) {
        self.0.store(tick.0, Ordering::Relaxed);
    }

    pub fn advance(&self, ms: u32) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn now(&self) -> Tick {
        Tick(self.0.load(Ordering::Relaxed))
    }
}

/// Installs a mocked source for the global clock, starting at tick 1.
/// Must win the race against the first `now_ms()` call; initialise it before
/// spawning engine threads.
pub fn init_global_with_mock() -> MockClock {
    let cell = Arc::new(AtomicU32::new(1));
    let installed = GLOBAL_CLOCK.get_or_init(|| Source::Mock(cell.clone()));
    match installed {
        Source::Mock(c) => MockClock(c.clone()),
        Source::Monotonic => panic!("global clock already initialised as monotonic"),
    }
}

#[cfg(target_os = "linux")]
fn raw_monotonic_ms() -> u32 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000) as u32
}

#[cfg(not(target_os = "linux"))]
fn raw_monotonic_ms() -> u32 {
    use std::time::Instant;
    use once_cell::sync::Lazy;
    static BASE: Lazy<Instant> = Lazy::new(Instant::now);
    BASE.elapsed().as_millis() as u32
}

/// The engine's wrapping millisecond timestamp. Worker loops snapshot it once
/// per iteration; everything downstream compares against the snapshot.
#[inline]
pub fn now_ms() -> Tick {
    match GLOBAL_CLOCK.get_or_init(|| Source::Monotonic) {
        Source::Monotonic => {
            let v = raw_monotonic_ms();
            // 0 is the "never" encoding
            Tick(if v == 0 { 1 } else { v })
        }
        Source::Mock(c) => Tick(c.load(Ordering::Relaxed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_drives_now() {
        let mock = init_global_with_mock();
        assert_eq!(now_ms(), Tick(1));
        mock.advance(41);
        assert_eq!(now_ms(), Tick(42));
        mock.set(Tick(0xFFFF_FF00));
        assert_eq!(now_ms(), Tick(0xFFFF_FF00));
    }
}
