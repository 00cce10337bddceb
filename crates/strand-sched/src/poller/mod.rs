mod epoll;
mod poll;

use std::sync::Arc;

pub use epoll::EpollPoller;
pub use poll::PollPoller;
use strand_timing::{Tick, now_ms};
use tracing::info;

use crate::fd::FdTab;

/// Longest kernel sleep regardless of timer distance, so wrapping expiry
/// dates are re-examined periodically.
pub(crate) const MAX_DELAY_MS: u32 = 60_000;

/// An event-poll backend bound to one engine thread.
///
/// The framework instantiates every available backend at startup and keeps
/// the highest-preference one that initialises successfully.
pub trait Poller: Send {
    fn name(&self) -> &'static str;

    /// Relative merit; higher wins.
    fn preference(&self) -> i32;

    /// Allocates kernel resources. Returning false disqualifies the backend.
    fn init(&mut self) -> bool;

    fn term(&mut self);

    /// Makes a fresh fd known to the backend; the kernel-side registration
    /// is deferred to the update pass at the next poll entry.
    fn register(&mut self, fd: i32);

    /// Forgets any backend-level registration for `fd` (the kernel side is
    /// dropped with the descriptor itself).
    fn close(&mut self, fd: i32);

    /// Applies pending registration updates, sleeps until `exp` (or not at
    /// all when `wake` is set), then dispatches reported events through the
    /// fd table.
    fn poll(&mut self, exp: Tick, wake: bool);
}

pub(crate) fn compute_wait_ms(exp: Tick, wake: bool) -> i32 {
    if wake {
        return 0;
    }
    if !exp.is_set() {
        return MAX_DELAY_MS as i32;
    }
    exp.remaining_from(now_ms()).min(MAX_DELAY_MS) as i32
}

/// Picks the best working backend for this thread.
pub fn best_poller(tab: Arc<FdTab>, tid: usize) -> Box<dyn Poller> {
    let mut candidates: Vec<Box<dyn Poller>> =
        vec![Box::new(EpollPoller::new(tab.clone(), tid)), Box::new(PollPoller::new(tab, tid))];
    candidates.sort_by_key(|p| -p.preference());
    for mut p in candidates {
        if p.init() {
            info!(poller = p.name(), tid, "poller selected");
            return p;
        }
    }
    unreachable!("the poll() backend cannot fail to initialise")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_computation() {
        assert_eq!(compute_wait_ms(Tick(123), true), 0);
        assert_eq!(compute_wait_ms(Tick::ETERNITY, false), MAX_DELAY_MS as i32);
    }
}
