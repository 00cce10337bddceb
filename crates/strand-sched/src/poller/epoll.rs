use std::sync::{Arc, atomic::Ordering};

use strand_timing::Tick;
use tracing::debug;

use crate::{
    fd::{FdFlags, FdTab, ev, fdstate},
    poller::{Poller, compute_wait_ms},
};

const POLLED_R: u8 = 0x01;
const POLLED_W: u8 = 0x02;

/// Level-triggered epoll backend; one instance (and one epoll fd) per engine
/// thread.
pub struct EpollPoller {
    tab: Arc<FdTab>,
    tid: usize,
    epfd: i32,
    events: Vec<libc::epoll_event>,
    /// Direction bits currently registered with the kernel, per fd.
    polled: Vec<u8>,
}

impl EpollPoller {
    pub fn new(tab: Arc<FdTab>, tid: usize) -> Self {
        let maxfd = tab.maxfd();
        Self { tab, tid, epfd: -1, events: Vec::new(), polled: vec![0; maxfd] }
    }

    fn apply_updates(&mut self) {
        for fd in self.tab.take_updates(self.tid) {
            self.tab.clear_update(fd, self.tid);
            if self.tab.is_dead(fd) {
                self.polled[fd as usize] = 0;
                continue;
            }
            let st = self.tab.entry(fd).state.load(Ordering::Relaxed);
            let mut want = 0u8;
            if st & fdstate::ACTIVE_R != 0 {
                want |= POLLED_R;
            }
            if st & fdstate::ACTIVE_W != 0 {
                want |= POLLED_W;
            }
            let cur = self.polled[fd as usize];
            if want == cur {
                continue;
            }

            let op = match (cur, want) {
                (0, _) => libc::EPOLL_CTL_ADD,
                (_, 0) => libc::EPOLL_CTL_DEL,
                _ => libc::EPOLL_CTL_MOD,
            };
            let mut evt = libc::epoll_event { events: 0, u64: fd as u64 };
            if want & POLLED_R != 0 {
                evt.events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
            }
            if want & POLLED_W != 0 {
                evt.events |= libc::EPOLLOUT as u32;
            }
            let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut evt) };
            if ret < 0 {
                debug!(fd, op, "epoll_ctl failed");
                continue;
            }
            self.polled[fd as usize] = want;
            self.tab.entry(fd).set_flags(FdFlags::INITIALIZED);
        }
    }
}

impl Poller for EpollPoller {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn preference(&self) -> i32 {
        300
    }

    fn init(&mut self) -> bool {
        if !cfg!(target_os = "linux") {
            return false;
        }
        self.epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if self.epfd < 0 {
            return false;
        }
        self.events = vec![libc::epoll_event { events: 0, u64: 0 }; 200];
        true
    }

    fn term(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd) };
            self.epfd = -1;
        }
    }

    fn register(&mut self, fd: i32) {
        // a recycled descriptor must not inherit stale direction bits
        self.polled[fd as usize] = 0;
    }

    fn close(&mut self, fd: i32) {
        // the kernel drops the registration with the descriptor
        self.polled[fd as usize] = 0;
    }

    fn poll(&mut self, exp: Tick, wake: bool) {
        self.apply_updates();

        let timeout = compute_wait_ms(exp, wake);
        let n = unsafe {
            libc::epoll_wait(self.epfd, self.events.as_mut_ptr(), self.events.len() as i32, timeout)
        };
        if n <= 0 {
            return;
        }

        for i in 0..n as usize {
            let e = self.events[i];
            let fd = e.u64 as i32;
            let mut evts = 0u32;
            if e.events & libc::EPOLLIN as u32 != 0 {
                evts |= ev::IN;
            }
            if e.events & libc::EPOLLPRI as u32 != 0 {
                evts |= ev::PRI;
            }
            if e.events & libc::EPOLLOUT as u32 != 0 {
                evts |= ev::OUT;
            }
            if e.events & libc::EPOLLERR as u32 != 0 {
                evts |= ev::ERR;
            }
            if e.events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                evts |= ev::HUP;
            }
            self.tab.update_events(fd, evts, self.tid);
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        self.term();
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;
    use crate::{fd::FdHandler, tid_bit};

    struct Seen(AtomicI32);
    impl FdHandler for Seen {
        fn io_event(&self, fd: i32) {
            self.0.store(fd, Ordering::Relaxed);
        }
    }

    #[test]
    fn reports_readable_pipe() {
        let tab = FdTab::new(1024, 1);
        let mut poller = EpollPoller::new(tab.clone(), 0);
        assert!(poller.init());

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);

        let seen = Arc::new(Seen(AtomicI32::new(-1)));
        tab.insert(r, 7, seen.clone(), tid_bit(0));
        tab.want_recv(r);

        // nothing written yet: no event within 0ms
        poller.poll(Tick::ETERNITY, true);
        assert_eq!(seen.0.load(Ordering::Relaxed), -1);

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);
        poller.poll(Tick::ETERNITY, true);
        assert_eq!(seen.0.load(Ordering::Relaxed), r);
        assert!(tab.recv_ready(r));

        poller.close(r);
        tab.delete(r);
        unsafe { libc::close(w) };
    }
}
