use std::sync::{Arc, atomic::Ordering};

use strand_timing::Tick;

use crate::{
    fd::{FdTab, ev, fdstate},
    poller::{Poller, compute_wait_ms},
};

const POLLED_R: u8 = 0x01;
const POLLED_W: u8 = 0x02;

/// Portable poll(2) fallback; rebuilt pollfd array every pass.
pub struct PollPoller {
    tab: Arc<FdTab>,
    tid: usize,
    /// Direction bits the backend tracks per fd.
    polled: Vec<u8>,
    fds: Vec<libc::pollfd>,
}

impl PollPoller {
    pub fn new(tab: Arc<FdTab>, tid: usize) -> Self {
        let maxfd = tab.maxfd();
        Self { tab, tid, polled: vec![0; maxfd], fds: Vec::new() }
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
            self.polled[fd as usize] = want;
        }
    }
}

impl Poller for PollPoller {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn preference(&self) -> i32 {
        200
    }

    fn init(&mut self) -> bool {
        true
    }

    fn term(&mut self) {}

    fn register(&mut self, fd: i32) {
        self.polled[fd as usize] = 0;
    }

    fn close(&mut self, fd: i32) {
        self.polled[fd as usize] = 0;
    }

    fn poll(&mut self, exp: Tick, wake: bool) {
        self.apply_updates();

        self.fds.clear();
        for (fd, &p) in self.polled.iter().enumerate() {
            if p == 0 {
                continue;
            }
            let mut events: libc::c_short = 0;
            if p & POLLED_R != 0 {
                events |= libc::POLLIN | libc::POLLRDHUP;
            }
            if p & POLLED_W != 0 {
                events |= libc::POLLOUT;
            }
            self.fds.push(libc::pollfd { fd: fd as i32, events, revents: 0 });
        }

        let timeout = compute_wait_ms(exp, wake);
        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout) };
        if n <= 0 {
            return;
        }

        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            let mut evts = 0u32;
            if pfd.revents & libc::POLLIN != 0 {
                evts |= ev::IN;
            }
            if pfd.revents & libc::POLLPRI != 0 {
                evts |= ev::PRI;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                evts |= ev::OUT;
            }
            if pfd.revents & libc::POLLERR != 0 {
                evts |= ev::ERR;
            }
            if pfd.revents & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
                evts |= ev::HUP;
            }
            self.tab.update_events(pfd.fd, evts, self.tid);
        }
    }
}

#[cfg(test)]
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
        let mut poller = PollPoller::new(tab.clone(), 0);
        assert!(poller.init());

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);

        let seen = Arc::new(Seen(AtomicI32::new(-1)));
        tab.insert(r, 7, seen.clone(), tid_bit(0));
        tab.want_recv(r);

        assert_eq!(unsafe { libc::write(w, b"y".as_ptr().cast(), 1) }, 1);
        poller.poll(Tick::ETERNITY, true);
        assert_eq!(seen.0.load(Ordering::Relaxed), r);

        tab.delete(r);
        unsafe { libc::close(w) };
    }
}
