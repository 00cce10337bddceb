//! Full-stack smoke test: real sockets, epoll, scheduler, H1 mux and a tiny
//! upper layer answering requests, all driven by the engine loop.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use strand_buf::{Htx, HtxBlock, SlFlags, StartLine};
use strand_sched::{FdTab, SchedThread, SchedTune, Scheduler, best_poller};
use strand_utils::{ThreadPriority, thread_boot};
use strand::{
    ConnFlags, Connection, RawSock,
    config::ProxyOpts,
    conn_stream::{CsFlags, CsHandle, StreamLayer},
    engine::{SharedMux, SharedUp, wire_conn},
    mux::{Mux, h1::H1Mux},
};

/// Answers every completed request with a fixed 200.
#[derive(Default)]
struct MiniService {
    pending: Vec<CsHandle>,
}

impl StreamLayer for MiniService {
    fn stream_new(&mut self, _cs: CsHandle) -> bool {
        true
    }

    fn wake(&mut self, cs: CsHandle) {
        if !self.pending.contains(&cs) {
            self.pending.push(cs);
        }
    }

    fn capture_error(&mut self, _input: &[u8], _is_response: bool) {}

    fn sess_log(&mut self, _event: &str) {}
}

fn socketpair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let r = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(r, 0);
    for fd in fds {
        unsafe {
            let fl = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
        }
    }
    (fds[0], fds[1])
}

#[test]
fn serves_a_request_over_real_sockets() {
    let sched = Scheduler::new(1, SchedTune::default());
    let tab = FdTab::new(4096, 1);
    let (server_fd, client_fd) = socketpair();

    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let sched2 = sched.clone();
    let tab2 = tab.clone();

    let engine = std::thread::spawn(move || {
        thread_boot(None, ThreadPriority::OSDefault);
        let st = SchedThread::bind(sched2.clone(), 0);
        st.register_wake_pipe(&tab2);
        let mut poller = best_poller(tab2.clone(), 0);

        let conn = Connection::new(server_fd, Box::new(RawSock), ConnFlags::empty());
        let mut h1 = H1Mux::new(conn, ProxyOpts::default(), true, 16384);
        h1.set_sched(sched2.clone());
        let mux: SharedMux = Arc::new(spin::Mutex::new(h1));
        let service = Arc::new(spin::Mutex::new(MiniService::default()));
        let up: SharedUp = service.clone();

        let mux2 = mux.clone();
        let service2 = service.clone();
        let after = Arc::new(move || {
            let pending: Vec<CsHandle> = std::mem::take(&mut service2.lock().pending);
            for cs in pending {
                let mut m = mux2.lock();
                if !m.cs_flags(cs).contains(CsFlags::EOI) {
                    continue;
                }
                let mut req = Htx::new(Htx::DEFAULT_SIZE);
                m.rcv_buf(cs, &mut req, usize::MAX);

                let mut res = Htx::new(Htx::DEFAULT_SIZE);
                let mut sl = StartLine::response(b"HTTP/1.1", b"200", b"OK");
                sl.flags |= SlFlags::VER_11 | SlFlags::CLEN | SlFlags::XFER_LEN;
                res.add_stline(HtxBlock::ResSl(sl)).unwrap();
                res.add_header(b"content-length", b"4").unwrap();
                res.add_endof(HtxBlock::Eoh).unwrap();
                res.add_data(b"pong");
                res.add_endof(HtxBlock::Eom).unwrap();
                m.snd_buf(cs, &mut res);
            }
        });

        let _wiring = wire_conn(&sched2, &tab2, 0, server_fd, mux, up, after);

        while !stop2.load(Ordering::Relaxed) {
            st.poll_round(&mut *poller);
        }
    });

    // the client writes a request and waits for the canned answer
    let req = b"GET /ping HTTP/1.1\r\nHost: t\r\n\r\n";
    let n = unsafe { libc::write(client_fd, req.as_ptr().cast(), req.len()) };
    assert_eq!(n, req.len() as isize);

    let mut resp = Vec::new();
    let t0 = std::time::Instant::now();
    while !resp.windows(4).any(|w| w == b"pong") {
        assert!(t0.elapsed().as_secs() < 10, "no response: {resp:?}");
        let mut buf = [0u8; 1024];
        let n = unsafe { libc::read(client_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            resp.extend_from_slice(&buf[..n as usize]);
        } else {
            std::thread::yield_now();
        }
    }
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");

    stop.store(true, Ordering::Relaxed);
    // one nudge so the engine thread leaves the poller
    unsafe {
        let b = [0u8; 1];
        libc::write(client_fd, b.as_ptr().cast(), 1);
    }
    engine.join().unwrap();
    unsafe { libc::close(client_fd) };
}
