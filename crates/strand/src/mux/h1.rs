use std::sync::Arc;

use bitflags::bitflags;
use strand_buf::{Buffer, Htx, HtxBlock, SlFlags, StartLine};
use strand_sched::{DynBuf, Scheduler, TaskRef};
use strand_timing::{Tick, now_ms};
use strand_utils::Ist;
use tracing::{debug, trace};

use crate::{
    config::ProxyOpts,
    conn_stream::{CsFlags, CsHandle, StreamLayer},
    connection::{ConnFlags, Connection, HsProgress, SubEvents, sub},
    h1m::{H1m, H1mFlags, H1mState},
    mux::{CsInfo, MUX_STATUS_READY, Mux, MuxCtl, ShutrMode, ShutwMode},
    xprt::XprtResult,
};

/// The HTTP/2 connection preface; seeing it on a first request means the
/// peer wants to speak H2 on this connection.
pub const H2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct H1cFlags: u32 {
        /// Blocked waiting for an output buffer.
        const OUT_ALLOC    = 0x0001;
        /// Output buffer full.
        const OUT_FULL     = 0x0002;
        /// Blocked waiting for an input buffer.
        const IN_ALLOC     = 0x0010;
        /// Input buffer full.
        const IN_FULL      = 0x0020;
        /// Input parked until the other side catches up.
        const IN_BUSY      = 0x0040;
        /// Connection must be closed asap after an error.
        const CS_ERROR     = 0x1000;
        /// Shut the write side once the output buffer drains.
        const CS_SHUTW_NOW = 0x2000;
        /// Connection fully shut down.
        const CS_SHUTDOWN  = 0x4000;
        /// Idle and reusable.
        const CS_IDLE      = 0x8000;
        /// Between two requests on a keep-alive connection.
        const WAIT_NEXT_REQ = 0x0001_0000;
        /// The first request carried the H2 preface; hand over to the H2
        /// mux.
        const UPG_H2C      = 0x0002_0000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct H1sFlags: u32 {
        const ERROR        = 0x0001;
        const REQ_ERROR    = 0x0002;
        const RES_ERROR    = 0x0004;
        /// End of input stream seen, even if not yet delivered.
        const REOS         = 0x0008;
        const WANT_KAL     = 0x0010;
        const WANT_TUN     = 0x0020;
        const WANT_CLO     = 0x0040;
        const NOT_FIRST    = 0x0080;
        /// Incoming message fully parsed (EOM emitted).
        const PARSING_DONE = 0x0100;
        /// The server-id header was injected into this request.
        const HAVE_SRV_NAME = 0x0200;
        /// The Connection header decision was emitted.
        const HAVE_O_CONN  = 0x0400;
        /// Explicit close token carried by the message being emitted.
        const OUT_CONN_CLO = 0x0800;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum OutState {
    #[default]
    Hdrs,
    Body,
    Trailers,
    Done,
}

/// The one stream an H1 connection carries.
struct H1s {
    cs: CsHandle,
    created: Tick,
    flags: H1sFlags,
    cs_flags: CsFlags,
    /// Incoming message parser.
    rx: H1m,
    subs_recv: Option<TaskRef>,
    subs_send: Option<TaskRef>,
    out_state: OutState,
    out_chunked: bool,
    out_trailers: bool,
    /// The message being emitted is a response.
    out_response: bool,
    /// Flags of the message being emitted, from its start line.
    out_flags: SlFlags,
    out_status: u16,
}

impl H1s {
    fn new(cs: CsHandle, front: bool, not_first: bool) -> Self {
        Self {
            cs,
            created: now_ms(),
            flags: if not_first { H1sFlags::NOT_FIRST } else { H1sFlags::empty() },
            cs_flags: if not_first { CsFlags::NOT_FIRST } else { CsFlags::empty() },
            rx: if front { H1m::request() } else { H1m::response() },
            subs_recv: None,
            subs_send: None,
            out_state: OutState::Hdrs,
            out_chunked: false,
            out_trailers: false,
            out_response: false,
            out_flags: SlFlags::default(),
            out_status: 0,
        }
    }
}

/// HTTP/1 multiplexer: one connection, one stream, byte-level parse and
/// format with the connection-mode policy in the middle.
pub struct H1Mux {
    conn: Connection,
    opts: ProxyOpts,
    front: bool,
    bufsize: usize,
    flags: H1cFlags,
    ibuf: Buffer,
    obuf: Buffer,
    h1s: Option<H1s>,
    /// Bumped whenever the stream slot is recycled; stale handles die.
    epoch: u32,
    scratch: Vec<u8>,
    sched: Option<Arc<Scheduler>>,
    /// Budgeted buffer source plus the tasklet parked when it runs dry.
    dynbuf: Option<(Arc<DynBuf>, TaskRef)>,
    pending_capture: Option<Vec<u8>>,
    /// Idle deadline for the timeout task.
    expire: Tick,
}

impl H1Mux {
    pub fn new(conn: Connection, opts: ProxyOpts, front: bool, bufsize: usize) -> Self {
        let timeout = opts.timeout;
        let mut mux = Self {
            conn,
            opts,
            front,
            bufsize,
            flags: H1cFlags::empty(),
            ibuf: Buffer::null(),
            obuf: Buffer::null(),
            h1s: None,
            epoch: 0,
            scratch: vec![0; bufsize],
            sched: None,
            dynbuf: None,
            pending_capture: None,
            expire: Tick::ETERNITY,
        };
        mux.expire = now_ms().add_ms(timeout);
        if !front {
            // outgoing side: the stream exists as soon as we do
            let cs = CsHandle::new(0, mux.epoch);
            mux.h1s = Some(H1s::new(cs, false, false));
        }
        mux
    }

    pub fn set_sched(&mut self, sched: Arc<Scheduler>) {
        self.sched = Some(sched);
    }

    /// Draws io buffers from a budgeted source; on exhaustion the mux
    /// parks `tasklet` and retries once a buffer is released.
    pub fn set_dynbuf(&mut self, db: Arc<DynBuf>, tasklet: TaskRef) {
        self.dynbuf = Some((db, tasklet));
    }

    /// The mode decision for the current exchange landed on close. The
    /// stream layer reads this off one side and forwards it to the other
    /// with [`note_peer_close`](Self::note_peer_close) so both connections
    /// agree on reuse.
    pub fn wants_close(&self) -> bool {
        self.h1s.as_ref().is_some_and(|s| s.flags.contains(H1sFlags::WANT_CLO))
    }

    /// Records the peer side's close decision for the current exchange:
    /// the message still to be emitted goes out in close mode. An explicit
    /// `connection: close` header travelling in the HTX reaches the same
    /// outcome without this call.
    pub fn note_peer_close(&mut self, cs: CsHandle) {
        if !self.valid(cs) {
            return;
        }
        let h1s = self.h1s.as_mut().unwrap();
        if !h1s.flags.contains(H1sFlags::WANT_TUN) {
            h1s.flags.remove(H1sFlags::WANT_KAL);
            h1s.flags |= H1sFlags::WANT_CLO;
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// True once the first request turned out to be an H2 preface.
    pub fn upgrading(&self) -> bool {
        self.flags.contains(H1cFlags::UPG_H2C)
    }

    /// Hands the connection and buffered input over for the H2 takeover.
    pub fn take_h2_upgrade(mut self) -> Option<(Connection, Buffer)> {
        if !self.flags.contains(H1cFlags::UPG_H2C) {
            return None;
        }
        let ibuf = std::mem::replace(&mut self.ibuf, Buffer::null());
        let conn = std::mem::replace(
            &mut self.conn,
            Connection::new(-1, Box::new(crate::xprt::MemTransport::default()), ConnFlags::empty()),
        );
        Some((conn, ibuf))
    }

    fn refresh_timeout(&mut self) {
        let t = if self.flags.intersects(H1cFlags::CS_SHUTW_NOW | H1cFlags::CS_SHUTDOWN) {
            self.opts.shut_timeout
        } else {
            self.opts.timeout
        };
        self.expire = now_ms().add_ms(t);
    }

    fn valid(&self, cs: CsHandle) -> bool {
        self.h1s.as_ref().is_some_and(|s| s.cs == cs && cs.epoch == self.epoch)
    }

    fn take_buf(&mut self, blocked: H1cFlags) -> Option<Buffer> {
        match &self.dynbuf {
            None => Some(Buffer::with_capacity(self.bufsize)),
            Some((db, tl)) => match db.alloc() {
                Some(b) => Some(b),
                None => {
                    self.flags |= blocked;
                    db.wait(tl);
                    None
                }
            },
        }
    }

    fn alloc_bufs(&mut self) {
        if self.ibuf.is_null() {
            if let Some(b) = self.take_buf(H1cFlags::IN_ALLOC) {
                self.ibuf = b;
                self.flags.remove(H1cFlags::IN_ALLOC);
            }
        }
        if self.obuf.is_null() {
            if let Some(b) = self.take_buf(H1cFlags::OUT_ALLOC) {
                self.obuf = b;
                self.flags.remove(H1cFlags::OUT_ALLOC);
            }
        }
    }

    fn recv(&mut self) -> usize {
        if self.conn.flags.contains(ConnFlags::SOCK_RD_SH) || self.flags.contains(H1cFlags::IN_FULL)
        {
            return 0;
        }
        self.alloc_bufs();
        if self.ibuf.is_null() {
            return 0;
        }
        let room = self.ibuf.room();
        match self.conn.rcv_buf(&mut self.ibuf, room) {
            XprtResult::Bytes(n) => {
                if self.ibuf.is_full() {
                    self.flags |= H1cFlags::IN_FULL;
                }
                n
            }
            XprtResult::Closed => {
                if let Some(h1s) = &mut self.h1s {
                    h1s.flags |= H1sFlags::REOS;
                }
                0
            }
            XprtResult::WouldBlock => 0,
            XprtResult::Error(_) => {
                self.flags |= H1cFlags::CS_ERROR;
                if let Some(h1s) = &mut self.h1s {
                    h1s.cs_flags |= CsFlags::ERR_PENDING;
                }
                0
            }
        }
    }

    fn send(&mut self) {
        if self.obuf.is_empty() {
            self.maybe_finish_shut();
            return;
        }
        let len = self.obuf.data();
        match self.conn.snd_buf(&mut self.obuf, len) {
            XprtResult::Bytes(n) => {
                if n > 0 {
                    self.flags.remove(H1cFlags::OUT_FULL);
                    self.wake_subs_send();
                }
            }
            XprtResult::WouldBlock => {}
            XprtResult::Closed | XprtResult::Error(_) => {
                self.flags |= H1cFlags::CS_ERROR;
            }
        }
        self.maybe_finish_shut();
    }

    fn maybe_finish_shut(&mut self) {
        if self.flags.contains(H1cFlags::CS_SHUTW_NOW)
            && self.obuf.is_empty()
            && !self.flags.contains(H1cFlags::CS_SHUTDOWN)
        {
            self.conn.shutw(true);
            self.flags.remove(H1cFlags::CS_SHUTW_NOW);
            self.flags |= H1cFlags::CS_SHUTDOWN;
            if let Some(h1s) = &mut self.h1s {
                h1s.cs_flags |= CsFlags::EOS;
            }
        }
    }

    fn wake_subs_send(&mut self) {
        if let Some(h1s) = &mut self.h1s {
            if let (Some(t), Some(sched)) = (h1s.subs_send.take(), self.sched.as_ref()) {
                sched.tasklet_wakeup(&t);
            }
        }
    }

    fn wake_subs_recv(&mut self) {
        if let Some(h1s) = &mut self.h1s {
            if let (Some(t), Some(sched)) = (h1s.subs_recv.take(), self.sched.as_ref()) {
                sched.tasklet_wakeup(&t);
            }
        }
    }

    /// Connection-mode decision on the incoming request (frontend side).
    fn set_cli_conn_mode(h1s: &mut H1s, opts: &ProxyOpts) {
        if h1s.flags.intersects(H1sFlags::WANT_KAL | H1sFlags::WANT_CLO | H1sFlags::WANT_TUN) {
            return;
        }
        let f = h1s.rx.flags;
        let close = (!f.contains(H1mFlags::VER_11) && !f.contains(H1mFlags::CONN_KAL))
            || f.contains(H1mFlags::CONN_CLO)
            || opts.h1.httpclose
            || opts.stopping;
        h1s.flags |= if close { H1sFlags::WANT_CLO } else { H1sFlags::WANT_KAL };
        let mode = h1s.flags & (H1sFlags::WANT_CLO | H1sFlags::WANT_KAL);
        trace!(?mode, "conn mode");
    }

    /// Mirror decision on the parsed response (server side), with its own
    /// option set: the connection to the server is reused or closed on its
    /// own terms.
    fn set_srv_conn_mode(h1s: &mut H1s, opts: &ProxyOpts) {
        if h1s.flags.intersects(H1sFlags::WANT_KAL | H1sFlags::WANT_CLO | H1sFlags::WANT_TUN) {
            return;
        }
        let f = h1s.rx.flags;
        let connect_2xx = h1s.out_flags.contains(SlFlags::CONNECT)
            && (200..300).contains(&h1s.rx.status);
        if h1s.rx.status == 101 || connect_2xx {
            h1s.flags |= H1sFlags::WANT_TUN;
            return;
        }
        let close = (!f.contains(H1mFlags::VER_11) && !f.contains(H1mFlags::CONN_KAL))
            || f.contains(H1mFlags::CONN_CLO)
            || !f.contains(H1mFlags::XFER_LEN)
            || opts.h1.server_close
            || opts.h1.httpclose
            || opts.stopping;
        h1s.flags |= if close { H1sFlags::WANT_CLO } else { H1sFlags::WANT_KAL };
        let mode = h1s.flags & (H1sFlags::WANT_CLO | H1sFlags::WANT_KAL);
        trace!(?mode, "srv conn mode");
    }

    /// Tunnel establishment is visible on the response start line alone;
    /// the close/keep-alive veto waits for the headers in
    /// [`finish_headers`](Self::finish_headers).
    fn update_mode_on_response(h1s: &mut H1s, status: u16) {
        let connect_2xx =
            h1s.rx.flags.contains(H1mFlags::METH_CONNECT) && (200..300).contains(&status);
        if status == 101 || connect_2xx {
            h1s.flags.remove(H1sFlags::WANT_KAL | H1sFlags::WANT_CLO);
            h1s.flags |= H1sFlags::WANT_TUN;
        }
    }

    fn case_adjust(&self, name: &[u8]) -> Vec<u8> {
        for (from, to) in &self.opts.h1.case_adjust {
            if name.eq_ignore_ascii_case(from.as_bytes()) {
                return to.as_bytes().to_vec();
            }
        }
        name.to_vec()
    }

    fn contig_input(&mut self) -> &[u8] {
        if self.ibuf.contig_data() < self.ibuf.data() {
            self.ibuf.slow_realign(&mut self.scratch);
        }
        self.ibuf.data_slices().0
    }
}

impl Mux for H1Mux {
    fn wake(&mut self, up: &mut dyn StreamLayer) -> bool {
        if self.conn.handshaking() {
            match self.conn.handshake() {
                Ok(HsProgress::Done) => {}
                Ok(HsProgress::Pending) => return true,
                Err(_) => {
                    debug!(code = ?self.conn.err_code, "handshake failed");
                    return false;
                }
            }
        }

        let received = self.recv();

        if let Some(cap) = self.pending_capture.take() {
            up.capture_error(&cap, !self.front);
        }

        // first bytes on a front connection: H2 preface detection, then
        // stream creation
        if self.front && self.h1s.is_none() && !self.flags.contains(H1cFlags::UPG_H2C) {
            let not_first = self.flags.contains(H1cFlags::WAIT_NEXT_REQ);
            if self.opts.h1.h2_upgrade && !not_first && self.ibuf.data() >= H2_PREFACE.len() {
                let is_preface = {
                    let head = self.contig_input();
                    &head[..H2_PREFACE.len()] == H2_PREFACE
                };
                if is_preface {
                    self.flags |= H1cFlags::UPG_H2C;
                    debug!("first request is an http/2 preface, upgrading");
                    return true;
                }
            }
            if !self.ibuf.is_empty() {
                let cs = CsHandle::new(0, self.epoch);
                let mut h1s = H1s::new(cs, true, not_first);
                self.flags.remove(H1cFlags::WAIT_NEXT_REQ | H1cFlags::CS_IDLE);
                if !up.stream_new(cs) {
                    h1s.flags |= H1sFlags::ERROR;
                    self.flags |= H1cFlags::CS_ERROR;
                }
                self.h1s = Some(h1s);
            }
        }

        let mut to_wake = None;
        {
            let ibuf_empty = self.ibuf.is_empty();
            let errored = self.flags.contains(H1cFlags::CS_ERROR);
            if let Some(h1s) = &mut self.h1s {
                if errored {
                    if h1s.cs_flags.contains(CsFlags::ERR_PENDING) && ibuf_empty {
                        h1s.cs_flags.remove(CsFlags::ERR_PENDING);
                        h1s.cs_flags |= CsFlags::ERROR;
                    }
                    if !h1s.cs_flags.intersects(CsFlags::ERROR | CsFlags::ERR_PENDING) {
                        h1s.cs_flags |= CsFlags::ERROR;
                    }
                }
                if !ibuf_empty {
                    h1s.cs_flags |= CsFlags::RCV_MORE;
                }
                if h1s.flags.contains(H1sFlags::REOS) && ibuf_empty {
                    h1s.cs_flags |= CsFlags::EOS;
                }
                if received > 0
                    || h1s.flags.contains(H1sFlags::REOS)
                    || h1s.cs_flags.intersects(CsFlags::ERROR | CsFlags::ERR_PENDING)
                {
                    to_wake = Some(h1s.cs);
                }
            }
        }
        if let Some(cs) = to_wake {
            self.wake_subs_recv();
            up.wake(cs);
        }

        self.send();
        self.refresh_timeout();

        !(self.flags.contains(H1cFlags::CS_ERROR) && self.h1s.is_none())
    }

    fn rcv_buf(&mut self, cs: CsHandle, htx: &mut Htx, _count: usize) -> usize {
        if !self.valid(cs) {
            return 0;
        }
        if self.ibuf.contig_data() < self.ibuf.data() {
            self.ibuf.slow_realign(&mut self.scratch);
        }
        let (consumed, res, state_before) = {
            let h1s = self.h1s.as_mut().unwrap();
            let input = self.ibuf.data_slices().0;
            let before = h1s.rx.state;
            let res = h1s.rx.parse(input, htx);
            (*res.as_ref().unwrap_or(&0), res, before)
        };

        self.ibuf.del(consumed);
        if consumed > 0 {
            self.flags.remove(H1cFlags::IN_FULL);
        }

        let front = self.front;
        let opts_ptr = self.opts.clone();
        let h1s = self.h1s.as_mut().unwrap();

        match res {
            Err(_) => {
                h1s.flags |=
                    if front { H1sFlags::REQ_ERROR } else { H1sFlags::RES_ERROR };
                h1s.cs_flags |= CsFlags::EOI | CsFlags::ERROR;
                self.flags |= H1cFlags::CS_ERROR;
                // snapshot what we could not parse
                let mut snap = vec![0u8; self.ibuf.data().min(256)];
                let n = self.ibuf.peek_at(0, &mut snap);
                snap.truncate(n);
                self.pending_capture = Some(snap);
                0
            }
            Ok(_) => {
                // the headers decide the connection mode once, each side
                // with its own option set
                if state_before == H1mState::Before && h1s.rx.state != H1mState::Before {
                    if front {
                        Self::set_cli_conn_mode(h1s, &opts_ptr);
                    } else {
                        Self::set_srv_conn_mode(h1s, &opts_ptr);
                    }
                }
                if h1s.rx.state == H1mState::Done {
                    h1s.flags |= H1sFlags::PARSING_DONE;
                    h1s.cs_flags |= CsFlags::EOI;
                }
                if h1s.flags.contains(H1sFlags::REOS) && self.ibuf.is_empty() {
                    let _ = h1s.rx.report_eos(htx);
                    h1s.cs_flags |= CsFlags::EOS;
                }
                if self.ibuf.is_empty() {
                    h1s.cs_flags.remove(CsFlags::RCV_MORE);
                }
                consumed
            }
        }
    }

    fn snd_buf(&mut self, cs: CsHandle, htx: &mut Htx) -> usize {
        if !self.valid(cs) {
            return 0;
        }
        self.alloc_bufs();
        if self.obuf.is_null() {
            return 0;
        }
        let mut sent = 0usize;

        while let Some(blk) = htx.pop() {
            let ok = match &blk {
                HtxBlock::ResSl(sl) | HtxBlock::ReqSl(sl) => {
                    self.begin_message(sl, matches!(blk, HtxBlock::ResSl(_)))
                }
                HtxBlock::Hdr { name, value } => self.put_header(name, value),
                HtxBlock::Eoh => self.finish_headers(),
                HtxBlock::Data(d) => {
                    let n = self.put_data(d);
                    if n == d.len() {
                        sent += n;
                        true
                    } else {
                        // partial write: requeue the remainder
                        sent += n;
                        htx.push_front(HtxBlock::Data(d[n..].to_vec()));
                        false
                    }
                }
                HtxBlock::Tlr { name, value } => self.put_trailer(name, value),
                HtxBlock::Eot => self.finish_trailers(),
                HtxBlock::Eom => self.finish_message(),
            };
            if !ok {
                if !matches!(blk, HtxBlock::Data(_)) {
                    htx.push_front(blk);
                }
                self.flags |= H1cFlags::OUT_FULL;
                break;
            }
        }

        self.send();
        sent
    }

    fn cs_flags(&self, cs: CsHandle) -> CsFlags {
        if !self.valid(cs) {
            return CsFlags::ERROR;
        }
        self.h1s.as_ref().unwrap().cs_flags
    }

    fn subscribe(&mut self, cs: CsHandle, events: SubEvents, tasklet: &TaskRef) {
        if !self.valid(cs) {
            return;
        }
        let data_ready = !self.ibuf.is_empty();
        let room = !self.flags.contains(H1cFlags::OUT_FULL);
        let h1s = self.h1s.as_mut().unwrap();
        if events & sub::RETRY_RECV != 0 {
            if data_ready {
                if let Some(sched) = &self.sched {
                    sched.tasklet_wakeup(tasklet);
                }
            } else {
                h1s.subs_recv = Some(tasklet.clone());
            }
        }
        if events & sub::RETRY_SEND != 0 {
            if room {
                if let Some(sched) = &self.sched {
                    sched.tasklet_wakeup(tasklet);
                }
            } else {
                h1s.subs_send = Some(tasklet.clone());
            }
        }
    }

    fn unsubscribe(&mut self, cs: CsHandle, events: SubEvents) {
        if !self.valid(cs) {
            return;
        }
        let h1s = self.h1s.as_mut().unwrap();
        if events & sub::RETRY_RECV != 0 {
            h1s.subs_recv = None;
        }
        if events & sub::RETRY_SEND != 0 {
            h1s.subs_send = None;
        }
    }

    fn shutr(&mut self, cs: CsHandle, _mode: ShutrMode) {
        if !self.valid(cs) {
            return;
        }
        let h1s = self.h1s.as_mut().unwrap();
        h1s.cs_flags |= CsFlags::SHR;
    }

    fn shutw(&mut self, cs: CsHandle, mode: ShutwMode) {
        if !self.valid(cs) {
            return;
        }
        let h1s = self.h1s.as_mut().unwrap();
        if h1s.cs_flags.contains(CsFlags::SHW) {
            return;
        }
        h1s.cs_flags |= CsFlags::SHW;
        if mode == ShutwMode::Silent {
            self.conn.shutw(false);
            self.flags |= H1cFlags::CS_SHUTDOWN;
        } else {
            self.flags |= H1cFlags::CS_SHUTW_NOW;
            self.maybe_finish_shut();
        }
    }

    fn detach(&mut self, cs: CsHandle) -> bool {
        if !self.valid(cs) {
            return false;
        }
        let h1s = self.h1s.take().unwrap();
        self.epoch += 1;

        let clean_kal = h1s.flags.contains(H1sFlags::WANT_KAL)
            && h1s.flags.contains(H1sFlags::PARSING_DONE)
            && h1s.out_state == OutState::Done
            && !h1s.flags.intersects(H1sFlags::ERROR | H1sFlags::REQ_ERROR | H1sFlags::RES_ERROR)
            && !self.flags.intersects(H1cFlags::CS_ERROR | H1cFlags::CS_SHUTDOWN);

        if clean_kal {
            self.flags |= H1cFlags::WAIT_NEXT_REQ | H1cFlags::CS_IDLE;
            self.refresh_timeout();
            debug!("stream detached, connection kept for reuse");
            return false;
        }
        true
    }

    fn attach(&mut self) -> Option<CsHandle> {
        if self.front || self.flags.contains(H1cFlags::CS_SHUTDOWN) {
            return None;
        }
        if self.h1s.is_none() {
            self.h1s = Some(H1s::new(CsHandle::new(0, self.epoch), false, true));
        }
        self.h1s.as_ref().map(|s| s.cs)
    }

    fn destroy(&mut self) {
        self.h1s = None;
        self.epoch += 1;
        self.flags |= H1cFlags::CS_SHUTDOWN;
        self.conn.shutw(false);
    }

    fn first_cs(&self) -> Option<CsHandle> {
        self.h1s.as_ref().map(|s| s.cs)
    }

    fn cs_info(&self, cs: CsHandle) -> Option<CsInfo> {
        if !self.valid(cs) {
            return None;
        }
        Some(CsInfo { create_t: self.h1s.as_ref().unwrap().created })
    }

    fn ctl(&self, op: MuxCtl) -> u32 {
        match op {
            MuxCtl::Status => {
                if self.conn.handshaking() || self.conn.is_errored() {
                    0
                } else {
                    MUX_STATUS_READY
                }
            }
        }
    }

    fn avail_streams(&self) -> u32 {
        u32::from(self.h1s.is_none() && !self.flags.contains(H1cFlags::CS_SHUTDOWN))
    }

    fn used_streams(&self) -> u32 {
        u32::from(self.h1s.is_some())
    }

    fn next_expire(&self) -> Tick {
        self.expire
    }

    fn timeout_fired(&mut self, now: Tick) -> bool {
        if !self.expire.is_expired(now) {
            return false;
        }
        if let Some(h1s) = &mut self.h1s {
            h1s.flags |= H1sFlags::ERROR;
            h1s.cs_flags |= CsFlags::ERROR;
            self.flags |= H1cFlags::CS_ERROR;
            false
        } else {
            true
        }
    }

    fn takeover(&mut self, tab: &strand_sched::FdTab, new_tid: usize) -> bool {
        if !tab.takeover(self.conn.fd(), new_tid) {
            self.conn.flags |= ConnFlags::ERROR;
            return false;
        }
        true
    }

    fn show_fd(&self) -> String {
        format!(
            "h1c.flags={:#x} ibuf={}/{} obuf={}/{} h1s={}",
            self.flags.bits(),
            self.ibuf.data(),
            self.ibuf.size(),
            self.obuf.data(),
            self.obuf.size(),
            self.h1s.as_ref().map_or(0, |_| 1),
        )
    }
}

impl Drop for H1Mux {
    fn drop(&mut self) {
        // hand budgeted buffers back so parked connections get a turn
        if let Some((db, _)) = self.dynbuf.take() {
            if !self.ibuf.is_null() {
                db.release(std::mem::replace(&mut self.ibuf, Buffer::null()));
            }
            if !self.obuf.is_null() {
                db.release(std::mem::replace(&mut self.obuf, Buffer::null()));
            }
        }
    }
}

impl H1Mux {
    fn begin_message(&mut self, sl: &StartLine, response: bool) -> bool {
        let line = if response {
            let mut v = Vec::with_capacity(64);
            v.extend_from_slice(sl.res_vsn());
            v.push(b' ');
            v.extend_from_slice(format!("{}", sl.status()).as_bytes());
            v.push(b' ');
            v.extend_from_slice(sl.reason());
            v.extend_from_slice(b"\r\n");
            v
        } else {
            let mut v = Vec::with_capacity(64);
            v.extend_from_slice(sl.meth());
            v.push(b' ');
            v.extend_from_slice(sl.uri());
            v.push(b' ');
            v.extend_from_slice(sl.req_vsn());
            v.extend_from_slice(b"\r\n");
            v
        };
        if self.obuf.put_full(&line).is_err() {
            return false;
        }
        let status = if response { sl.status() } else { 0 };
        let h1s = self.h1s.as_mut().unwrap();
        h1s.out_state = OutState::Hdrs;
        h1s.out_chunked = false;
        h1s.out_trailers = false;
        h1s.out_response = response;
        h1s.out_flags = sl.flags;
        h1s.out_status = status;
        h1s.flags.remove(H1sFlags::HAVE_O_CONN | H1sFlags::OUT_CONN_CLO);
        if response && self.front {
            Self::update_mode_on_response(h1s, status);
        }
        true
    }

    fn put_header(&mut self, name: &[u8], value: &[u8]) -> bool {
        // headers owned by the connection-mode policy are re-emitted at
        // EOH; an explicit close token still drives the decision there
        if name.eq_ignore_ascii_case(b"connection") {
            if Ist(value).has_token(b"close") {
                self.h1s.as_mut().unwrap().flags |= H1sFlags::OUT_CONN_CLO;
            }
            return true;
        }
        if name.eq_ignore_ascii_case(b"proxy-connection")
            || name.eq_ignore_ascii_case(b"keep-alive")
            || name.eq_ignore_ascii_case(b"transfer-encoding")
        {
            return true;
        }
        let adjusted = self.case_adjust(name);
        let mut line = Vec::with_capacity(adjusted.len() + value.len() + 4);
        line.extend_from_slice(&adjusted);
        line.extend_from_slice(b": ");
        line.extend_from_slice(value);
        line.extend_from_slice(b"\r\n");
        self.obuf.put_full(&line).is_ok()
    }

    fn finish_headers(&mut self) -> bool {
        let front = self.front;
        let fake_ka = self.opts.h1.fake_ka;
        let httpclose = self.opts.h1.httpclose;
        let stopping = self.opts.stopping;
        let srv_name = self.opts.h1.server_name_hdr.clone();
        let h1s = self.h1s.as_mut().unwrap();

        // the response itself may veto keep-alive: unknown length, an
        // explicit close token, or the close options
        if front
            && h1s.out_response
            && !h1s.flags.contains(H1sFlags::WANT_TUN)
            && (!h1s.out_flags.contains(SlFlags::XFER_LEN)
                || h1s.flags.contains(H1sFlags::OUT_CONN_CLO)
                || httpclose
                || stopping)
        {
            h1s.flags.remove(H1sFlags::WANT_KAL);
            h1s.flags |= H1sFlags::WANT_CLO;
        }

        let mut extra = Vec::with_capacity(64);

        // Connection header per the mode decision, once per message
        if !h1s.flags.contains(H1sFlags::HAVE_O_CONN)
            && !h1s.flags.contains(H1sFlags::WANT_TUN)
        {
            let peer_11 = h1s.out_flags.contains(SlFlags::VER_11);
            if h1s.flags.contains(H1sFlags::WANT_CLO) {
                if fake_ka {
                    extra.extend_from_slice(b"connection: keep-alive\r\n");
                } else if peer_11 {
                    extra.extend_from_slice(b"connection: close\r\n");
                }
            } else if h1s.flags.contains(H1sFlags::WANT_KAL) && !peer_11 {
                extra.extend_from_slice(b"connection: keep-alive\r\n");
            }
            h1s.flags |= H1sFlags::HAVE_O_CONN;
        }

        // restore framing: explicit chunking when the length is unknown
        let bodyless = h1s.out_flags.contains(SlFlags::BODYLESS)
            || (100..200).contains(&h1s.out_status);
        if h1s.out_flags.contains(SlFlags::CHNK)
            || (!h1s.out_flags.contains(SlFlags::XFER_LEN)
                && h1s.out_flags.contains(SlFlags::VER_11)
                && !bodyless
                && !h1s.flags.contains(H1sFlags::WANT_TUN))
        {
            extra.extend_from_slice(b"transfer-encoding: chunked\r\n");
            h1s.out_chunked = true;
        }

        if !front
            && !h1s.flags.contains(H1sFlags::HAVE_SRV_NAME)
            && let Some(name) = srv_name
        {
            extra.extend_from_slice(b"x-served-by: ");
            extra.extend_from_slice(name.as_bytes());
            extra.extend_from_slice(b"\r\n");
            h1s.flags |= H1sFlags::HAVE_SRV_NAME;
        }

        extra.extend_from_slice(b"\r\n");
        if self.obuf.put_full(&extra).is_err() {
            return false;
        }
        self.h1s.as_mut().unwrap().out_state = OutState::Body;
        true
    }

    fn put_data(&mut self, data: &[u8]) -> usize {
        let chunked = self.h1s.as_ref().unwrap().out_chunked;
        if data.is_empty() {
            return 0;
        }
        if chunked {
            // a chunk is all-or-nothing: size line, payload, CRLF
            let head = format!("{:x}\r\n", data.len());
            let need = head.len() + data.len() + 2;
            if self.obuf.room() < need {
                return 0;
            }
            let _ = self.obuf.put_full(head.as_bytes());
            let _ = self.obuf.put_full(data);
            let _ = self.obuf.put_full(b"\r\n");
            data.len()
        } else {
            self.obuf.put(data)
        }
    }

    fn put_trailer(&mut self, name: &[u8], value: &[u8]) -> bool {
        let adjusted = self.case_adjust(name);
        let h1s = self.h1s.as_mut().unwrap();
        if !h1s.out_chunked {
            // trailers cannot exist without chunking; drop them
            return true;
        }
        let open_block = !h1s.out_trailers;
        h1s.out_trailers = true;
        let mut line = Vec::with_capacity(adjusted.len() + value.len() + 8);
        if open_block {
            line.extend_from_slice(b"0\r\n");
        }
        line.extend_from_slice(&adjusted);
        line.extend_from_slice(b": ");
        line.extend_from_slice(value);
        line.extend_from_slice(b"\r\n");
        if self.obuf.put_full(&line).is_err() {
            self.h1s.as_mut().unwrap().out_trailers = !open_block;
            return false;
        }
        true
    }

    fn finish_trailers(&mut self) -> bool {
        let h1s = self.h1s.as_mut().unwrap();
        if !h1s.out_chunked {
            return true;
        }
        let blob: &[u8] = if h1s.out_trailers { b"\r\n" } else { b"0\r\n\r\n" };
        if self.obuf.put_full(blob).is_err() {
            return false;
        }
        self.h1s.as_mut().unwrap().out_state = OutState::Trailers;
        true
    }

    fn finish_message(&mut self) -> bool {
        let h1s = self.h1s.as_mut().unwrap();
        if h1s.out_chunked && h1s.out_state == OutState::Body {
            // no trailer block was emitted; close the chunk stream here
            if self.obuf.put_full(b"0\r\n\r\n").is_err() {
                return false;
            }
        }
        let h1s = self.h1s.as_mut().unwrap();
        h1s.out_state = OutState::Done;

        if h1s.flags.contains(H1sFlags::WANT_CLO) {
            self.flags |= H1cFlags::CS_SHUTW_NOW;
        } else if h1s.flags.contains(H1sFlags::WANT_TUN) {
            h1s.rx.state = H1mState::Tunnel;
        }
        true
    }
}
