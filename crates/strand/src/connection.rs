use std::net::SocketAddr;

use bitflags::bitflags;
use strand_buf::Buffer;
use strand_sched::{Scheduler, TaskRef};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    proxy_hdr::{self, PpError, V2Tlvs},
    socks4,
    xprt::{Transport, XprtResult},
};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConnFlags: u32 {
        /// Fatal transport or handshake error.
        const ERROR        = 0x0000_0001;
        /// Socket shut for reads.
        const SOCK_RD_SH   = 0x0000_0002;
        /// Socket shut for writes.
        const SOCK_WR_SH   = 0x0000_0004;
        /// Outgoing connect not yet acknowledged by the kernel.
        const WAIT_L4_CONN = 0x0000_0008;
        /// Transport handshake (eg. TLS) still running.
        const WAIT_XPRT    = 0x0000_0010;
        /// Incoming side must parse a PROXY header first.
        const ACCEPT_PROXY = 0x0000_0020;
        /// Incoming side must parse a NetScaler CIP header first.
        const ACCEPT_CIP   = 0x0000_0040;
        /// A PROXY header was received and applied.
        const RCVD_PROXY   = 0x0000_0080;
        /// Outgoing side must emit a PROXY header.
        const SEND_PROXY   = 0x0000_0100;
        /// Outgoing side must run the SOCKS4 request step.
        const SOCKS4_SEND  = 0x0000_0200;
        /// Outgoing side must await the SOCKS4 reply.
        const SOCKS4_RECV  = 0x0000_0400;
        /// Connection may not be shared across sessions.
        const PRIVATE      = 0x0000_0800;
        /// Counted as idle in its session.
        const SESS_IDLE    = 0x0000_1000;
        /// Source address is authoritative.
        const ADDR_FROM_SET = 0x0000_2000;
        /// Destination address is authoritative.
        const ADDR_TO_SET  = 0x0000_4000;
        /// Parked in the idle list.
        const LIST_IDLE    = 0x0000_8000;
        /// Parked in the safe-to-reuse list.
        const LIST_SAFE    = 0x0001_0000;
    }
}

/// Handshake diagnostic codes, one per observable failure cause.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrCode {
    #[default]
    None,
    PrxEmpty,
    PrxAbort,
    PrxTruncated,
    PrxNotHdr,
    PrxBadHdr,
    PrxBadProto,
    CipEmpty,
    CipAbort,
    CipTruncated,
    CipBadMagic,
    CipBadProto,
    Socks4Send,
    Socks4Recv,
    Socks4Deny,
    Socks4Abort,
    XprtErr,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnError {
    #[error("handshake failed: {0:?}")]
    Handshake(ErrCode),
    #[error("transport error (errno {0})")]
    Transport(i32),
}

/// Subscription event bits.
pub mod sub {
    pub const RETRY_RECV: u32 = 0x01;
    pub const RETRY_SEND: u32 = 0x02;
}

pub type SubEvents = u32;

/// The single-slot subscription a lower layer holds for its upper layer.
#[derive(Clone)]
pub struct WaitEvent {
    pub events: SubEvents,
    pub tasklet: TaskRef,
}

/// Progress of the pre-application handshake pipeline.
#[derive(Debug, PartialEq, Eq)]
pub enum HsProgress {
    /// All configured handshakes completed; application data may flow.
    Done,
    /// Blocked on io; retry on the next read/write readiness.
    Pending,
}

/// A connection: one socket, one transport stack, the handshake pipeline,
/// and the single-subscriber wait slot the mux parks itself in.
pub struct Connection {
    fd: i32,
    pub flags: ConnFlags,
    pub err_code: ErrCode,
    xprt: Box<dyn Transport>,
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
    /// ALPN protocol negotiated by the transport, if any.
    pub alpn: Option<Vec<u8>>,
    pub proxy_authority: Option<Vec<u8>>,
    pub proxy_unique_id: Option<Vec<u8>>,
    subs: Option<WaitEvent>,
    /// PROXY/SOCKS4 emission progress: 1 = not started, negative = bytes
    /// still to send, 0 = sent.
    send_proxy_ofs: i64,
    send_proxy_v2: bool,
    pending_hs: Vec<u8>,
    /// NetScaler magic expected when ACCEPT_CIP is set.
    pub cip_magic: u32,
    sched: Option<std::sync::Arc<Scheduler>>,
}

impl Connection {
    pub fn new(fd: i32, xprt: Box<dyn Transport>, flags: ConnFlags) -> Self {
        Self {
            fd,
            flags,
            err_code: ErrCode::None,
            xprt,
            src: None,
            dst: None,
            alpn: None,
            proxy_authority: None,
            proxy_unique_id: None,
            subs: None,
            send_proxy_ofs: 1,
            send_proxy_v2: false,
            pending_hs: Vec::new(),
            cip_magic: 0,
            sched: None,
        }
    }

    pub fn set_sched(&mut self, sched: std::sync::Arc<Scheduler>) {
        self.sched = Some(sched);
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn xprt_name(&self) -> &'static str {
        self.xprt.name()
    }

    /// Concrete transport access for test harnesses.
    pub fn xprt_any(&mut self) -> &mut dyn std::any::Any {
        self.xprt.as_any_mut()
    }

    #[inline]
    pub fn is_errored(&self) -> bool {
        self.flags.contains(ConnFlags::ERROR)
    }

    /// Handshakes still standing between the socket and application data.
    pub fn handshaking(&self) -> bool {
        self.flags.intersects(
            ConnFlags::WAIT_L4_CONN
                | ConnFlags::WAIT_XPRT
                | ConnFlags::ACCEPT_PROXY
                | ConnFlags::ACCEPT_CIP
                | ConnFlags::SEND_PROXY
                | ConnFlags::SOCKS4_SEND
                | ConnFlags::SOCKS4_RECV,
        )
    }

    // -- subscription ------------------------------------------------------

    /// Registers the single subscriber. Asking for an event that is already
    /// available wakes the tasklet immediately instead of parking it.
    pub fn subscribe(&mut self, events: SubEvents, we: WaitEvent) {
        match &mut self.subs {
            Some(cur) => {
                debug_assert!(std::sync::Arc::ptr_eq(&cur.tasklet, &we.tasklet));
                cur.events |= events;
            }
            None => self.subs = Some(WaitEvent { events, tasklet: we.tasklet }),
        }
    }

    pub fn unsubscribe(&mut self, events: SubEvents) {
        if let Some(cur) = &mut self.subs {
            cur.events &= !events;
            if cur.events == 0 {
                self.subs = None;
            }
        }
    }

    pub fn subscribed(&self) -> SubEvents {
        self.subs.as_ref().map_or(0, |s| s.events)
    }

    /// Fires the subscriber for `events` and clears those bits.
    pub fn notify(&mut self, events: SubEvents) {
        let Some(cur) = &mut self.subs else { return };
        if cur.events & events == 0 {
            return;
        }
        cur.events &= !events;
        let tasklet = cur.tasklet.clone();
        if cur.events == 0 {
            self.subs = None;
        }
        if let Some(sched) = &self.sched {
            sched.tasklet_wakeup(&tasklet);
        }
    }

    // -- transport passthrough --------------------------------------------

    pub fn rcv_buf(&mut self, buf: &mut Buffer, count: usize) -> XprtResult {
        let r = self.xprt.rcv_buf(self.fd, buf, count);
        match &r {
            XprtResult::Closed => self.flags |= ConnFlags::SOCK_RD_SH,
            XprtResult::Error(_) => {
                self.flags |= ConnFlags::ERROR;
                self.err_code = ErrCode::XprtErr;
            }
            _ => {}
        }
        r
    }

    pub fn snd_buf(&mut self, buf: &mut Buffer, count: usize) -> XprtResult {
        let r = self.xprt.snd_buf(self.fd, buf, count);
        if let XprtResult::Error(_) = &r {
            self.flags |= ConnFlags::ERROR;
            self.err_code = ErrCode::XprtErr;
        }
        r
    }

    /// Probes a pending non-blocking connect: clears `WAIT_L4_CONN` once the
    /// kernel reports the socket connected, flags the error otherwise.
    pub fn fd_check(&mut self) -> Result<bool, ConnError> {
        if !self.flags.contains(ConnFlags::WAIT_L4_CONN) {
            return Ok(true);
        }
        if self.fd < 0 {
            // memory transports have no L4 layer
            self.flags.remove(ConnFlags::WAIT_L4_CONN);
            return Ok(true);
        }
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let r = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                std::ptr::addr_of_mut!(err).cast(),
                &mut len,
            )
        };
        if r != 0 {
            return Err(self.fail_xprt(libc::EBADF));
        }
        match err {
            0 => {
                self.flags.remove(ConnFlags::WAIT_L4_CONN);
                Ok(true)
            }
            libc::EINPROGRESS | libc::EALREADY => Ok(false),
            e => Err(self.fail_xprt(e)),
        }
    }

    /// Swallows pending input so an abortive close does not trigger a reset
    /// before our last bytes leave. True once the read side is dry.
    pub fn sock_drain(&mut self) -> bool {
        let mut sink = [0u8; 1024];
        loop {
            match self.xprt.peek(self.fd, &mut sink) {
                XprtResult::Bytes(n) => {
                    if let XprtResult::Error(_) = self.xprt.drain(self.fd, n) {
                        self.flags |= ConnFlags::SOCK_RD_SH;
                        return true;
                    }
                }
                XprtResult::Closed => {
                    self.flags |= ConnFlags::SOCK_RD_SH;
                    return true;
                }
                XprtResult::WouldBlock => return false,
                XprtResult::Error(_) => {
                    self.flags |= ConnFlags::SOCK_RD_SH;
                    return true;
                }
            }
        }
    }

    /// Half-close of the write side; silent mode aborts lingering.
    pub fn shutw(&mut self, clean: bool) {
        if self.flags.contains(ConnFlags::SOCK_WR_SH) {
            return;
        }
        self.flags |= ConnFlags::SOCK_WR_SH;
        self.xprt.shutw(self.fd, clean);
    }

    // -- handshake pipeline ------------------------------------------------

    /// Advances every configured handshake as far as io allows.
    pub fn handshake(&mut self) -> Result<HsProgress, ConnError> {
        if self.flags.contains(ConnFlags::ACCEPT_CIP) {
            match self.recv_cip()? {
                HsProgress::Pending => return Ok(HsProgress::Pending),
                HsProgress::Done => {}
            }
        }
        if self.flags.contains(ConnFlags::ACCEPT_PROXY) {
            match self.recv_proxy()? {
                HsProgress::Pending => return Ok(HsProgress::Pending),
                HsProgress::Done => {}
            }
        }
        if self.flags.contains(ConnFlags::SOCKS4_SEND) {
            match self.send_socks4()? {
                HsProgress::Pending => return Ok(HsProgress::Pending),
                HsProgress::Done => {}
            }
        }
        if self.flags.contains(ConnFlags::SOCKS4_RECV) {
            match self.recv_socks4()? {
                HsProgress::Pending => return Ok(HsProgress::Pending),
                HsProgress::Done => {}
            }
        }
        if self.flags.contains(ConnFlags::SEND_PROXY) {
            match self.send_proxy_line()? {
                HsProgress::Pending => return Ok(HsProgress::Pending),
                HsProgress::Done => {}
            }
        }
        if self.flags.contains(ConnFlags::WAIT_XPRT) {
            match self.xprt.handshake(self.fd) {
                Ok(true) => self.flags.remove(ConnFlags::WAIT_XPRT),
                Ok(false) => return Ok(HsProgress::Pending),
                Err(e) => return Err(self.fail_xprt(e)),
            }
        }
        Ok(HsProgress::Done)
    }

    fn fail(&mut self, code: ErrCode) -> ConnError {
        self.flags |= ConnFlags::ERROR;
        if self.err_code == ErrCode::None {
            self.err_code = code;
        }
        ConnError::Handshake(self.err_code)
    }

    fn fail_xprt(&mut self, errno: i32) -> ConnError {
        self.flags |= ConnFlags::ERROR;
        self.err_code = ErrCode::XprtErr;
        ConnError::Transport(errno)
    }

    /// Peeks the leading bytes of the stream; handshake parsers must never
    /// consume application data.
    fn peek_head(&mut self, scratch: &mut [u8]) -> Result<Option<usize>, ConnError> {
        match self.xprt.peek(self.fd, scratch) {
            XprtResult::Bytes(n) => {
                self.flags.remove(ConnFlags::WAIT_L4_CONN);
                Ok(Some(n))
            }
            XprtResult::WouldBlock => Ok(None),
            XprtResult::Closed => Ok(Some(0)),
            XprtResult::Error(e) => Err(self.fail_xprt(e)),
        }
    }

    fn recv_proxy(&mut self) -> Result<HsProgress, ConnError> {
        let mut scratch = [0u8; 512];
        let Some(n) = self.peek_head(&mut scratch)? else {
            return Ok(HsProgress::Pending);
        };
        if n == 0 {
            return Err(self.fail(ErrCode::PrxEmpty));
        }

        let hdr = match proxy_hdr::parse(&scratch[..n]) {
            Ok(Some(hdr)) => hdr,
            // incomplete; with a peek we can only wait if the segment may
            // still grow
            Ok(None) => {
                if n == scratch.len() {
                    return Err(self.fail(ErrCode::PrxTruncated));
                }
                return Ok(HsProgress::Pending);
            }
            Err(PpError::NotHeader) => return Err(self.fail(ErrCode::PrxNotHdr)),
            Err(PpError::BadProto) => return Err(self.fail(ErrCode::PrxBadProto)),
            Err(PpError::Truncated) => return Err(self.fail(ErrCode::PrxTruncated)),
            Err(PpError::BadHeader) => return Err(self.fail(ErrCode::PrxBadHdr)),
        };

        if let XprtResult::Error(_) = self.xprt.drain(self.fd, hdr.consumed) {
            self.flags |= ConnFlags::SOCK_RD_SH | ConnFlags::SOCK_WR_SH;
            return Err(self.fail(ErrCode::PrxAbort));
        }

        if hdr.src.is_some() {
            self.src = hdr.src;
            self.dst = hdr.dst;
            self.flags |= ConnFlags::ADDR_FROM_SET | ConnFlags::ADDR_TO_SET;
        }
        self.proxy_authority = hdr.authority;
        self.proxy_unique_id = hdr.unique_id;
        self.flags.remove(ConnFlags::ACCEPT_PROXY);
        self.flags |= ConnFlags::RCVD_PROXY;
        trace!(src = ?self.src, dst = ?self.dst, "proxy header applied");
        Ok(HsProgress::Done)
    }

    fn recv_cip(&mut self) -> Result<HsProgress, ConnError> {
        let mut scratch = [0u8; 512];
        let Some(n) = self.peek_head(&mut scratch)? else {
            return Ok(HsProgress::Pending);
        };
        if n == 0 {
            return Err(self.fail(ErrCode::CipEmpty));
        }

        let hdr = match proxy_hdr::parse_cip(&scratch[..n], self.cip_magic) {
            Ok(Some(hdr)) => hdr,
            Ok(None) => {
                if n == scratch.len() {
                    return Err(self.fail(ErrCode::CipTruncated));
                }
                return Ok(HsProgress::Pending);
            }
            Err(PpError::NotHeader) => return Err(self.fail(ErrCode::CipBadMagic)),
            Err(_) => return Err(self.fail(ErrCode::CipBadProto)),
        };

        if let XprtResult::Error(_) = self.xprt.drain(self.fd, hdr.consumed) {
            self.flags |= ConnFlags::SOCK_RD_SH | ConnFlags::SOCK_WR_SH;
            return Err(self.fail(ErrCode::CipAbort));
        }

        self.src = hdr.src;
        self.dst = hdr.dst;
        self.flags |= ConnFlags::ADDR_FROM_SET | ConnFlags::ADDR_TO_SET;
        self.flags.remove(ConnFlags::ACCEPT_CIP);
        Ok(HsProgress::Done)
    }

    /// Sends a pre-built handshake blob, tracking partial progress in
    /// `send_proxy_ofs` (negative = remaining bytes).
    fn send_pending(&mut self, build: impl FnOnce(&Self) -> Vec<u8>) -> Result<bool, ()> {
        if self.send_proxy_ofs > 0 {
            self.pending_hs = build(self);
            self.send_proxy_ofs = -(self.pending_hs.len() as i64);
        }
        if self.send_proxy_ofs < 0 {
            let total = self.pending_hs.len();
            let start = total - (-self.send_proxy_ofs as usize);
            let mut buf = Buffer::with_capacity(total - start);
            buf.put(&self.pending_hs[start..]);
            match self.xprt.snd_buf(self.fd, &mut buf, total - start) {
                XprtResult::Bytes(n) => {
                    self.send_proxy_ofs += n as i64;
                }
                XprtResult::WouldBlock => return Ok(false),
                XprtResult::Closed | XprtResult::Error(_) => return Err(()),
            }
        }
        Ok(self.send_proxy_ofs == 0)
    }

    /// PROXY v1/v2 emission configuration.
    pub fn set_send_proxy(&mut self, v2: bool) {
        self.flags |= ConnFlags::SEND_PROXY;
        self.send_proxy_v2 = v2;
    }

    fn send_proxy_line(&mut self) -> Result<HsProgress, ConnError> {
        let done = self.send_pending(|c| {
            if c.send_proxy_v2 {
                proxy_hdr::make_v2(
                    c.src,
                    c.dst,
                    &V2Tlvs {
                        authority: c.proxy_authority.as_deref(),
                        unique_id: c.proxy_unique_id.as_deref(),
                        crc32c: true,
                        ..Default::default()
                    },
                )
            } else {
                proxy_hdr::make_v1(c.src, c.dst)
            }
        });
        match done {
            Err(_) => Err(self.fail(ErrCode::PrxAbort)),
            Ok(false) => Ok(HsProgress::Pending),
            Ok(true) => {
                self.flags.remove(ConnFlags::SEND_PROXY);
                self.flags.remove(ConnFlags::WAIT_L4_CONN);
                debug!("proxy header sent");
                Ok(HsProgress::Done)
            }
        }
    }

    fn send_socks4(&mut self) -> Result<HsProgress, ConnError> {
        let Some(dst) = self.dst else {
            return Err(self.fail(ErrCode::Socks4Send));
        };
        let Some(req) = socks4::make_request(dst) else {
            return Err(self.fail(ErrCode::Socks4Send));
        };
        match self.send_pending(|_| req.to_vec()) {
            Err(_) => Err(self.fail(ErrCode::Socks4Send)),
            Ok(false) => Ok(HsProgress::Pending),
            Ok(true) => {
                self.flags.remove(ConnFlags::SOCKS4_SEND);
                self.flags.remove(ConnFlags::WAIT_L4_CONN);
                // the emission offset is reused by a later PROXY header
                if self.flags.contains(ConnFlags::SEND_PROXY) {
                    self.send_proxy_ofs = 1;
                }
                Ok(HsProgress::Done)
            }
        }
    }

    fn recv_socks4(&mut self) -> Result<HsProgress, ConnError> {
        let mut scratch = [0u8; socks4::RSP_LEN];
        let Some(n) = self.peek_head(&mut scratch)? else {
            return Ok(HsProgress::Pending);
        };
        if n == 0 {
            return Err(self.fail(ErrCode::Socks4Recv));
        }
        match socks4::parse_reply(&scratch[..n]) {
            socks4::Socks4Reply::NeedMore => Ok(HsProgress::Pending),
            socks4::Socks4Reply::Denied(_) => {
                self.flags.remove(ConnFlags::SOCKS4_RECV);
                Err(self.fail(ErrCode::Socks4Deny))
            }
            socks4::Socks4Reply::Granted => {
                if let XprtResult::Error(_) = self.xprt.drain(self.fd, socks4::RSP_LEN) {
                    self.flags |= ConnFlags::SOCK_RD_SH | ConnFlags::SOCK_WR_SH;
                    return Err(self.fail(ErrCode::Socks4Abort));
                }
                self.flags.remove(ConnFlags::SOCKS4_RECV);
                Ok(HsProgress::Done)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::xprt::MemTransport;

    fn mem_conn(input: &[u8], flags: ConnFlags) -> Connection {
        Connection::new(-1, Box::new(MemTransport::with_input(input)), flags)
    }

    #[test]
    fn accept_proxy_v1_sets_addresses() {
        let mut conn = mem_conn(
            b"PROXY TCP4 192.0.2.1 198.51.100.2 56324 443\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n",
            ConnFlags::ACCEPT_PROXY,
        );
        assert_eq!(conn.handshake().unwrap(), HsProgress::Done);
        assert_eq!(conn.src.unwrap(), "192.0.2.1:56324".parse().unwrap());
        assert_eq!(conn.dst.unwrap(), "198.51.100.2:443".parse().unwrap());
        assert!(conn.flags.contains(ConnFlags::RCVD_PROXY));
        assert!(!conn.handshaking());

        // application bytes stay untouched for the mux
        let mut buf = Buffer::with_capacity(128);
        conn.rcv_buf(&mut buf, 128);
        let mut data = vec![0u8; buf.data()];
        buf.get(&mut data);
        assert_eq!(data, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    }

    #[test]
    fn accept_proxy_waits_for_more() {
        let mut conn = mem_conn(b"PROXY TCP4 192.0", ConnFlags::ACCEPT_PROXY);
        assert_eq!(conn.handshake().unwrap(), HsProgress::Pending);
        assert!(conn.handshaking());
    }

    #[test]
    fn accept_proxy_requires_header() {
        let mut conn = mem_conn(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", ConnFlags::ACCEPT_PROXY);
        assert_eq!(conn.handshake().unwrap_err(), ConnError::Handshake(ErrCode::PrxNotHdr));
        assert!(conn.is_errored());
    }

    #[test]
    fn accept_proxy_empty_peer() {
        let mut conn = mem_conn(b"", ConnFlags::ACCEPT_PROXY);
        // nothing buffered yet: wait
        assert_eq!(conn.handshake().unwrap(), HsProgress::Pending);
        // orderly shutdown instead of a header
        let mut conn = Connection::new(
            -1,
            Box::new(MemTransport { eof: true, ..Default::default() }),
            ConnFlags::ACCEPT_PROXY,
        );
        assert_eq!(conn.handshake().unwrap_err(), ConnError::Handshake(ErrCode::PrxEmpty));
    }

    #[test]
    fn send_proxy_v1_then_done() {
        let mut conn = mem_conn(b"", ConnFlags::SEND_PROXY);
        conn.src = Some("10.0.0.1:4000".parse().unwrap());
        conn.dst = Some("10.0.0.2:80".parse().unwrap());
        assert_eq!(conn.handshake().unwrap(), HsProgress::Done);
        assert!(!conn.flags.contains(ConnFlags::SEND_PROXY));
    }

    #[test]
    fn socks4_pipeline() {
        let mut conn = mem_conn(b"", ConnFlags::SOCKS4_SEND | ConnFlags::SOCKS4_RECV);
        conn.dst = Some("198.51.100.2:443".parse().unwrap());

        // request goes out, reply not here yet
        assert_eq!(conn.handshake().unwrap(), HsProgress::Pending);
        assert!(!conn.flags.contains(ConnFlags::SOCKS4_SEND));
        assert!(conn.flags.contains(ConnFlags::SOCKS4_RECV));

        // feed the granted reply through a fresh transport view
        let mut conn2 = Connection::new(
            -1,
            Box::new(MemTransport::with_input(&[0, 0x5A, 0, 0, 0, 0, 0, 0])),
            ConnFlags::SOCKS4_RECV,
        );
        assert_eq!(conn2.handshake().unwrap(), HsProgress::Done);

        let mut conn3 = Connection::new(
            -1,
            Box::new(MemTransport::with_input(&[0, 0x5B, 0, 0, 0, 0, 0, 0])),
            ConnFlags::SOCKS4_RECV,
        );
        assert_eq!(conn3.handshake().unwrap_err(), ConnError::Handshake(ErrCode::Socks4Deny));
    }

    #[test]
    fn subscribe_single_slot() {
        use strand_sched::{SchedTune, TaskAction};

        let sched = Scheduler::new(1, SchedTune::default());
        let tl = sched
            .tasklet_new(0, std::sync::Arc::new(|_t: &TaskRef, _s: u32| TaskAction::Keep));

        let mut conn = mem_conn(b"", ConnFlags::empty());
        conn.set_sched(sched.clone());
        conn.subscribe(sub::RETRY_RECV, WaitEvent { events: sub::RETRY_RECV, tasklet: tl.clone() });
        conn.subscribe(sub::RETRY_SEND, WaitEvent { events: sub::RETRY_SEND, tasklet: tl.clone() });
        assert_eq!(conn.subscribed(), sub::RETRY_RECV | sub::RETRY_SEND);

        conn.notify(sub::RETRY_RECV);
        assert_eq!(conn.subscribed(), sub::RETRY_SEND);
        assert_eq!(sched.tasks_run_queue(), 1);

        conn.unsubscribe(sub::RETRY_SEND);
        assert_eq!(conn.subscribed(), 0);
    }

    #[test]
    fn shutw_idempotent() {
        let mut conn = mem_conn(b"", ConnFlags::empty());
        conn.shutw(true);
        conn.shutw(true);
        assert!(conn.flags.contains(ConnFlags::SOCK_WR_SH));
    }

    #[test]
    fn drain_swallows_pending_input() {
        let mut conn = mem_conn(b"leftover bytes", ConnFlags::empty());
        assert!(!conn.sock_drain(), "drained but peer still open");
        let mut buf = Buffer::with_capacity(64);
        assert_eq!(conn.rcv_buf(&mut buf, 64), XprtResult::WouldBlock);
    }
}
