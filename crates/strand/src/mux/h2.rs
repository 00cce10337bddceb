use std::{collections::BTreeMap, collections::VecDeque, sync::Arc};

use bitflags::bitflags;
use strand_buf::{BufRing, Buffer, Htx, HtxBlock, SlFlags, StartLine};
use strand_sched::{Scheduler, TaskRef};
use strand_timing::{Tick, now_ms};
use tracing::{debug, trace};

use crate::{
    config::ProxyOpts,
    conn_stream::{CsFlags, CsHandle, StreamLayer},
    connection::{ConnFlags, Connection, HsProgress, SubEvents, sub},
    hpack,
    mux::{MUX_STATUS_READY, Mux, MuxCtl, ShutrMode, ShutwMode},
    xprt::XprtResult,
};

pub const H2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Output ring depth; frames are flushed strictly head to tail.
const MBUF_SLOTS: usize = 32;
/// One-time enlargement of the advertised connection window.
const INITIAL_WINDOW_INCREMENT: u32 = 0x7FFF_FFFF - 65535;

// frame types
const FT_DATA: u8 = 0x0;
const FT_HEADERS: u8 = 0x1;
const FT_PRIORITY: u8 = 0x2;
const FT_RST_STREAM: u8 = 0x3;
const FT_SETTINGS: u8 = 0x4;
const FT_PUSH_PROMISE: u8 = 0x5;
const FT_PING: u8 = 0x6;
const FT_GOAWAY: u8 = 0x7;
const FT_WINDOW_UPDATE: u8 = 0x8;
const FT_CONTINUATION: u8 = 0x9;

// frame flags
const FL_END_STREAM: u8 = 0x01;
const FL_ACK: u8 = 0x01;
const FL_END_HEADERS: u8 = 0x04;
const FL_PADDED: u8 = 0x08;
const FL_PRIORITY: u8 = 0x20;

// settings identifiers
const ST_HEADER_TABLE_SIZE: u16 = 0x1;
const ST_ENABLE_PUSH: u16 = 0x2;
const ST_MAX_CONCURRENT: u16 = 0x3;
const ST_INITIAL_WINDOW: u16 = 0x4;
const ST_MAX_FRAME_SIZE: u16 = 0x5;

/// Wire error codes (RFC 7540 §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum H2Err {
    NoError = 0x0,
    Protocol = 0x1,
    Internal = 0x2,
    FlowControl = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSize = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    Compression = 0x9,
    Connect = 0xA,
    EnhanceYourCalm = 0xB,
    InadequateSecurity = 0xC,
    Http11Required = 0xD,
}

/// Demux automaton states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum H2cState {
    /// Waiting for the client preface (frontend only).
    Preface,
    /// Waiting for the peer's first SETTINGS frame.
    Settings1,
    /// Waiting for a complete frame header.
    FrameH,
    /// Waiting for (and processing) the frame payload.
    FrameP,
    /// Must send an acknowledgement for the processed frame.
    FrameA,
    /// Must send RST_STREAM for the current stream.
    FrameE,
    /// Fatal connection error; GOAWAY pending.
    Error,
    /// GOAWAY sent; draining until close.
    Error2,
}

/// Stream states (RFC 7540 §5.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum H2sState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedRemote,
    HalfClosedLocal,
    Error,
    Closed,
}

/// Outcome of a stream lookup; sentinels replace never-created or long-gone
/// stream objects.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamRef {
    Real(u32),
    Idle,
    Closed,
    Error,
    Refused,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct H2sFlags: u32 {
        /// END_STREAM received.
        const ES_RCVD     = 0x0001;
        /// END_STREAM sent.
        const ES_SENT     = 0x0002;
        const RST_RCVD    = 0x0004;
        const RST_SENT    = 0x0008;
        /// A HEADERS frame was decoded for this stream.
        const HEADERS_RCVD = 0x0010;
        /// Sitting in send_list.
        const IN_SEND     = 0x0020;
        /// Sitting in fctl_list (waiting for the connection window).
        const IN_FCTL     = 0x0040;
        /// Sitting in blocked_list (waiting for its own window).
        const IN_BLOCKED  = 0x0080;
        /// Content-Length governs the body.
        const BODY_CLEN   = 0x0100;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct H2cFlags: u32 {
        /// Our SETTINGS frame went out.
        const SETTINGS_SENT  = 0x0001;
        /// The one-time connection window enlargement was advertised.
        const WINDOW_OPENED  = 0x0002;
        /// GOAWAY emitted.
        const GOAWAY_SENT    = 0x0004;
        /// Output ring full; retry once it drains.
        const MUX_FULL       = 0x0008;
        /// Demux parked until the current stream's rx buffer drains.
        const DEM_BLOCKED    = 0x0010;
    }
}

/// Per-stream state on an H2 connection.
struct H2Stream {
    id: u32,
    cs: Option<CsHandle>,
    state: H2sState,
    flags: H2sFlags,
    cs_flags: CsFlags,
    /// Send-window offset relative to the peer's initial window; effective
    /// window = miw + sws.
    sws: i64,
    /// Decoded blocks waiting for the upper layer.
    rxbuf: Htx,
    /// Remaining expected body bytes when Content-Length is known.
    body_len: Option<u64>,
    /// Received-but-unacknowledged flow-controlled bytes.
    rcvd_s: u32,
    errcode: H2Err,
    subs_recv: Option<TaskRef>,
    subs_send: Option<TaskRef>,
}

impl H2Stream {
    fn new(id: u32, epoch: u32) -> Self {
        Self {
            id,
            cs: Some(CsHandle::new(id, epoch)),
            state: H2sState::Idle,
            flags: H2sFlags::default(),
            cs_flags: CsFlags::default(),
            sws: 0,
            rxbuf: Htx::new(Htx::DEFAULT_SIZE),
            body_len: None,
            rcvd_s: 0,
            errcode: H2Err::NoError,
            subs_recv: None,
            subs_send: None,
        }
    }

    fn close(&mut self) {
        self.state = H2sState::Closed;
    }
}

fn frame_header(len: u32, typ: u8, flags: u8, sid: u32) -> [u8; 9] {
    let mut h = [0u8; 9];
    h[0] = (len >> 16) as u8;
    h[1] = (len >> 8) as u8;
    h[2] = len as u8;
    h[3] = typ;
    h[4] = flags;
    h[5..9].copy_from_slice(&(sid & 0x7FFF_FFFF).to_be_bytes());
    h
}

/// HTTP/2 multiplexer: framed demux/mux with HPACK, per-stream and
/// connection flow control, and the three send lists.
pub struct H2Mux {
    conn: Connection,
    opts: ProxyOpts,
    front: bool,
    state: H2cState,
    flags: H2cFlags,
    errcode: H2Err,
    dbuf: Buffer,
    mbuf: BufRing,
    dec: hpack::Decoder,
    /// Demux frame header: stream id, length, type, flags, pad length.
    dsi: u32,
    dfl: u32,
    dft: u8,
    dff: u8,
    dpl: u8,
    /// CONTINUATION folding: pending fragment and whether ES was claimed.
    hdr_frag: Option<(u32, Vec<u8>, bool)>,
    streams: BTreeMap<u32, H2Stream>,
    send_list: VecDeque<u32>,
    fctl_list: VecDeque<u32>,
    blocked_list: VecDeque<u32>,
    /// Peer's initial stream window (their SETTINGS).
    miw: i64,
    /// Connection send window.
    mws: i64,
    /// Peer's max frame size for our emissions.
    mfs: u32,
    /// Unacknowledged connection-level received bytes.
    rcvd_c: u32,
    /// Highest peer-initiated id seen.
    max_id: u32,
    /// last_sid promised in GOAWAY, when sent.
    last_sid: Option<u32>,
    /// Peer-opened streams currently live.
    nb_streams: u32,
    nb_cs: u32,
    /// Total streams ever seen on this connection.
    stream_cnt: u32,
    epoch: u32,
    sched: Option<Arc<Scheduler>>,
    scratch: Vec<u8>,
    expire: Tick,
    /// PING payload awaiting its ACK emission.
    ping_payload: Option<[u8; 8]>,
    /// Error code for the RST_STREAM pending in FrameE.
    rst_code: Option<H2Err>,
}

impl H2Mux {
    pub fn new(conn: Connection, opts: ProxyOpts, front: bool) -> Self {
        let dbuf_size = opts.h2.max_frame_size as usize + 9;
        let timeout = opts.timeout;
        let dec = hpack::Decoder::new(opts.h2.header_table_size as usize);
        let mut mux = Self {
            conn,
            opts,
            front,
            state: if front { H2cState::Preface } else { H2cState::Settings1 },
            flags: H2cFlags::default(),
            errcode: H2Err::NoError,
            dbuf: Buffer::with_capacity(dbuf_size),
            mbuf: BufRing::new(MBUF_SLOTS),
            dec,
            dsi: 0,
            dfl: 0,
            dft: 0,
            dff: 0,
            dpl: 0,
            hdr_frag: None,
            streams: BTreeMap::new(),
            send_list: VecDeque::new(),
            fctl_list: VecDeque::new(),
            blocked_list: VecDeque::new(),
            miw: 65535,
            mws: 65535,
            mfs: 16384,
            rcvd_c: 0,
            max_id: 0,
            last_sid: None,
            nb_streams: 0,
            nb_cs: 0,
            stream_cnt: 0,
            epoch: 0,
            sched: None,
            scratch: vec![0; dbuf_size],
            expire: Tick::ETERNITY,
            ping_payload: None,
            rst_code: None,
        };
        mux.expire = now_ms().add_ms(timeout);
        if !front {
            // backend side speaks first: preface then SETTINGS
            mux.queue_frame_raw(H2_PREFACE);
            mux.send_settings();
        }
        mux
    }

    /// Opens a locally-initiated stream (backend side); ids are odd and
    /// strictly increasing.
    pub fn new_backend_stream(&mut self) -> Option<CsHandle> {
        if self.front || self.flags.contains(H2cFlags::GOAWAY_SENT) {
            return None;
        }
        let id = self.max_id + if self.max_id == 0 { 1 } else { 2 };
        let mut s = H2Stream::new(id, self.epoch);
        s.state = H2sState::Open;
        let cs = s.cs.unwrap();
        self.max_id = id;
        self.stream_cnt += 1;
        self.nb_cs += 1;
        self.streams.insert(id, s);
        Some(cs)
    }

    /// Builds an H2 mux from an upgraded H1 connection, re-injecting the
    /// input already read.
    pub fn from_upgrade(conn: Connection, opts: ProxyOpts, mut input: Buffer) -> Self {
        let mut mux = Self::new(conn, opts, true);
        let mut tmp = vec![0u8; input.data()];
        input.get(&mut tmp);
        mux.dbuf.put(&tmp);
        mux
    }

    pub fn set_sched(&mut self, sched: Arc<Scheduler>) {
        self.sched = Some(sched);
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    /// Wire-level state of a live stream, for diagnostics.
    pub fn stream_state(&self, id: u32) -> Option<H2sState> {
        self.streams.get(&id).map(|s| s.state)
    }

    /// (send, fctl, blocked) list membership of a stream, for diagnostics.
    pub fn list_membership(&self, id: u32) -> (bool, bool, bool) {
        (
            self.send_list.contains(&id),
            self.fctl_list.contains(&id),
            self.blocked_list.contains(&id),
        )
    }

    /// Sentinel-aware stream lookup.
    pub fn stream_by_id(&self, id: u32) -> StreamRef {
        if id == 0 {
            return StreamRef::Idle;
        }
        match self.streams.get(&id) {
            Some(s) if s.state == H2sState::Error => StreamRef::Error,
            Some(s) if s.state == H2sState::Closed => StreamRef::Closed,
            Some(s) => StreamRef::Real(s.id),
            None if id > self.max_id => StreamRef::Idle,
            None => StreamRef::Closed,
        }
    }

    fn refresh_timeout(&mut self) {
        let t = if self.flags.contains(H2cFlags::GOAWAY_SENT) {
            self.opts.shut_timeout
        } else {
            self.opts.timeout
        };
        self.expire = now_ms().add_ms(t);
    }

    // -- output ring -------------------------------------------------------

    /// Appends raw bytes to the output ring, opening a new slot as needed.
    fn queue_frame_raw(&mut self, bytes: &[u8]) -> bool {
        let cap = self.mbuf_cap();
        if let Some(tail) = self.mbuf.tail() {
            if tail.put_full(bytes).is_ok() {
                return true;
            }
        }
        if self.mbuf.is_full() {
            self.flags |= H2cFlags::MUX_FULL;
            return false;
        }
        let buf = Buffer::with_capacity(cap.max(bytes.len()));
        let slot = self.mbuf.push_tail(buf).expect("ring not full");
        slot.put_full(bytes).expect("fresh slot too small");
        true
    }

    fn mbuf_cap(&self) -> usize {
        (self.mfs as usize + 9).max(16384)
    }

    fn queue_frame(&mut self, typ: u8, flags: u8, sid: u32, payload: &[u8]) -> bool {
        let mut frame = Vec::with_capacity(9 + payload.len());
        frame.extend_from_slice(&frame_header(payload.len() as u32, typ, flags, sid));
        frame.extend_from_slice(payload);
        self.queue_frame_raw(&frame)
    }

    fn send_settings(&mut self) {
        let h2 = &self.opts.h2;
        let mut p = Vec::with_capacity(24);
        for (id, val) in [
            (ST_HEADER_TABLE_SIZE, h2.header_table_size),
            (ST_INITIAL_WINDOW, h2.initial_window_size),
            (ST_MAX_CONCURRENT, h2.max_concurrent_streams),
            (ST_MAX_FRAME_SIZE, h2.max_frame_size),
        ] {
            p.extend_from_slice(&id.to_be_bytes());
            p.extend_from_slice(&val.to_be_bytes());
        }
        self.queue_frame(FT_SETTINGS, 0, 0, &p);
        self.flags |= H2cFlags::SETTINGS_SENT;
    }

    fn conn_error(&mut self, err: H2Err) {
        if matches!(self.state, H2cState::Error | H2cState::Error2) {
            return;
        }
        debug!(?err, "connection error");
        self.errcode = err;
        self.state = H2cState::Error;
    }

    fn stream_error(&mut self, id: u32, err: H2Err) {
        if let Some(s) = self.streams.get_mut(&id) {
            s.errcode = err;
            s.state = H2sState::Error;
            s.cs_flags |= CsFlags::ERROR;
        }
        self.dsi = id;
        self.rst_code = Some(err);
        self.state = H2cState::FrameE;
    }

    // -- input -------------------------------------------------------------

    fn recv(&mut self) -> usize {
        if self.conn.flags.contains(ConnFlags::SOCK_RD_SH) {
            return 0;
        }
        let room = self.dbuf.room();
        if room == 0 {
            return 0;
        }
        match self.conn.rcv_buf(&mut self.dbuf, room) {
            XprtResult::Bytes(n) => n,
            XprtResult::Closed | XprtResult::WouldBlock => 0,
            XprtResult::Error(_) => {
                self.conn_error(H2Err::Internal);
                0
            }
        }
    }

    fn contig_input(&mut self) -> &[u8] {
        if self.dbuf.contig_data() < self.dbuf.data() {
            self.dbuf.slow_realign(&mut self.scratch);
        }
        self.dbuf.data_slices().0
    }

    /// Structural frame-header validation before dispatch.
    fn check_frame(&mut self) -> bool {
        if self.dfl > self.opts.h2.max_frame_size {
            self.conn_error(H2Err::FrameSize);
            return false;
        }
        match self.dft {
            FT_SETTINGS | FT_PING | FT_GOAWAY if self.dsi != 0 => {
                self.conn_error(H2Err::Protocol);
                false
            }
            FT_DATA | FT_HEADERS | FT_RST_STREAM | FT_CONTINUATION | FT_PRIORITY
                if self.dsi == 0 =>
            {
                self.conn_error(H2Err::Protocol);
                false
            }
            _ => true,
        }
    }

    /// One demux pass; consumes whole frames from dbuf.
    fn demux(&mut self, up: &mut dyn StreamLayer) {
        loop {
            match self.state {
                H2cState::Preface => {
                    if self.dbuf.data() < H2_PREFACE.len() {
                        return;
                    }
                    let ok = {
                        let head = self.contig_input();
                        &head[..H2_PREFACE.len()] == H2_PREFACE
                    };
                    if !ok {
                        self.conn_error(H2Err::Protocol);
                        continue;
                    }
                    self.dbuf.del(H2_PREFACE.len());
                    self.send_settings();
                    self.state = H2cState::Settings1;
                    trace!("preface accepted");
                }
                H2cState::Settings1 | H2cState::FrameH => {
                    if self.dbuf.data() < 9 {
                        return;
                    }
                    let mut h = [0u8; 9];
                    self.dbuf.peek_at(0, &mut h);
                    self.dfl = u32::from_be_bytes([0, h[0], h[1], h[2]]);
                    self.dft = h[3];
                    self.dff = h[4];
                    self.dsi = u32::from_be_bytes([h[5], h[6], h[7], h[8]]) & 0x7FFF_FFFF;
                    self.dpl = 0;

                    if self.state == H2cState::Settings1
                        && (self.dft != FT_SETTINGS || self.dff & FL_ACK != 0)
                    {
                        // the preface sequence must finish first
                        self.conn_error(H2Err::Protocol);
                        continue;
                    }
                    if !self.check_frame() {
                        continue;
                    }
                    self.dbuf.del(9);
                    self.state = H2cState::FrameP;
                }
                H2cState::FrameP => {
                    if (self.dbuf.data() as u32) < self.dfl {
                        return;
                    }
                    let payload = {
                        let dfl = self.dfl as usize;
                        let p = self.contig_input();
                        p[..dfl].to_vec()
                    };
                    self.dbuf.del(self.dfl as usize);
                    self.dispatch(&payload, up);
                }
                H2cState::FrameA => {
                    // acknowledgements for the frame just processed
                    let ok = if let Some(p) = self.ping_payload.take() {
                        self.queue_frame(FT_PING, FL_ACK, 0, &p)
                    } else {
                        self.queue_frame(FT_SETTINGS, FL_ACK, 0, &[])
                    };
                    if !ok {
                        return;
                    }
                    self.state = H2cState::FrameH;
                }
                H2cState::FrameE => {
                    let id = self.dsi;
                    let code = self.rst_code.unwrap_or_else(|| self.stream_errcode(id));
                    if !self.queue_frame(FT_RST_STREAM, 0, id, &(code as u32).to_be_bytes()) {
                        return;
                    }
                    self.rst_code = None;
                    if let Some(s) = self.streams.get_mut(&id) {
                        s.flags |= H2sFlags::RST_SENT;
                        s.close();
                    }
                    self.state = H2cState::FrameH;
                }
                H2cState::Error => {
                    self.send_goaway();
                    for s in self.streams.values_mut() {
                        if s.state != H2sState::Closed {
                            s.cs_flags |= CsFlags::ERROR;
                            if let Some(cs) = s.cs {
                                up.wake(cs);
                            }
                        }
                    }
                    self.state = H2cState::Error2;
                }
                H2cState::Error2 => return,
            }
        }
    }

    fn stream_errcode(&self, id: u32) -> H2Err {
        self.streams.get(&id).map_or(H2Err::StreamClosed, |s| {
            if s.errcode == H2Err::NoError { H2Err::StreamClosed } else { s.errcode }
        })
    }

    fn send_goaway(&mut self) {
        if self.flags.contains(H2cFlags::GOAWAY_SENT) {
            return;
        }
        let last = self.max_id;
        let mut p = Vec::with_capacity(8);
        p.extend_from_slice(&last.to_be_bytes());
        p.extend_from_slice(&(self.errcode as u32).to_be_bytes());
        if self.queue_frame(FT_GOAWAY, 0, 0, &p) {
            self.flags |= H2cFlags::GOAWAY_SENT;
            self.last_sid = Some(last);
        }
    }

    /// Strips the padding envelope; returns the data region or None on a
    /// malformed pad length (connection error already raised).
    fn unpad<'a>(&mut self, payload: &'a [u8]) -> Option<&'a [u8]> {
        if self.dff & FL_PADDED == 0 {
            return Some(payload);
        }
        if payload.is_empty() {
            self.conn_error(H2Err::FrameSize);
            return None;
        }
        let pad = payload[0] as usize;
        if pad + 1 > payload.len() {
            self.conn_error(H2Err::Protocol);
            return None;
        }
        self.dpl = payload[0];
        Some(&payload[1..payload.len() - pad])
    }

    fn dispatch(&mut self, payload: &[u8], up: &mut dyn StreamLayer) {
        // CONTINUATION folding in progress: only CONTINUATION for the same
        // stream may appear
        if let Some((frag_sid, _, _)) = &self.hdr_frag {
            if self.dft != FT_CONTINUATION || self.dsi != *frag_sid {
                self.conn_error(H2Err::Protocol);
                return;
            }
        }

        match self.dft {
            FT_SETTINGS => self.handle_settings(payload),
            FT_PING => self.handle_ping(payload),
            FT_WINDOW_UPDATE => self.handle_window_update(payload),
            FT_HEADERS => self.handle_headers(payload, up),
            FT_CONTINUATION => self.handle_continuation(payload, up),
            FT_DATA => self.handle_data(payload, up),
            FT_RST_STREAM => self.handle_rst(payload, up),
            FT_GOAWAY => self.handle_goaway(payload, up),
            FT_PRIORITY => {
                if payload.len() != 5 {
                    self.stream_error(self.dsi, H2Err::FrameSize);
                } else {
                    self.state = H2cState::FrameH;
                }
            }
            FT_PUSH_PROMISE => {
                // peers must not push toward us
                self.conn_error(H2Err::Protocol);
            }
            _ => {
                // unknown frame types are skipped silently
                trace!(typ = self.dft, "ignoring unknown frame type");
                self.state = H2cState::FrameH;
            }
        }
    }

    fn handle_settings(&mut self, payload: &[u8]) {
        if self.dff & FL_ACK != 0 {
            if !payload.is_empty() {
                self.conn_error(H2Err::FrameSize);
                return;
            }
            self.state = H2cState::FrameH;
            return;
        }
        if payload.len() % 6 != 0 {
            self.conn_error(H2Err::FrameSize);
            return;
        }
        for pair in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([pair[0], pair[1]]);
            let val = u32::from_be_bytes([pair[2], pair[3], pair[4], pair[5]]);
            match id {
                ST_INITIAL_WINDOW => {
                    if val > 0x7FFF_FFFF {
                        self.conn_error(H2Err::FlowControl);
                        return;
                    }
                    let delta = i64::from(val) - self.miw;
                    self.miw = i64::from(val);
                    if delta > 0 {
                        self.unblock_streams();
                    }
                }
                ST_MAX_FRAME_SIZE => {
                    if !(16384..=16_777_215).contains(&val) {
                        self.conn_error(H2Err::Protocol);
                        return;
                    }
                    self.mfs = val;
                }
                ST_ENABLE_PUSH => {
                    if val > 1 {
                        self.conn_error(H2Err::Protocol);
                        return;
                    }
                }
                ST_HEADER_TABLE_SIZE | ST_MAX_CONCURRENT => {}
                _ => {}
            }
        }
        if self.state == H2cState::Settings1 || self.state == H2cState::FrameP {
            self.state = H2cState::FrameA;
        }
        trace!(miw = self.miw, mfs = self.mfs, "peer settings applied");
    }

    fn handle_ping(&mut self, payload: &[u8]) {
        if payload.len() != 8 {
            self.conn_error(H2Err::FrameSize);
            return;
        }
        if self.dff & FL_ACK != 0 {
            self.state = H2cState::FrameH;
            return;
        }
        let mut p = [0u8; 8];
        p.copy_from_slice(payload);
        self.ping_payload = Some(p);
        self.state = H2cState::FrameA;
    }

    fn handle_window_update(&mut self, payload: &[u8]) {
        if payload.len() != 4 {
            self.conn_error(H2Err::FrameSize);
            return;
        }
        let inc = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
            & 0x7FFF_FFFF;
        if self.dsi == 0 {
            if inc == 0 {
                self.conn_error(H2Err::Protocol);
                return;
            }
            if self.mws + i64::from(inc) > 0x7FFF_FFFF {
                self.conn_error(H2Err::FlowControl);
                return;
            }
            self.mws += i64::from(inc);
            self.unblock_fctl();
        } else {
            if inc == 0 {
                self.stream_error(self.dsi, H2Err::Protocol);
                return;
            }
            match self.stream_by_id(self.dsi) {
                StreamRef::Real(id) => {
                    let overflow = {
                        let s = self.streams.get_mut(&id).unwrap();
                        s.sws += i64::from(inc);
                        self.miw + s.sws > 0x7FFF_FFFF
                    };
                    if overflow {
                        self.stream_error(id, H2Err::FlowControl);
                        return;
                    }
                    self.unblock_stream(id);
                }
                StreamRef::Idle => {
                    self.conn_error(H2Err::Protocol);
                    return;
                }
                // window updates for dead streams are ignored
                _ => {}
            }
            self.state = H2cState::FrameH;
            return;
        }
        self.state = H2cState::FrameH;
    }

    fn handle_rst(&mut self, payload: &[u8], up: &mut dyn StreamLayer) {
        if payload.len() != 4 {
            self.conn_error(H2Err::FrameSize);
            return;
        }
        match self.stream_by_id(self.dsi) {
            StreamRef::Idle => {
                self.conn_error(H2Err::Protocol);
                return;
            }
            StreamRef::Real(id) => {
                let cs = {
                    let s = self.streams.get_mut(&id).unwrap();
                    s.flags |= H2sFlags::RST_RCVD;
                    s.cs_flags |= CsFlags::ERROR | CsFlags::EOS;
                    s.close();
                    s.cs
                };
                if let Some(cs) = cs {
                    up.wake(cs);
                }
            }
            _ => {}
        }
        self.state = H2cState::FrameH;
    }

    fn handle_goaway(&mut self, payload: &[u8], up: &mut dyn StreamLayer) {
        if payload.len() < 8 {
            self.conn_error(H2Err::FrameSize);
            return;
        }
        let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
            & 0x7FFF_FFFF;
        let mut to_wake = Vec::new();
        for (id, s) in self.streams.iter_mut() {
            if *id > last && s.state != H2sState::Closed {
                s.cs_flags |= CsFlags::ERROR;
                if let Some(cs) = s.cs {
                    to_wake.push(cs);
                }
            }
        }
        for cs in to_wake {
            up.wake(cs);
        }
        self.state = H2cState::FrameH;
    }

    fn handle_headers(&mut self, payload: &[u8], up: &mut dyn StreamLayer) {
        let Some(mut body) = self.unpad(payload) else { return };
        if self.dff & FL_PRIORITY != 0 {
            if body.len() < 5 {
                self.conn_error(H2Err::FrameSize);
                return;
            }
            body = &body[5..];
        }
        let es = self.dff & FL_END_STREAM != 0;

        if self.dff & FL_END_HEADERS == 0 {
            // fold CONTINUATION frames into this fragment
            self.hdr_frag = Some((self.dsi, body.to_vec(), es));
            self.state = H2cState::FrameH;
            return;
        }
        self.decode_headers_block(self.dsi, body, es, up);
    }

    fn handle_continuation(&mut self, payload: &[u8], up: &mut dyn StreamLayer) {
        let Some((sid, mut frag, es)) = self.hdr_frag.take() else {
            // CONTINUATION with nothing to continue
            self.conn_error(H2Err::Protocol);
            return;
        };
        frag.extend_from_slice(payload);
        if self.dff & FL_END_HEADERS == 0 {
            self.hdr_frag = Some((sid, frag, es));
            self.state = H2cState::FrameH;
            return;
        }
        self.decode_headers_block(sid, &frag, es, up);
    }

    /// Full header block in hand: HPACK-decode and build the stream.
    fn decode_headers_block(
        &mut self,
        sid: u32,
        block: &[u8],
        es: bool,
        up: &mut dyn StreamLayer,
    ) {
        let fields = match self.dec.decode_block(block, self.opts.h2.max_http_hdr) {
            Ok(f) => f,
            Err(e) => {
                // the decoder state is desynchronized; unrecoverable
                debug!(?e, "hpack decode failed");
                self.conn_error(H2Err::Compression);
                return;
            }
        };

        // trailers: a second HEADERS on a stream that already has them
        if let Some(s) = self.streams.get(&sid) {
            if s.flags.contains(H2sFlags::HEADERS_RCVD) {
                self.handle_trailers(sid, &fields, es, up);
                return;
            }
        }

        if !self.front {
            self.decode_response_headers(sid, &fields, es, up);
            return;
        }

        // new stream checks
        if sid % 2 == 0 || sid <= self.max_id {
            self.conn_error(H2Err::Protocol);
            return;
        }
        if let Some(last) = self.last_sid {
            if sid > last {
                // refused after GOAWAY
                self.dsi = sid;
                self.rst_code = Some(H2Err::RefusedStream);
                self.state = H2cState::FrameE;
                return;
            }
        }
        if self.nb_streams >= self.opts.h2.max_concurrent_streams {
            self.max_id = sid;
            self.streams.insert(sid, {
                let mut s = H2Stream::new(sid, self.epoch);
                s.cs = None;
                s.errcode = H2Err::RefusedStream;
                s.state = H2sState::Error;
                s
            });
            self.stream_error(sid, H2Err::RefusedStream);
            return;
        }

        match self.build_request_htx(&fields, es) {
            Ok((htx, clen)) => {
                self.max_id = sid;
                self.stream_cnt += 1;
                self.nb_streams += 1;
                let mut s = H2Stream::new(sid, self.epoch);
                s.flags |= H2sFlags::HEADERS_RCVD;
                s.state = if es {
                    s.flags |= H2sFlags::ES_RCVD;
                    s.cs_flags |= CsFlags::ES_RCVD | CsFlags::EOI;
                    H2sState::HalfClosedRemote
                } else {
                    H2sState::Open
                };
                s.body_len = clen;
                if clen.is_some() {
                    s.flags |= H2sFlags::BODY_CLEN;
                }
                s.rxbuf = htx;
                s.cs_flags |= CsFlags::RCV_MORE;
                let cs = s.cs.unwrap();
                self.streams.insert(sid, s);
                self.nb_cs += 1;
                if !up.stream_new(cs) {
                    self.nb_cs -= 1;
                    if let Some(s) = self.streams.get_mut(&sid) {
                        s.cs = None;
                    }
                    self.stream_error(sid, H2Err::RefusedStream);
                    return;
                }
                up.wake(cs);
                self.state = H2cState::FrameH;
                trace!(sid, es, "stream opened");
            }
            Err(code) => {
                // decoded fine: the error is scoped to this stream
                self.max_id = sid;
                let mut s = H2Stream::new(sid, self.epoch);
                s.state = H2sState::Error;
                s.errcode = code;
                self.streams.insert(sid, s);
                self.stream_error(sid, code);
            }
        }
    }

    /// Converts decoded fields into the request HTX, validating pseudo
    /// headers. Errors here are stream-scoped.
    fn build_request_htx(
        &self,
        fields: &[(Vec<u8>, Vec<u8>)],
        es: bool,
    ) -> Result<(Htx, Option<u64>), H2Err> {
        let mut meth = None;
        let mut path = None;
        let mut scheme = None;
        let mut authority: Option<&[u8]> = None;
        let mut regular = Vec::new();
        let mut clen: Option<u64> = None;
        let mut seen_regular = false;

        for (name, value) in fields {
            if name.first() == Some(&b':') {
                if seen_regular {
                    return Err(H2Err::Protocol);
                }
                let slot = match name.as_slice() {
                    b":method" => &mut meth,
                    b":path" => &mut path,
                    b":scheme" => &mut scheme,
                    b":authority" => &mut authority,
                    _ => return Err(H2Err::Protocol),
                };
                if slot.is_some() {
                    return Err(H2Err::Protocol);
                }
                *slot = Some(value.as_slice());
            } else {
                seen_regular = true;
                if name.iter().any(u8::is_ascii_uppercase) {
                    return Err(H2Err::Protocol);
                }
                if name.as_slice() == b"content-length" {
                    let v = std::str::from_utf8(value)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                        .ok_or(H2Err::Protocol)?;
                    if let Some(prev) = clen {
                        if prev != v {
                            return Err(H2Err::Protocol);
                        }
                    }
                    clen = Some(v);
                } else if name.as_slice() == b"connection" || name.as_slice() == b"te" {
                    // connection-specific headers are forbidden on h2
                    if name.as_slice() == b"connection" || value.as_slice() != b"trailers" {
                        return Err(H2Err::Protocol);
                    }
                }
                regular.push((name.clone(), value.clone()));
            }
        }

        let meth = meth.ok_or(H2Err::Protocol)?;
        let connect = meth == b"CONNECT";
        if !connect && (path.is_none() || scheme.is_none()) {
            return Err(H2Err::Protocol);
        }
        let path = path.unwrap_or(b"");

        let mut htx = Htx::new(Htx::DEFAULT_SIZE);
        let mut sl = StartLine::request(meth, path, b"HTTP/1.1");
        sl.flags |= SlFlags::VER_11;
        if connect {
            sl.flags |= SlFlags::CONNECT;
        }
        if let Some(n) = clen {
            sl.flags |= SlFlags::CLEN | SlFlags::XFER_LEN;
            let _ = n;
        } else {
            sl.flags |= SlFlags::XFER_LEN;
        }
        htx.add_stline(HtxBlock::ReqSl(sl)).map_err(|_| H2Err::Internal)?;

        // :authority surfaces as the host header unless one exists
        let has_host = regular.iter().any(|(n, _)| n.as_slice() == b"host");
        if let (Some(auth), false) = (authority, has_host) {
            htx.add_header(b"host", auth).map_err(|()| H2Err::Internal)?;
        }
        for (name, value) in &regular {
            htx.add_header(name, value).map_err(|()| H2Err::Internal)?;
        }
        htx.add_endof(HtxBlock::Eoh).map_err(|()| H2Err::Internal)?;
        if es {
            if clen.is_some_and(|n| n != 0) {
                return Err(H2Err::Protocol);
            }
            htx.add_endof(HtxBlock::Eom).map_err(|()| H2Err::Internal)?;
        }
        Ok((htx, clen))
    }

    /// A response header block on a stream we initiated (backend side).
    fn decode_response_headers(
        &mut self,
        sid: u32,
        fields: &[(Vec<u8>, Vec<u8>)],
        es: bool,
        up: &mut dyn StreamLayer,
    ) {
        if !self.streams.contains_key(&sid) {
            self.conn_error(H2Err::Protocol);
            return;
        }
        let status = fields
            .iter()
            .find(|(n, _)| n.as_slice() == b":status")
            .map(|(_, v)| v.clone());
        let Some(status) = status else {
            self.stream_error(sid, H2Err::Protocol);
            return;
        };

        let cs = {
            let s = self.streams.get_mut(&sid).unwrap();
            let mut sl = StartLine::response(b"HTTP/1.1", &status, b"");
            sl.flags |= SlFlags::VER_11 | SlFlags::XFER_LEN;
            let _ = s.rxbuf.add_stline(HtxBlock::ResSl(sl));
            for (name, value) in fields {
                if name.first() == Some(&b':') {
                    continue;
                }
                let _ = s.rxbuf.add_header(name, value);
            }
            let _ = s.rxbuf.add_endof(HtxBlock::Eoh);
            s.flags |= H2sFlags::HEADERS_RCVD;
            s.cs_flags |= CsFlags::RCV_MORE;
            if es {
                let _ = s.rxbuf.add_endof(HtxBlock::Eom);
                s.flags |= H2sFlags::ES_RCVD;
                s.cs_flags |= CsFlags::ES_RCVD | CsFlags::EOI;
                s.state = match s.state {
                    H2sState::Open => H2sState::HalfClosedRemote,
                    H2sState::HalfClosedLocal => H2sState::Closed,
                    st => st,
                };
            }
            s.cs
        };
        if let Some(cs) = cs {
            up.wake(cs);
        }
        self.state = H2cState::FrameH;
    }

    fn handle_trailers(
        &mut self,
        sid: u32,
        fields: &[(Vec<u8>, Vec<u8>)],
        es: bool,
        up: &mut dyn StreamLayer,
    ) {
        if !es {
            self.stream_error(sid, H2Err::Protocol);
            return;
        }
        if fields.iter().any(|(n, _)| n.first() == Some(&b':')) {
            // pseudo headers cannot reappear in trailers
            self.stream_error(sid, H2Err::Protocol);
            return;
        }
        if !self.streams.contains_key(&sid) {
            self.conn_error(H2Err::Protocol);
            return;
        }
        let cs = {
            let s = self.streams.get_mut(&sid).unwrap();
            for (name, value) in fields {
                let _ = s.rxbuf.add_trailer(name, value);
            }
            let _ = s.rxbuf.add_endof(HtxBlock::Eot);
            let _ = s.rxbuf.add_endof(HtxBlock::Eom);
            s.flags |= H2sFlags::ES_RCVD;
            s.cs_flags |= CsFlags::ES_RCVD | CsFlags::EOI | CsFlags::RCV_MORE;
            s.state = match s.state {
                H2sState::Open => H2sState::HalfClosedRemote,
                H2sState::HalfClosedLocal => H2sState::Closed,
                st => st,
            };
            s.cs
        };
        if let Some(cs) = cs {
            up.wake(cs);
        }
        self.state = H2cState::FrameH;
    }

    fn handle_data(&mut self, payload: &[u8], up: &mut dyn StreamLayer) {
        // every flow-controlled byte (padding included) is accounted
        self.rcvd_c = self.rcvd_c.saturating_add(self.dfl);

        let Some(body) = self.unpad(payload) else { return };

        match self.stream_by_id(self.dsi) {
            StreamRef::Real(id) => {
                let es = self.dff & FL_END_STREAM != 0;
                let (cs, err) = {
                    let s = self.streams.get_mut(&id).unwrap();
                    if s.state == H2sState::HalfClosedRemote {
                        (s.cs, Some(H2Err::StreamClosed))
                    } else {
                        s.rcvd_s = s.rcvd_s.saturating_add(self.dfl);
                        if let Some(rem) = &mut s.body_len {
                            if (body.len() as u64) > *rem {
                                (s.cs, Some(H2Err::Protocol))
                            } else {
                                *rem -= body.len() as u64;
                                s.rxbuf.add_data(body);
                                s.cs_flags |= CsFlags::RCV_MORE;
                                (s.cs, None)
                            }
                        } else {
                            s.rxbuf.add_data(body);
                            s.cs_flags |= CsFlags::RCV_MORE;
                            (s.cs, None)
                        }
                    }
                };
                match err {
                    Some(H2Err::StreamClosed) => {
                        self.conn_error(H2Err::StreamClosed);
                        return;
                    }
                    Some(code) => {
                        self.stream_error(id, code);
                        return;
                    }
                    None => {}
                }
                if es {
                    let short_body = {
                        let s = &self.streams[&id];
                        s.flags.contains(H2sFlags::BODY_CLEN)
                            && s.body_len.is_some_and(|r| r != 0)
                    };
                    if short_body {
                        self.stream_error(id, H2Err::Protocol);
                        return;
                    }
                    let s = self.streams.get_mut(&id).unwrap();
                    let _ = s.rxbuf.add_endof(HtxBlock::Eom);
                    s.flags |= H2sFlags::ES_RCVD;
                    s.cs_flags |= CsFlags::ES_RCVD | CsFlags::EOI;
                    s.state = match s.state {
                        H2sState::Open => H2sState::HalfClosedRemote,
                        H2sState::HalfClosedLocal => H2sState::Closed,
                        st => st,
                    };
                }
                if let Some(cs) = cs {
                    up.wake(cs);
                }
                // acknowledge connection-level bytes eagerly
                self.send_conn_wu();
                self.state = H2cState::FrameH;
            }
            StreamRef::Idle => self.conn_error(H2Err::Protocol),
            _ => self.conn_error(H2Err::StreamClosed),
        }
    }

    /// Connection window acknowledgement, with the one-time enlargement so
    /// peers may send freely.
    fn send_conn_wu(&mut self) {
        if self.rcvd_c == 0 && self.flags.contains(H2cFlags::WINDOW_OPENED) {
            return;
        }
        let mut inc = self.rcvd_c;
        if !self.flags.contains(H2cFlags::WINDOW_OPENED) {
            inc = inc.saturating_add(INITIAL_WINDOW_INCREMENT);
            self.flags |= H2cFlags::WINDOW_OPENED;
        }
        if inc != 0 && self.queue_frame(FT_WINDOW_UPDATE, 0, 0, &inc.to_be_bytes()) {
            self.rcvd_c = 0;
        }
    }

    // -- send lists --------------------------------------------------------

    fn list_add(list: &mut VecDeque<u32>, id: u32) {
        if !list.contains(&id) {
            list.push_back(id);
        }
    }

    fn list_del(list: &mut VecDeque<u32>, id: u32) {
        // idempotent removal
        list.retain(|&x| x != id);
    }

    /// The connection window opened: fctl streams become sendable again.
    fn unblock_fctl(&mut self) {
        while let Some(id) = self.fctl_list.pop_front() {
            if let Some(s) = self.streams.get_mut(&id) {
                s.flags.remove(H2sFlags::IN_FCTL);
                s.flags |= H2sFlags::IN_SEND;
                Self::list_add(&mut self.send_list, id);
            }
        }
        self.notify_sendable();
    }

    /// A stream's own window opened.
    fn unblock_stream(&mut self, id: u32) {
        let sendable = self.streams.get(&id).is_some_and(|s| {
            s.flags.contains(H2sFlags::IN_BLOCKED) && self.miw + s.sws > 0
        });
        if sendable {
            Self::list_del(&mut self.blocked_list, id);
            let s = self.streams.get_mut(&id).unwrap();
            s.flags.remove(H2sFlags::IN_BLOCKED);
            s.flags |= H2sFlags::IN_SEND;
            Self::list_add(&mut self.send_list, id);
        }
        self.notify_sendable();
    }

    /// INITIAL_WINDOW_SIZE grew: wake every stream whose effective window
    /// turned positive.
    fn unblock_streams(&mut self) {
        let ids: Vec<u32> = self.blocked_list.iter().copied().collect();
        for id in ids {
            self.unblock_stream(id);
        }
    }

    /// Wakes subscribers of every stream in the send list.
    fn notify_sendable(&mut self) {
        let Some(sched) = self.sched.clone() else { return };
        for &id in &self.send_list {
            if let Some(s) = self.streams.get_mut(&id) {
                if let Some(t) = s.subs_send.take() {
                    sched.tasklet_wakeup(&t);
                }
            }
        }
    }

    // -- tx ----------------------------------------------------------------

    fn encode_headers_frame(
        &mut self,
        sid: u32,
        fields: &[(Vec<u8>, Vec<u8>)],
        end_stream: bool,
    ) -> bool {
        let mut block = Vec::with_capacity(256);
        for (name, value) in fields {
            hpack::Encoder::encode_header(&mut block, name, value);
        }

        let mfs = self.mfs as usize;
        if block.len() <= mfs {
            let flags = FL_END_HEADERS | if end_stream { FL_END_STREAM } else { 0 };
            return self.queue_frame(FT_HEADERS, flags, sid, &block);
        }

        // fragment: HEADERS without END_HEADERS, then CONTINUATIONs
        let mut chunks = block.chunks(mfs).peekable();
        let first = chunks.next().unwrap();
        let flags = if end_stream { FL_END_STREAM } else { 0 };
        if !self.queue_frame(FT_HEADERS, flags, sid, first) {
            return false;
        }
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() { FL_END_HEADERS } else { 0 };
            if !self.queue_frame(FT_CONTINUATION, flags, sid, chunk) {
                return false;
            }
        }
        true
    }

    /// Emits as much of `data` as both windows and the frame size allow.
    /// Returns (bytes sent, blocked-on-connection-window).
    fn send_data_frames(&mut self, sid: u32, data: &[u8], end_stream: bool) -> (usize, bool) {
        let mut sent = 0usize;

        loop {
            let rem = &data[sent..];
            let swin = {
                let s = &self.streams[&sid];
                self.miw + s.sws
            };
            if rem.is_empty() {
                if end_stream {
                    // bare END_STREAM frame
                    if self.queue_frame(FT_DATA, FL_END_STREAM, sid, &[]) {
                        self.mark_es_sent(sid);
                    }
                }
                return (sent, false);
            }
            // the stream's own window outranks the connection window when
            // deciding which list to park in
            if swin <= 0 {
                return (sent, false);
            }
            if self.mws <= 0 {
                return (sent, true);
            }

            let take = rem
                .len()
                .min(self.mws as usize)
                .min(swin as usize)
                .min(self.mfs as usize);
            let last = sent + take == data.len();
            let flags = if last && end_stream { FL_END_STREAM } else { 0 };
            if !self.queue_frame(FT_DATA, flags, sid, &rem[..take]) {
                return (sent, false);
            }
            self.mws -= take as i64;
            if let Some(s) = self.streams.get_mut(&sid) {
                s.sws -= take as i64;
            }
            sent += take;
            if last && end_stream {
                self.mark_es_sent(sid);
            }
        }
    }

    fn mark_es_sent(&mut self, sid: u32) {
        if let Some(s) = self.streams.get_mut(&sid) {
            s.flags |= H2sFlags::ES_SENT;
            s.state = match s.state {
                H2sState::Open => H2sState::HalfClosedLocal,
                H2sState::HalfClosedRemote => H2sState::Closed,
                st => st,
            };
        }
    }

    /// Flushes the output ring to the transport, head to tail.
    fn flush_mbuf(&mut self) {
        while let Some(head) = self.mbuf.head() {
            if head.is_empty() {
                self.mbuf.pop_head();
                continue;
            }
            let len = head.data();
            match self.conn.snd_buf(head, len) {
                XprtResult::Bytes(n) => {
                    if n == 0 {
                        return;
                    }
                    self.flags.remove(H2cFlags::MUX_FULL);
                }
                XprtResult::WouldBlock => return,
                XprtResult::Closed | XprtResult::Error(_) => {
                    self.conn_error(H2Err::Internal);
                    return;
                }
            }
        }
    }

    fn valid(&self, cs: CsHandle) -> bool {
        cs.epoch == self.epoch
            && self
                .streams
                .get(&cs.id)
                .is_some_and(|s| s.cs == Some(cs))
    }
}

impl Mux for H2Mux {
    fn wake(&mut self, up: &mut dyn StreamLayer) -> bool {
        if self.conn.handshaking() {
            match self.conn.handshake() {
                Ok(HsProgress::Done) => {}
                Ok(HsProgress::Pending) => return true,
                Err(_) => return false,
            }
        }

        self.recv();
        self.demux(up);
        self.flush_mbuf();
        self.refresh_timeout();

        if self.state == H2cState::Error2 && self.mbuf.is_empty() && self.nb_cs == 0 {
            return false;
        }
        !self.conn.is_errored() || self.nb_cs > 0
    }

    fn rcv_buf(&mut self, cs: CsHandle, htx: &mut Htx, _count: usize) -> usize {
        if !self.valid(cs) {
            return 0;
        }
        let mut payload = 0usize;
        {
            let s = self.streams.get_mut(&cs.id).unwrap();
            while let Some(blk) = s.rxbuf.pop() {
                if let HtxBlock::Data(d) = &blk {
                    payload += d.len();
                }
                if let Err(blk) = push_back_into(htx, blk) {
                    s.rxbuf.push_front(blk);
                    break;
                }
            }
            if s.rxbuf.is_empty() {
                s.cs_flags.remove(CsFlags::RCV_MORE);
            }
        }

        // acknowledge what the upper layer just absorbed
        if payload > 0 {
            let acked = {
                let s = self.streams.get_mut(&cs.id).unwrap();
                let acked = s.rcvd_s.min(payload as u32);
                s.rcvd_s -= acked;
                acked
            };
            let open = {
                let s = &self.streams[&cs.id];
                s.state == H2sState::Open || s.state == H2sState::HalfClosedLocal
            };
            if acked > 0 && open {
                self.queue_frame(FT_WINDOW_UPDATE, 0, cs.id, &acked.to_be_bytes());
            }
            self.send_conn_wu();
            self.flush_mbuf();
        }
        payload
    }

    fn snd_buf(&mut self, cs: CsHandle, htx: &mut Htx) -> usize {
        if !self.valid(cs) {
            return 0;
        }
        if matches!(self.state, H2cState::Error | H2cState::Error2) {
            return 0;
        }
        let sid = cs.id;
        let mut sent = 0usize;
        let mut hdrs: Option<(Vec<(Vec<u8>, Vec<u8>)>, bool)> = None;

        while let Some(blk) = htx.pop() {
            match blk {
                HtxBlock::ResSl(sl) => {
                    let fields = vec![(
                        b":status".to_vec(),
                        format!("{}", sl.status()).into_bytes(),
                    )];
                    hdrs = Some((fields, false));
                }
                HtxBlock::ReqSl(sl) => {
                    let fields = vec![
                        (b":method".to_vec(), sl.meth().to_vec()),
                        (b":scheme".to_vec(), b"https".to_vec()),
                        (b":path".to_vec(), sl.uri().to_vec()),
                    ];
                    hdrs = Some((fields, false));
                }
                HtxBlock::Hdr { name, value } => {
                    if let Some((fields, _)) = &mut hdrs {
                        // connection-specific headers never cross to h2
                        if name == b"connection"
                            || name == b"proxy-connection"
                            || name == b"keep-alive"
                            || name == b"transfer-encoding"
                            || name == b"upgrade"
                        {
                            continue;
                        }
                        if name == b"host" {
                            fields.push((b":authority".to_vec(), value));
                            continue;
                        }
                        fields.push((name, value));
                    }
                }
                HtxBlock::Eoh => {
                    if let Some((fields, _)) = hdrs.take() {
                        let es = htx.first() == Some(&HtxBlock::Eom);
                        if es {
                            let _ = htx.pop();
                        }
                        if !self.encode_headers_frame(sid, &fields, es) {
                            return sent;
                        }
                        if es {
                            self.mark_es_sent(sid);
                        }
                    }
                }
                HtxBlock::Data(d) => {
                    let es = htx.first() == Some(&HtxBlock::Eom);
                    let (n, conn_blocked) = self.send_data_frames(sid, &d, es);
                    sent += n;
                    if n == d.len() {
                        if es {
                            let _ = htx.pop();
                        }
                    } else {
                        htx.push_front(HtxBlock::Data(d[n..].to_vec()));
                        // flow controlled: park in the right list
                        let s = self.streams.get_mut(&sid).unwrap();
                        s.flags.remove(H2sFlags::IN_SEND);
                        Self::list_del(&mut self.send_list, sid);
                        if conn_blocked {
                            s.flags |= H2sFlags::IN_FCTL;
                            Self::list_add(&mut self.fctl_list, sid);
                        } else {
                            s.flags |= H2sFlags::IN_BLOCKED;
                            Self::list_add(&mut self.blocked_list, sid);
                        }
                        break;
                    }
                }
                HtxBlock::Tlr { name, value } => {
                    match &mut hdrs {
                        Some((fields, _)) => fields.push((name, value)),
                        None => hdrs = Some((vec![(name, value)], true)),
                    }
                }
                HtxBlock::Eot => {
                    if let Some((fields, true)) = hdrs.take() {
                        if !self.encode_headers_frame(sid, &fields, true) {
                            return sent;
                        }
                        self.mark_es_sent(sid);
                    }
                }
                HtxBlock::Eom => {
                    let es_sent = self
                        .streams
                        .get(&sid)
                        .is_some_and(|s| s.flags.contains(H2sFlags::ES_SENT));
                    if !es_sent {
                        let (_, _) = self.send_data_frames(sid, &[], true);
                    }
                }
            }
        }

        self.flush_mbuf();
        sent
    }

    fn cs_flags(&self, cs: CsHandle) -> CsFlags {
        if !self.valid(cs) {
            return CsFlags::ERROR;
        }
        self.streams[&cs.id].cs_flags
    }

    fn subscribe(&mut self, cs: CsHandle, events: SubEvents, tasklet: &TaskRef) {
        if !self.valid(cs) {
            return;
        }
        let sendable = {
            let s = &self.streams[&cs.id];
            self.mws > 0 && self.miw + s.sws > 0 && !self.mbuf.is_full()
        };
        let rx_ready = !self.streams[&cs.id].rxbuf.is_empty();
        let sched = self.sched.clone();
        let s = self.streams.get_mut(&cs.id).unwrap();
        if events & sub::RETRY_RECV != 0 {
            if rx_ready {
                if let Some(sched) = &sched {
                    sched.tasklet_wakeup(tasklet);
                }
            } else {
                s.subs_recv = Some(tasklet.clone());
            }
        }
        if events & sub::RETRY_SEND != 0 {
            if sendable {
                if let Some(sched) = &sched {
                    sched.tasklet_wakeup(tasklet);
                }
            } else {
                s.subs_send = Some(tasklet.clone());
            }
        }
    }

    fn unsubscribe(&mut self, cs: CsHandle, events: SubEvents) {
        if !self.valid(cs) {
            return;
        }
        let s = self.streams.get_mut(&cs.id).unwrap();
        if events & sub::RETRY_RECV != 0 {
            s.subs_recv = None;
        }
        if events & sub::RETRY_SEND != 0 {
            s.subs_send = None;
        }
    }

    fn shutr(&mut self, cs: CsHandle, mode: ShutrMode) {
        if !self.valid(cs) {
            return;
        }
        let s = self.streams.get_mut(&cs.id).unwrap();
        if s.cs_flags.contains(CsFlags::SHR) {
            return;
        }
        s.cs_flags |= CsFlags::SHR;
        if mode == ShutrMode::Drain {
            s.rxbuf.clear();
        }
        if !s.flags.contains(H2sFlags::ES_RCVD) && s.state != H2sState::Closed {
            self.stream_error(cs.id, H2Err::Cancel);
            self.demux_noop();
        }
    }

    fn shutw(&mut self, cs: CsHandle, _mode: ShutwMode) {
        if !self.valid(cs) {
            return;
        }
        let needs_rst = {
            let s = self.streams.get_mut(&cs.id).unwrap();
            if s.cs_flags.contains(CsFlags::SHW) {
                return;
            }
            s.cs_flags |= CsFlags::SHW;
            !s.flags.contains(H2sFlags::ES_SENT) && s.state != H2sState::Closed
        };
        if needs_rst {
            // half-close by finishing the stream
            let (_, _) = self.send_data_frames(cs.id, &[], true);
            self.flush_mbuf();
        }
    }

    fn detach(&mut self, cs: CsHandle) -> bool {
        if !self.valid(cs) {
            return false;
        }
        let id = cs.id;
        if let Some(s) = self.streams.get_mut(&id) {
            s.cs = None;
            if s.state != H2sState::Closed && s.state != H2sState::Error {
                s.close();
            }
        }
        Self::list_del(&mut self.send_list, id);
        Self::list_del(&mut self.fctl_list, id);
        Self::list_del(&mut self.blocked_list, id);
        self.nb_cs = self.nb_cs.saturating_sub(1);
        self.nb_streams = self.nb_streams.saturating_sub(1);
        self.refresh_timeout();

        self.flags.contains(H2cFlags::GOAWAY_SENT) && self.nb_cs == 0 && self.mbuf.is_empty()
    }

    fn attach(&mut self) -> Option<CsHandle> {
        self.new_backend_stream()
    }

    fn destroy(&mut self) {
        for s in self.streams.values_mut() {
            s.cs = None;
            s.close();
        }
        self.send_list.clear();
        self.fctl_list.clear();
        self.blocked_list.clear();
        self.nb_cs = 0;
        self.nb_streams = 0;
        self.state = H2cState::Error2;
        self.conn.shutw(false);
    }

    fn first_cs(&self) -> Option<CsHandle> {
        self.streams.values().find_map(|s| s.cs)
    }

    fn ctl(&self, op: MuxCtl) -> u32 {
        match op {
            MuxCtl::Status => {
                let ready = self.flags.contains(H2cFlags::SETTINGS_SENT)
                    && !self.conn.handshaking()
                    && !matches!(self.state, H2cState::Error | H2cState::Error2);
                if ready { MUX_STATUS_READY } else { 0 }
            }
        }
    }

    fn avail_streams(&self) -> u32 {
        self.opts.h2.max_concurrent_streams.saturating_sub(self.nb_streams)
    }

    fn used_streams(&self) -> u32 {
        self.nb_cs
    }

    fn next_expire(&self) -> Tick {
        self.expire
    }

    /// Errored streams observe the timeout; an empty connection is released.
    fn timeout_fired(&mut self, now: Tick) -> bool {
        if !self.expire.is_expired(now) {
            return false;
        }
        if self.nb_cs == 0 {
            return true;
        }
        self.conn_error(H2Err::NoError);
        for s in self.streams.values_mut() {
            s.cs_flags |= CsFlags::ERROR;
        }
        false
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
            "h2c.st={:?} err={:?} dsi={} dpl={} dbuf={}/{} mbuf={}B streams={} maxid={}",
            self.state,
            self.errcode,
            self.dsi,
            self.dpl,
            self.dbuf.data(),
            self.dbuf.size(),
            self.mbuf.bytes(),
            self.streams.len(),
            self.max_id,
        )
    }
}

impl H2Mux {
    /// Drives the RST emission scheduled by `stream_error` when demux is not
    /// otherwise running.
    fn demux_noop(&mut self) {
        if self.state == H2cState::FrameE {
            let id = self.dsi;
            let code = self.rst_code.unwrap_or_else(|| self.stream_errcode(id));
            if self.queue_frame(FT_RST_STREAM, 0, id, &(code as u32).to_be_bytes()) {
                self.rst_code = None;
                if let Some(s) = self.streams.get_mut(&id) {
                    s.flags |= H2sFlags::RST_SENT;
                    s.close();
                }
                self.state = H2cState::FrameH;
            }
            self.flush_mbuf();
        }
    }

}

/// Appends `blk` to `htx`, handing it back on failure.
fn push_back_into(htx: &mut Htx, blk: HtxBlock) -> Result<(), HtxBlock> {
    match blk {
        HtxBlock::Data(d) => {
            let n = htx.add_data(&d);
            if n < d.len() {
                return Err(HtxBlock::Data(d[n..].to_vec()));
            }
            Ok(())
        }
        HtxBlock::Hdr { name, value } => {
            htx.add_header(&name, &value).map_err(|()| HtxBlock::Hdr { name, value })
        }
        HtxBlock::Tlr { name, value } => {
            htx.add_trailer(&name, &value).map_err(|()| HtxBlock::Tlr { name, value })
        }
        HtxBlock::ReqSl(_) | HtxBlock::ResSl(_) => htx.add_stline(blk),
        HtxBlock::Eoh => htx.add_endof(HtxBlock::Eoh).map_err(|()| HtxBlock::Eoh),
        HtxBlock::Eot => htx.add_endof(HtxBlock::Eot).map_err(|()| HtxBlock::Eot),
        HtxBlock::Eom => htx.add_endof(HtxBlock::Eom).map_err(|()| HtxBlock::Eom),
    }
}
