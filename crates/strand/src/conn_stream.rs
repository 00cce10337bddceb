use bitflags::bitflags;

bitflags! {
    /// State bits of a conn_stream, the per-logical-stream handle between a
    /// multiplexer and the upper layer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CsFlags: u32 {
        /// More rx data is pending inside the mux.
        const RCV_MORE    = 0x0001;
        /// The mux needs room in the rx channel before it can deliver more.
        const WANT_ROOM   = 0x0002;
        /// End of stream seen at the socket level.
        const EOS         = 0x0004;
        /// End of logical input message delivered.
        const EOI         = 0x0008;
        /// Fatal error reported to the upper layer.
        const ERROR       = 0x0010;
        /// Error seen but bytes remain to be delivered first.
        const ERR_PENDING = 0x0020;
        /// Kernel splicing usable for this stream.
        const MAY_SPLICE  = 0x0040;
        /// Write side shut.
        const SHW         = 0x0080;
        /// Read side shut.
        const SHR         = 0x0100;
        /// Detaching must also kill the connection.
        const KILL_CONN   = 0x0200;
        /// Not the first request on the connection.
        const NOT_FIRST   = 0x0400;
        /// Upper layer must wait for the transport handshake.
        const WAIT_FOR_HS = 0x0800;
        /// Peer acknowledged end of stream (eg. H2 END_STREAM received).
        const ES_RCVD     = 0x1000;
    }
}

/// Epoch-stamped stream handle. The mux owns the stream storage; a handle
/// whose epoch no longer matches (after detach or takeover recycled the
/// slot) is dead and every accessor treats it as such.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CsHandle {
    pub id: u32,
    pub epoch: u32,
}

impl CsHandle {
    pub const fn new(id: u32, epoch: u32) -> Self {
        Self { id, epoch }
    }
}

/// Callbacks the upper (stream) layer provides to the muxes.
pub trait StreamLayer {
    /// A new incoming stream was accepted; false refuses it.
    fn stream_new(&mut self, cs: CsHandle) -> bool;

    /// State changed for `cs`: data readable, window opened, or an error is
    /// observable through the cs flags.
    fn wake(&mut self, cs: CsHandle);

    /// Snapshot of a malformed message for diagnostics.
    fn capture_error(&mut self, input: &[u8], is_response: bool);

    /// Session-level log line.
    fn sess_log(&mut self, event: &str);
}

/// A no-op upper layer for tests and TCP-mode passthrough.
#[derive(Default)]
pub struct NullStreamLayer {
    pub created: Vec<CsHandle>,
    pub wakes: Vec<CsHandle>,
    pub captures: usize,
}

impl StreamLayer for NullStreamLayer {
    fn stream_new(&mut self, cs: CsHandle) -> bool {
        self.created.push(cs);
        true
    }

    fn wake(&mut self, cs: CsHandle) {
        self.wakes.push(cs);
    }

    fn capture_error(&mut self, _input: &[u8], _is_response: bool) {
        self.captures += 1;
    }

    fn sess_log(&mut self, _event: &str) {}
}
