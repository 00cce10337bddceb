pub mod h1;
pub mod h2;

use strand_buf::Htx;
use strand_sched::{FdTab, TaskRef};
use strand_timing::Tick;

use crate::{
    config::ProxyMode,
    conn_stream::{CsFlags, CsHandle, StreamLayer},
    connection::SubEvents,
};

/// Read-side shutdown behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutrMode {
    /// Swallow pending input before closing.
    Drain,
    Clean,
}

/// Write-side shutdown behavior; silent disables lingering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutwMode {
    Normal,
    Silent,
}

/// Control queries a mux answers about itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxCtl {
    /// Bit 0 set when the connection is ready for application streams.
    Status,
}

pub const MUX_STATUS_READY: u32 = 0x01;

/// Stream creation info surfaced for logging.
#[derive(Clone, Copy, Debug)]
pub struct CsInfo {
    pub create_t: Tick,
}

/// The operations every multiplexer exposes upward. One instance owns one
/// connection and all the logical streams on it.
pub trait Mux {
    /// Io driver: pump the transport, demux, notify the upper layer.
    /// Returns false once the connection is dead and must be released.
    fn wake(&mut self, up: &mut dyn StreamLayer) -> bool;

    /// Moves decoded blocks of stream `cs` into `htx`. Returns payload
    /// bytes transferred; cs flags carry EOI/EOS/error signals.
    fn rcv_buf(&mut self, cs: CsHandle, htx: &mut Htx, count: usize) -> usize;

    /// Consumes blocks from `htx` for emission on stream `cs`. Returns the
    /// payload bytes accepted.
    fn snd_buf(&mut self, cs: CsHandle, htx: &mut Htx) -> usize;

    fn cs_flags(&self, cs: CsHandle) -> CsFlags;

    /// Parks `tasklet` until the stream can make progress again.
    fn subscribe(&mut self, cs: CsHandle, events: SubEvents, tasklet: &TaskRef);

    fn unsubscribe(&mut self, cs: CsHandle, events: SubEvents);

    fn shutr(&mut self, cs: CsHandle, mode: ShutrMode);

    fn shutw(&mut self, cs: CsHandle, mode: ShutwMode);

    /// Upper layer is done with the stream. Returns true when the whole
    /// connection should be released with it.
    fn detach(&mut self, cs: CsHandle) -> bool;

    /// Binds a new outgoing stream on a reused connection, if one is
    /// available.
    fn attach(&mut self) -> Option<CsHandle>;

    /// Tears the whole mux down regardless of attached streams.
    fn destroy(&mut self);

    fn first_cs(&self) -> Option<CsHandle>;

    /// Stream creation info, when the mux tracks it.
    fn cs_info(&self, _cs: CsHandle) -> Option<CsInfo> {
        None
    }

    fn ctl(&self, op: MuxCtl) -> u32;

    fn avail_streams(&self) -> u32;

    fn used_streams(&self) -> u32;

    /// Current idle/shut deadline for the connection's timer task.
    fn next_expire(&self) -> Tick;

    /// The timer fired. Returns true when the connection must be released;
    /// with streams still attached it is flagged errored instead.
    fn timeout_fired(&mut self, now: Tick) -> bool;

    /// Moves the fd to another thread; the engine then rebuilds tasklets
    /// and the timer on the new thread and re-subscribes.
    fn takeover(&mut self, tab: &FdTab, new_tid: usize) -> bool;

    /// Diagnostic one-liner for the cli's fd dump.
    fn show_fd(&self) -> String;
}

/// Which mux drives a fresh connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxKind {
    H1,
    H2,
}

/// ALPN wins; the configured mode decides otherwise. TCP mode has no mux of
/// its own and rides on H1 in tunnel shape.
pub fn select_mux(alpn: Option<&[u8]>, mode: ProxyMode) -> MuxKind {
    match alpn {
        Some(b"h2") => MuxKind::H2,
        Some(b"http/1.1" | b"http/1.0") => MuxKind::H1,
        Some(_) | None => match mode {
            ProxyMode::Http | ProxyMode::Tcp => MuxKind::H1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_selection() {
        assert_eq!(select_mux(Some(b"h2"), ProxyMode::Http), MuxKind::H2);
        assert_eq!(select_mux(Some(b"http/1.1"), ProxyMode::Http), MuxKind::H1);
        assert_eq!(select_mux(None, ProxyMode::Http), MuxKind::H1);
        assert_eq!(select_mux(Some(b"dot"), ProxyMode::Tcp), MuxKind::H1);
    }
}
