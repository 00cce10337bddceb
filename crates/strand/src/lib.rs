//! Connection layer and HTTP/1 / HTTP/2 multiplexers over the strand event
//! engine.

pub mod config;
pub mod conn_stream;
pub mod connection;
pub mod engine;
pub mod h1m;
pub mod hpack;
pub mod logger;
pub mod mux;
pub mod proxy_hdr;
pub mod socks4;
pub mod xprt;

pub use config::{H1Opts, H2Opts, ProxyMode, ProxyOpts, Tune};
pub use conn_stream::{CsFlags, CsHandle, StreamLayer};
pub use connection::{ConnError, ConnFlags, Connection, ErrCode, SubEvents, WaitEvent};
pub use strand_sched::ActRet;
pub use xprt::{MemTransport, RawSock, Transport, XprtResult};
