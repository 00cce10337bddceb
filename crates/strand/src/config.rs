use serde::{Deserialize, Serialize};

/// Which application protocol a side speaks when ALPN does not decide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Http,
    Tcp,
}

fn default_runqueue_depth() -> u32 {
    200
}

fn default_bufsize() -> usize {
    16384
}

fn default_maxconn() -> u32 {
    2000
}

/// Process-level tuning, loadable from JSON by embedders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tune {
    #[serde(default = "default_runqueue_depth")]
    pub runqueue_depth: u32,
    #[serde(default)]
    pub sched_low_latency: bool,
    #[serde(default = "default_bufsize")]
    pub bufsize: usize,
    #[serde(default = "default_maxconn")]
    pub maxconn: u32,
    /// Percentage of pool allocations failed on purpose (debug knob).
    #[serde(default)]
    pub fail_alloc: u32,
}

impl Default for Tune {
    fn default() -> Self {
        Self {
            runqueue_depth: default_runqueue_depth(),
            sched_low_latency: false,
            bufsize: default_bufsize(),
            maxconn: default_maxconn(),
            fail_alloc: 0,
        }
    }
}

/// HTTP/1 behavior knobs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct H1Opts {
    /// Force `Connection: close` after each response.
    #[serde(default)]
    pub httpclose: bool,
    /// Close the server side after each request, keep the client side alive.
    #[serde(default)]
    pub server_close: bool,
    /// Emit a keep-alive Connection header even in close mode. Kept as
    /// configured; some deployments rely on the mismatch.
    #[serde(default)]
    pub fake_ka: bool,
    /// Outgoing header-name case rewrites for misbehaving peers.
    #[serde(default)]
    pub case_adjust: Vec<(String, String)>,
    /// Server-id header injected once into outgoing requests.
    #[serde(default)]
    pub server_name_hdr: Option<String>,
    /// Accept an HTTP/2 preface on the first request and hand over.
    #[serde(default)]
    pub h2_upgrade: bool,
}

fn default_header_table_size() -> u32 {
    4096
}

fn default_initial_window_size() -> u32 {
    65535
}

fn default_max_concurrent_streams() -> u32 {
    100
}

fn default_max_frame_size() -> u32 {
    16384
}

fn default_max_http_hdr() -> usize {
    101
}

/// HTTP/2 settings advertised and enforced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct H2Opts {
    /// 4096..=65536.
    #[serde(default = "default_header_table_size")]
    pub header_table_size: u32,
    /// Our receive window per stream.
    #[serde(default = "default_initial_window_size")]
    pub initial_window_size: u32,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    /// 16384..=16777215.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    /// Max decoded header fields per message.
    #[serde(default = "default_max_http_hdr")]
    pub max_http_hdr: usize,
}

impl Default for H2Opts {
    fn default() -> Self {
        Self {
            header_table_size: default_header_table_size(),
            initial_window_size: default_initial_window_size(),
            max_concurrent_streams: default_max_concurrent_streams(),
            max_frame_size: default_max_frame_size(),
            max_http_hdr: default_max_http_hdr(),
        }
    }
}

fn default_timeout() -> u32 {
    10_000
}

/// Per-proxy options shared by the connection layer and the muxes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyOpts {
    #[serde(default)]
    pub mode: ProxyMode,
    /// Idle timeout in ms.
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    /// Post-GOAWAY / half-close timeout in ms.
    #[serde(default = "default_timeout")]
    pub shut_timeout: u32,
    /// The listener or backend is being drained; refuse to keep connections.
    #[serde(default)]
    pub stopping: bool,
    #[serde(default)]
    pub h1: H1Opts,
    #[serde(default)]
    pub h2: H2Opts,
}

impl Default for ProxyOpts {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Http,
            timeout: default_timeout(),
            shut_timeout: default_timeout(),
            stopping: false,
            h1: H1Opts::default(),
            h2: H2Opts::default(),
        }
    }
}
