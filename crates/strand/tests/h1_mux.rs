//! End-to-end HTTP/1 mux behavior over an in-memory transport.

use strand_buf::{Htx, HtxBlock, SlFlags, StartLine};
use strand_sched::{DynBuf, SchedTune, Scheduler, TaskAction, TaskRef};
use strand_timing::now_ms;
use strand::{
    ConnFlags, Connection, MemTransport,
    config::ProxyOpts,
    conn_stream::{CsFlags, NullStreamLayer},
    connection::sub,
    h1m::{H1Error, H1m},
    mux::{Mux, h1::H1Mux},
};

const BUFSIZE: usize = 16384;

fn front_mux(input: &[u8], opts: ProxyOpts, flags: ConnFlags) -> H1Mux {
    let conn = Connection::new(-1, Box::new(MemTransport::with_input(input)), flags);
    H1Mux::new(conn, opts, true, BUFSIZE)
}

fn back_mux(opts: ProxyOpts) -> H1Mux {
    let conn = Connection::new(-1, Box::new(MemTransport::default()), ConnFlags::empty());
    H1Mux::new(conn, opts, false, BUFSIZE)
}

fn output_of(mux: &mut H1Mux) -> Vec<u8> {
    mux.conn_mut().xprt_any().downcast_mut::<MemTransport>().unwrap().take_output()
}

/// Drives one backend exchange: emits a GET, feeds `response` back, parses
/// it, and returns the stream handle for detach checks.
fn backend_exchange(mux: &mut H1Mux, response: &[u8]) -> strand::CsHandle {
    let cs = mux.first_cs().unwrap();

    let mut req = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::request(b"GET", b"/", b"HTTP/1.1");
    sl.flags |= SlFlags::VER_11 | SlFlags::XFER_LEN;
    req.add_stline(HtxBlock::ReqSl(sl)).unwrap();
    req.add_header(b"host", b"b").unwrap();
    req.add_endof(HtxBlock::Eoh).unwrap();
    req.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut req);
    assert!(req.is_empty());

    mux.conn_mut().xprt_any().downcast_mut::<MemTransport>().unwrap().push_input(response);
    let mut up = NullStreamLayer::default();
    assert!(mux.wake(&mut up));

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut res, usize::MAX);
    assert!(mux.cs_flags(cs).contains(CsFlags::EOI));
    cs
}

#[test]
fn proxy_v1_then_request_passthrough() {
    // Scenario: PROXY line consumed by the handshake, the mux sees only the
    // http request
    let mut mux = front_mux(
        b"PROXY TCP4 192.0.2.1 198.51.100.2 56324 443\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n",
        ProxyOpts::default(),
        ConnFlags::ACCEPT_PROXY,
    );
    let mut up = NullStreamLayer::default();

    assert!(mux.wake(&mut up));
    assert_eq!(mux.conn().src.unwrap(), "192.0.2.1:56324".parse().unwrap());
    assert_eq!(mux.conn().dst.unwrap(), "198.51.100.2:443".parse().unwrap());
    assert!(mux.conn().flags.contains(ConnFlags::RCVD_PROXY));

    // handshake done; next wake pulls the request and creates the stream
    assert!(mux.wake(&mut up));
    assert_eq!(up.created.len(), 1);
    let cs = up.created[0];

    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    match htx.pop().unwrap() {
        HtxBlock::ReqSl(sl) => {
            assert_eq!(sl.meth(), b"GET");
            assert_eq!(sl.uri(), b"/");
            assert_eq!(sl.req_vsn(), b"HTTP/1.1");
        }
        b => panic!("unexpected {b:?}"),
    }
    assert_eq!(htx.pop().unwrap(), HtxBlock::Hdr { name: b"host".to_vec(), value: b"x".to_vec() });
    assert_eq!(htx.pop().unwrap(), HtxBlock::Eoh);
    assert_eq!(htx.pop().unwrap(), HtxBlock::Eom);
    assert!(htx.pop().is_none());
    assert!(mux.cs_flags(cs).contains(CsFlags::EOI));
}

#[test]
fn http10_without_keepalive_closes() {
    // Scenario: HTTP/1.0 without Connection: keep-alive ends in close mode
    let mut mux = front_mux(
        b"GET /x HTTP/1.0\r\nHost: y\r\n\r\n",
        ProxyOpts::default(),
        ConnFlags::empty(),
    );
    let mut up = NullStreamLayer::default();
    assert!(mux.wake(&mut up));
    let cs = up.created[0];

    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    // answer with a content-length response
    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.0", b"200", b"OK");
    sl.flags |= SlFlags::CLEN | SlFlags::XFER_LEN;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_header(b"content-length", b"2").unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_data(b"ok");
    res.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res);
    assert!(res.is_empty());

    let out = output_of(&mut mux);
    let text = String::from_utf8_lossy(&out);
    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{text}");
    assert!(text.contains("content-length: 2"), "{text}");
    assert!(text.ends_with("\r\n\r\nok"), "{text}");

    // close mode: write side shut once flushed, EOS observable, then the
    // detach releases the connection
    assert!(mux.cs_flags(cs).contains(CsFlags::EOS));
    assert!(mux.detach(cs), "close mode releases the connection");
}

#[test]
fn http11_keepalive_allows_next_request() {
    let mut mux = front_mux(
        b"GET /1 HTTP/1.1\r\nHost: a\r\n\r\n",
        ProxyOpts::default(),
        ConnFlags::empty(),
    );
    let mut up = NullStreamLayer::default();
    assert!(mux.wake(&mut up));
    let cs = up.created[0];

    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.1", b"200", b"OK");
    sl.flags |= SlFlags::VER_11 | SlFlags::CLEN | SlFlags::XFER_LEN;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_header(b"content-length", b"0").unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res);

    let out = output_of(&mut mux);
    let text = String::from_utf8_lossy(&out);
    // 1.1 keep-alive is implicit: no connection header emitted
    assert!(!text.to_lowercase().contains("connection:"), "{text}");

    assert!(!mux.detach(cs), "keep-alive retains the connection");
    assert_eq!(mux.used_streams(), 0);
    assert_eq!(mux.avail_streams(), 1);

    // the second request creates a fresh stream flagged not-first
    mux.conn_mut()
        .xprt_any()
        .downcast_mut::<MemTransport>()
        .unwrap()
        .push_input(b"GET /2 HTTP/1.1\r\nHost: a\r\n\r\n");
    assert!(mux.wake(&mut up));
    assert_eq!(up.created.len(), 2);
    let cs2 = up.created[1];
    assert_ne!(cs.epoch, cs2.epoch, "stale handles must not alias");
    assert!(mux.cs_flags(cs2).contains(CsFlags::NOT_FIRST));
    assert!(mux.cs_flags(cs).contains(CsFlags::ERROR), "old handle is dead");
}

#[test]
fn explicit_close_token_wins() {
    let mut mux = front_mux(
        b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
        ProxyOpts::default(),
        ConnFlags::empty(),
    );
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];
    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.1", b"204", b"No Content");
    sl.flags |= SlFlags::VER_11 | SlFlags::BODYLESS | SlFlags::XFER_LEN;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res);

    let out = output_of(&mut mux);
    let text = String::from_utf8_lossy(&out).to_lowercase();
    assert!(text.contains("connection: close"), "{text}");
    assert!(mux.detach(cs));
}

#[test]
fn chunked_response_emission_and_roundtrip() {
    // format a response with unknown length, then parse it back: the H1
    // round-trip must reproduce the message
    let mut mux = front_mux(
        b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
        ProxyOpts::default(),
        ConnFlags::empty(),
    );
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];
    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.1", b"200", b"OK");
    sl.flags |= SlFlags::VER_11;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_header(b"x-test", b"1").unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_data(b"hello ");
    mux.snd_buf(cs, &mut res);
    let mut res2 = Htx::new(Htx::DEFAULT_SIZE);
    res2.add_data(b"world");
    res2.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res2);

    let out = output_of(&mut mux);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("transfer-encoding: chunked"), "{text}");
    assert!(text.contains("6\r\nhello \r\n"), "{text}");
    assert!(text.ends_with("0\r\n\r\n"), "{text}");

    // parse it back
    let mut m = H1m::response();
    let mut parsed = Htx::new(Htx::DEFAULT_SIZE);
    let n = m.parse(&out, &mut parsed).unwrap();
    assert_eq!(n, out.len());
    let blocks: Vec<_> = parsed.iter().cloned().collect();
    assert!(blocks.contains(&HtxBlock::Data(b"hello world".to_vec())));
    assert_eq!(blocks.last(), Some(&HtxBlock::Eom));
}

#[test]
fn case_adjust_map_applied_on_output() {
    let mut opts = ProxyOpts::default();
    opts.h1.case_adjust = vec![("x-test".into(), "X-Test".into())];
    let mut mux = front_mux(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", opts, ConnFlags::empty());
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];
    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.1", b"200", b"OK");
    sl.flags |= SlFlags::VER_11 | SlFlags::CLEN | SlFlags::XFER_LEN;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_header(b"x-test", b"1").unwrap();
    res.add_header(b"content-length", b"0").unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res);

    let out = output_of(&mut mux);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("X-Test: 1"), "{text}");
}

#[test]
fn fake_keepalive_emits_keepalive_in_close_mode() {
    let mut opts = ProxyOpts::default();
    opts.h1.httpclose = true;
    opts.h1.fake_ka = true;
    let mut mux = front_mux(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", opts, ConnFlags::empty());
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];
    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.1", b"200", b"OK");
    sl.flags |= SlFlags::VER_11 | SlFlags::CLEN | SlFlags::XFER_LEN;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_header(b"content-length", b"0").unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res);

    let out = output_of(&mut mux);
    let text = String::from_utf8_lossy(&out).to_lowercase();
    assert!(text.contains("connection: keep-alive"), "{text}");
    // the mode is still close: connection released at detach
    assert!(mux.detach(cs));
}

#[test]
fn h2_preface_triggers_upgrade() {
    let mut opts = ProxyOpts::default();
    opts.h1.h2_upgrade = true;
    let mut input = Vec::new();
    input.extend_from_slice(strand::mux::h1::H2_PREFACE);
    input.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 0, 0]); // SETTINGS
    let mut mux = front_mux(&input, opts, ConnFlags::empty());
    let mut up = NullStreamLayer::default();

    assert!(mux.wake(&mut up));
    assert!(mux.upgrading());
    assert!(up.created.is_empty(), "no h1 stream on an h2 preface");

    let (conn, ibuf) = mux.take_h2_upgrade().unwrap();
    assert_eq!(ibuf.data(), input.len(), "buffered input transfers");
    drop(conn);
}

#[test]
fn parse_error_reported_and_captured() {
    let mut mux = front_mux(
        b"GET / HTTQ/9.9\r\nHost: a\r\n\r\n",
        ProxyOpts::default(),
        ConnFlags::empty(),
    );
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];

    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);
    assert!(mux.cs_flags(cs).contains(CsFlags::ERROR));

    // the capture surfaces at the next wake
    mux.wake(&mut up);
    assert_eq!(up.captures, 1);
}

#[test]
fn timeout_errors_attached_stream() {
    let mut opts = ProxyOpts::default();
    opts.timeout = 1;
    let mut mux = front_mux(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", opts, ConnFlags::empty());
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    assert_eq!(up.created.len(), 1);

    let later = now_ms().add_ms(10_000);
    assert!(!mux.timeout_fired(later), "stream attached: flagged, not released");
    let cs = up.created[0];
    assert!(mux.cs_flags(cs).contains(CsFlags::ERROR));
}

#[test]
fn subscribe_wakes_on_data() {
    let sched = Scheduler::new(1, SchedTune::default());
    let mut mux = front_mux(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", ProxyOpts::default(), ConnFlags::empty());
    mux.set_sched(sched.clone());
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];

    let tl = sched.tasklet_new(0, std::sync::Arc::new(|_t: &TaskRef, _s: u32| TaskAction::Keep));
    // data is already pending: subscribing wakes immediately
    mux.subscribe(cs, sub::RETRY_RECV, &tl);
    assert_eq!(sched.tasks_run_queue(), 1);
}

#[test]
fn response_close_token_overrides_keepalive() {
    // keep-alive request, but the response carries connection: close
    let mut mux = front_mux(
        b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
        ProxyOpts::default(),
        ConnFlags::empty(),
    );
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];
    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.1", b"200", b"OK");
    sl.flags |= SlFlags::VER_11 | SlFlags::CLEN | SlFlags::XFER_LEN;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_header(b"content-length", b"0").unwrap();
    res.add_header(b"connection", b"close").unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res);

    let out = output_of(&mut mux);
    let text = String::from_utf8_lossy(&out).to_lowercase();
    assert!(text.contains("connection: close"), "{text}");
    assert!(mux.wants_close());
    assert!(mux.detach(cs), "explicit close on the response tears down");
}

#[test]
fn peer_close_decision_forwarded_to_front() {
    // the backend side decided close (eg. server_close); the stream layer
    // relays it without any header travelling in the HTX
    let mut mux = front_mux(
        b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
        ProxyOpts::default(),
        ConnFlags::empty(),
    );
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];
    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    mux.note_peer_close(cs);

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.1", b"200", b"OK");
    sl.flags |= SlFlags::VER_11 | SlFlags::CLEN | SlFlags::XFER_LEN;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_header(b"content-length", b"0").unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res);

    let out = output_of(&mut mux);
    let text = String::from_utf8_lossy(&out).to_lowercase();
    assert!(text.contains("connection: close"), "{text}");
    assert!(mux.detach(cs));
}

#[test]
fn httpclose_option_applies_to_response_path() {
    // the request already parsed in keep-alive mode before httpclose is
    // consulted again at response time
    let mut opts = ProxyOpts::default();
    opts.h1.httpclose = true;
    let mut mux = front_mux(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", opts, ConnFlags::empty());
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let cs = up.created[0];
    let mut htx = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut htx, usize::MAX);

    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::response(b"HTTP/1.1", b"200", b"OK");
    sl.flags |= SlFlags::VER_11 | SlFlags::CLEN | SlFlags::XFER_LEN;
    res.add_stline(HtxBlock::ResSl(sl)).unwrap();
    res.add_header(b"content-length", b"0").unwrap();
    res.add_endof(HtxBlock::Eoh).unwrap();
    res.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut res);

    assert!(mux.wants_close());
    assert!(mux.detach(cs));
}

#[test]
fn backend_keepalive_connection_reused() {
    let mut mux = back_mux(ProxyOpts::default());
    let cs = backend_exchange(&mut mux, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

    assert!(!mux.wants_close(), "clean 1.1 response keeps the server side alive");
    assert!(!mux.detach(cs), "backend connection is retained for reuse");
    assert_eq!(mux.used_streams(), 0);

    let cs2 = mux.attach().unwrap();
    assert_ne!(cs.epoch, cs2.epoch, "reused connection hands out a fresh stream");
    assert!(mux.cs_flags(cs2).contains(CsFlags::NOT_FIRST));
}

#[test]
fn backend_server_close_forces_teardown() {
    let mut opts = ProxyOpts::default();
    opts.h1.server_close = true;
    let mut mux = back_mux(opts);
    let cs = backend_exchange(&mut mux, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

    assert!(mux.wants_close());
    assert!(mux.detach(cs), "server-close forces the backend connection down");
}

#[test]
fn backend_explicit_close_honored() {
    let mut mux = back_mux(ProxyOpts::default());
    let cs = backend_exchange(
        &mut mux,
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
    );

    assert!(mux.wants_close());
    assert!(mux.detach(cs));
}

#[test]
fn backend_close_delimited_response_not_reused() {
    let mut mux = back_mux(ProxyOpts::default());
    let cs = mux.first_cs().unwrap();

    let mut req = Htx::new(Htx::DEFAULT_SIZE);
    let mut sl = StartLine::request(b"GET", b"/", b"HTTP/1.1");
    sl.flags |= SlFlags::VER_11 | SlFlags::XFER_LEN;
    req.add_stline(HtxBlock::ReqSl(sl)).unwrap();
    req.add_endof(HtxBlock::Eoh).unwrap();
    req.add_endof(HtxBlock::Eom).unwrap();
    mux.snd_buf(cs, &mut req);

    mux.conn_mut()
        .xprt_any()
        .downcast_mut::<MemTransport>()
        .unwrap()
        .push_input(b"HTTP/1.0 200 OK\r\n\r\nbody until close");
    let mut up = NullStreamLayer::default();
    mux.wake(&mut up);
    let mut res = Htx::new(Htx::DEFAULT_SIZE);
    mux.rcv_buf(cs, &mut res, usize::MAX);

    assert!(mux.wants_close(), "no transfer length means no reuse");
}

#[test]
fn buffer_starvation_parks_until_release() {
    let sched = Scheduler::new(1, SchedTune::default());
    let db = DynBuf::new(sched.clone(), 1024, 1);
    let hog = db.alloc().unwrap();

    let mut mux =
        front_mux(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", ProxyOpts::default(), ConnFlags::empty());
    let tl = sched.tasklet_new(0, std::sync::Arc::new(|_t: &TaskRef, _s: u32| TaskAction::Keep));
    mux.set_dynbuf(db.clone(), tl);
    let mut up = NullStreamLayer::default();

    // no buffer budget: nothing can be read, no stream appears
    mux.wake(&mut up);
    assert!(up.created.is_empty());

    // releasing the hog wakes the parked connection tasklet
    db.release(hog);
    assert_eq!(sched.tasks_run_queue(), 1);

    mux.wake(&mut up);
    assert_eq!(up.created.len(), 1);
}

#[test]
fn eos_mid_body_is_truncation() {
    let mut m = H1m::request();
    let mut out = Htx::new(Htx::DEFAULT_SIZE);
    m.parse(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab", &mut out).unwrap();
    assert_eq!(m.report_eos(&mut out).unwrap_err(), H1Error::Truncated);
}
