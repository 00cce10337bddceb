use bitflags::bitflags;
use strand_buf::{Htx, HtxBlock, SlFlags, StartLine};
use strand_utils::Ist;
use thiserror::Error;

bitflags! {
    /// Knowledge accumulated while parsing one H1 message.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct H1mFlags: u32 {
        /// Body length from Content-Length.
        const CLEN         = 0x0001;
        /// Chunked transfer coding.
        const CHNK         = 0x0002;
        /// The message length is known.
        const XFER_LEN     = 0x0004;
        const CONN_CLO     = 0x0008;
        const CONN_KAL     = 0x0010;
        const CONN_UPG     = 0x0020;
        const VER_11       = 0x0040;
        const METH_CONNECT = 0x0080;
        const METH_HEAD    = 0x0100;
        /// Response that cannot carry a body (1xx/204/304).
        const BODYLESS     = 0x0200;
        /// Do not emit the implicit headers on output.
        const NO_PHDR      = 0x0400;
    }
}

/// Parser position in the message, one instance per direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum H1mState {
    /// Before the request or status line.
    #[default]
    Before,
    /// Content-length (or close-delimited) body bytes.
    Data,
    /// Expecting a chunk-size line.
    ChunkSz,
    /// Expecting the CRLF closing a chunk.
    ChunkCrlf,
    /// Optional trailer block after the last chunk.
    Trailers,
    /// Message complete.
    Done,
    /// Pass-through both ways; no further framing.
    Tunnel,
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum H1Error {
    /// Malformed input; `pos` is the offending byte offset.
    #[error("parse error at byte {pos}")]
    Parse { pos: usize },
    /// Headers exceed what a buffer can ever hold.
    #[error("header block too large")]
    TooLarge,
    /// Input ended inside a framed message.
    #[error("message truncated")]
    Truncated,
}

/// Incremental H1 message parser: consumes wire bytes, emits HTX blocks.
#[derive(Debug, Default)]
pub struct H1m {
    response: bool,
    pub state: H1mState,
    pub flags: H1mFlags,
    /// Bytes remaining in the current chunk or content-length body.
    pub curr_len: u64,
    /// Total body length when known.
    pub body_len: u64,
    /// Response status code; 0 before the status line is parsed.
    pub status: u16,
    /// Offset of the first parse error, for captures.
    pub err_pos: Option<usize>,
}

impl H1m {
    pub fn request() -> Self {
        Self::default()
    }

    pub fn response() -> Self {
        Self { response: true, ..Self::default() }
    }

    pub fn is_response(&self) -> bool {
        self.response
    }

    /// Resets for the next message on a keep-alive connection.
    pub fn reset(&mut self) {
        *self = if self.response { Self::response() } else { Self::request() };
    }

    fn error(&mut self, pos: usize) -> H1Error {
        self.state = H1mState::Error;
        self.err_pos = Some(pos);
        H1Error::Parse { pos }
    }

    /// Consumes as much of `input` as possible, appending blocks to `htx`.
    /// Returns the number of bytes eaten; parsing stops early when `htx`
    /// runs out of room (the caller retries once space frees up).
    pub fn parse(&mut self, input: &[u8], htx: &mut Htx) -> Result<usize, H1Error> {
        let mut ofs = 0usize;

        loop {
            match self.state {
                H1mState::Before => {
                    // tolerate leading empty lines between pipelined messages
                    while ofs < input.len() && (input[ofs] == b'\r' || input[ofs] == b'\n') {
                        ofs += 1;
                    }
                    if ofs == input.len() {
                        return Ok(ofs);
                    }
                    let Some(hdrs_end) = find_hdrs_end(&input[ofs..]) else {
                        return Ok(ofs);
                    };
                    let block = &input[ofs..ofs + hdrs_end];
                    self.parse_hdr_block(block, htx).map_err(|e| match e {
                        H1Error::Parse { pos } => self.error(ofs + pos),
                        e => e,
                    })?;
                    ofs += hdrs_end;
                }
                H1mState::Data => {
                    if self.flags.contains(H1mFlags::XFER_LEN)
                        && !self.flags.contains(H1mFlags::CHNK)
                    {
                        // content-length body
                        let take =
                            (self.curr_len.min((input.len() - ofs) as u64)) as usize;
                        let eaten = htx.add_data(&input[ofs..ofs + take]);
                        ofs += eaten;
                        self.curr_len -= eaten as u64;
                        if eaten < take {
                            return Ok(ofs);
                        }
                        if self.curr_len == 0 {
                            htx.add_endof(HtxBlock::Eom).map_err(|()| H1Error::TooLarge)?;
                            self.state = H1mState::Done;
                            continue;
                        }
                        return Ok(ofs);
                    }
                    if self.flags.contains(H1mFlags::CHNK) {
                        // inside a chunk
                        let take =
                            (self.curr_len.min((input.len() - ofs) as u64)) as usize;
                        let eaten = htx.add_data(&input[ofs..ofs + take]);
                        ofs += eaten;
                        self.curr_len -= eaten as u64;
                        if self.curr_len == 0 {
                            self.state = H1mState::ChunkCrlf;
                            continue;
                        }
                        return Ok(ofs);
                    }
                    // close-delimited: everything is body
                    let eaten = htx.add_data(&input[ofs..]);
                    ofs += eaten;
                    self.body_len += eaten as u64;
                    return Ok(ofs);
                }
                H1mState::ChunkSz => {
                    let rest = &input[ofs..];
                    let Some(eol) = find_crlf(rest) else {
                        return Ok(ofs);
                    };
                    let line = &rest[..eol];
                    // chunk extensions after ';' are skipped
                    let szpart = line.split(|&c| c == b';').next().unwrap_or(line);
                    let sz = parse_hex(szpart).ok_or_else(|| self.error(ofs))?;
                    ofs += eol + 2;
                    self.body_len += sz;
                    if sz == 0 {
                        self.state = H1mState::Trailers;
                    } else {
                        self.curr_len = sz;
                        self.state = H1mState::Data;
                    }
                }
                H1mState::ChunkCrlf => {
                    let rest = &input[ofs..];
                    if rest.len() < 2 {
                        return Ok(ofs);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(self.error(ofs));
                    }
                    ofs += 2;
                    self.state = H1mState::ChunkSz;
                }
                H1mState::Trailers => {
                    let rest = &input[ofs..];
                    let Some(end) = find_trailers_end(rest) else {
                        return Ok(ofs);
                    };
                    let mut at = 0usize;
                    while at < end - 2 {
                        let eol = find_crlf(&rest[at..]).unwrap();
                        let line = &rest[at..at + eol];
                        let (name, value) =
                            split_hdr(line).ok_or_else(|| self.error(ofs + at))?;
                        htx.add_trailer(name, value).map_err(|()| H1Error::TooLarge)?;
                        at += eol + 2;
                    }
                    htx.add_endof(HtxBlock::Eot).map_err(|()| H1Error::TooLarge)?;
                    htx.add_endof(HtxBlock::Eom).map_err(|()| H1Error::TooLarge)?;
                    ofs += end;
                    self.state = H1mState::Done;
                }
                H1mState::Tunnel => {
                    let eaten = htx.add_data(&input[ofs..]);
                    ofs += eaten;
                    return Ok(ofs);
                }
                H1mState::Done | H1mState::Error => return Ok(ofs),
            }
        }
    }

    /// The peer closed its side. Close-delimited bodies complete here; a
    /// close inside framed content is a truncation error.
    pub fn report_eos(&mut self, htx: &mut Htx) -> Result<(), H1Error> {
        match self.state {
            H1mState::Data
                if !self.flags.contains(H1mFlags::XFER_LEN)
                    && !self.flags.contains(H1mFlags::CHNK) =>
            {
                htx.add_endof(HtxBlock::Eom).map_err(|()| H1Error::TooLarge)?;
                self.state = H1mState::Done;
                Ok(())
            }
            H1mState::Before | H1mState::Done | H1mState::Tunnel | H1mState::Error => Ok(()),
            _ => {
                self.state = H1mState::Error;
                Err(H1Error::Truncated)
            }
        }
    }

    /// Parses a complete start-line + header block and classifies the body.
    fn parse_hdr_block(&mut self, block: &[u8], htx: &mut Htx) -> Result<(), H1Error> {
        let eol = find_crlf(block).ok_or(H1Error::Parse { pos: 0 })?;
        let mut sl = if self.response {
            self.parse_status_line(&block[..eol])?
        } else {
            self.parse_request_line(&block[..eol])?
        };

        // collect raw headers first; classification may rewrite framing
        let mut hdrs: Vec<(&[u8], Vec<u8>)> = Vec::new();
        let mut at = eol + 2;
        while at < block.len() - 2 {
            let eol = find_crlf(&block[at..]).ok_or(H1Error::Parse { pos: at })?;
            let line = &block[at..at + eol];
            if line[0] == b' ' || line[0] == b'\t' {
                // obs-fold: continuation of the previous value
                let (_, last) = hdrs.last_mut().ok_or(H1Error::Parse { pos: at })?;
                last.push(b' ');
                last.extend_from_slice(Ist(line).trim().0);
            } else {
                let (name, value) = split_hdr(line).ok_or(H1Error::Parse { pos: at })?;
                hdrs.push((name, value.to_vec()));
            }
            at += eol + 2;
        }

        let mut clen: Option<u64> = None;
        for (name, value) in &hdrs {
            let v = Ist(value);
            if name.eq_ignore_ascii_case(b"content-length") {
                let n = v.trim().parse_uint().ok_or(H1Error::Parse { pos: 0 })?;
                if let Some(prev) = clen {
                    if prev != n {
                        return Err(H1Error::Parse { pos: 0 });
                    }
                } else {
                    clen = Some(n);
                }
            } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
                if v.has_token(b"chunked") {
                    self.flags |= H1mFlags::CHNK | H1mFlags::XFER_LEN;
                }
            } else if name.eq_ignore_ascii_case(b"connection") {
                if v.has_token(b"close") {
                    self.flags |= H1mFlags::CONN_CLO;
                }
                if v.has_token(b"keep-alive") {
                    self.flags |= H1mFlags::CONN_KAL;
                }
                if v.has_token(b"upgrade") {
                    self.flags |= H1mFlags::CONN_UPG;
                }
            }
        }

        // chunked wins over content-length
        if !self.flags.contains(H1mFlags::CHNK) {
            if let Some(n) = clen {
                self.flags |= H1mFlags::CLEN | H1mFlags::XFER_LEN;
                self.curr_len = n;
                self.body_len = n;
            }
        }

        let status = if self.response { sl.status() } else { 0 };
        if self.response
            && ((100..200).contains(&status) || status == 204 || status == 304)
        {
            self.flags |= H1mFlags::BODYLESS | H1mFlags::XFER_LEN;
            self.curr_len = 0;
            self.body_len = 0;
        }

        // mirror parser knowledge on the start line for upper layers
        if self.flags.contains(H1mFlags::VER_11) {
            sl.flags |= SlFlags::VER_11;
        }
        if self.flags.contains(H1mFlags::XFER_LEN) {
            sl.flags |= SlFlags::XFER_LEN;
        }
        if self.flags.contains(H1mFlags::CLEN) {
            sl.flags |= SlFlags::CLEN;
        }
        if self.flags.contains(H1mFlags::CHNK) {
            sl.flags |= SlFlags::CHNK;
        }
        if self.flags.contains(H1mFlags::BODYLESS) {
            sl.flags |= SlFlags::BODYLESS;
        }
        if self.flags.contains(H1mFlags::METH_CONNECT) {
            sl.flags |= SlFlags::CONNECT;
        }

        let blk = if self.response { HtxBlock::ResSl(sl) } else { HtxBlock::ReqSl(sl) };
        htx.add_stline(blk).map_err(|_| H1Error::TooLarge)?;
        for (name, value) in &hdrs {
            htx.add_header(name, Ist(value).trim().0).map_err(|()| H1Error::TooLarge)?;
        }
        htx.add_endof(HtxBlock::Eoh).map_err(|()| H1Error::TooLarge)?;

        // classify what follows the headers
        if !self.response && self.flags.contains(H1mFlags::METH_CONNECT) {
            // CONNECT has no body; tunnel starts if the answer is 2xx
            htx.add_endof(HtxBlock::Eom).map_err(|()| H1Error::TooLarge)?;
            self.state = H1mState::Done;
        } else if self.flags.contains(H1mFlags::CHNK) {
            self.state = H1mState::ChunkSz;
        } else if self.flags.contains(H1mFlags::CLEN) {
            if self.curr_len == 0 {
                htx.add_endof(HtxBlock::Eom).map_err(|()| H1Error::TooLarge)?;
                self.state = H1mState::Done;
            } else {
                self.state = H1mState::Data;
            }
        } else if self.response {
            if self.flags.contains(H1mFlags::BODYLESS) {
                htx.add_endof(HtxBlock::Eom).map_err(|()| H1Error::TooLarge)?;
                self.state = H1mState::Done;
            } else {
                // delimited by connection close
                self.state = H1mState::Data;
            }
        } else {
            // requests without framing have no body
            htx.add_endof(HtxBlock::Eom).map_err(|()| H1Error::TooLarge)?;
            self.state = H1mState::Done;
        }
        Ok(())
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<StartLine, H1Error> {
        let mut parts = line.split(|&c| c == b' ').filter(|p| !p.is_empty());
        let meth = parts.next().ok_or(H1Error::Parse { pos: 0 })?;
        let uri = parts.next().ok_or(H1Error::Parse { pos: 0 })?;
        let vsn = parts.next().ok_or(H1Error::Parse { pos: 0 })?;
        if parts.next().is_some() {
            return Err(H1Error::Parse { pos: 0 });
        }
        self.parse_version(vsn)?;
        if meth == b"CONNECT" {
            self.flags |= H1mFlags::METH_CONNECT;
        } else if meth == b"HEAD" {
            self.flags |= H1mFlags::METH_HEAD;
        }
        Ok(StartLine::request(meth, uri, vsn))
    }

    fn parse_status_line(&mut self, line: &[u8]) -> Result<StartLine, H1Error> {
        let mut it = line.splitn(3, |&c| c == b' ');
        let vsn = it.next().ok_or(H1Error::Parse { pos: 0 })?;
        let code = it.next().ok_or(H1Error::Parse { pos: 0 })?;
        let reason = it.next().unwrap_or(b"");
        self.parse_version(vsn)?;
        if code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
            return Err(H1Error::Parse { pos: 0 });
        }
        self.status = u16::from(code[0] - b'0') * 100
            + u16::from(code[1] - b'0') * 10
            + u16::from(code[2] - b'0');
        Ok(StartLine::response(vsn, code, reason))
    }

    fn parse_version(&mut self, vsn: &[u8]) -> Result<(), H1Error> {
        if !vsn.starts_with(b"HTTP/") || vsn.len() != 8 || vsn[6] != b'.' {
            return Err(H1Error::Parse { pos: 0 });
        }
        let major = vsn[5];
        let minor = vsn[7];
        if !major.is_ascii_digit() || !minor.is_ascii_digit() {
            return Err(H1Error::Parse { pos: 0 });
        }
        if major > b'1' || (major == b'1' && minor >= b'1') {
            self.flags |= H1mFlags::VER_11;
        }
        Ok(())
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Offset one past the CRLFCRLF closing a header block.
fn find_hdrs_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Offset one past the blank line closing a trailer block (which may be the
/// block's very first line).
fn find_trailers_end(data: &[u8]) -> Option<usize> {
    if data.starts_with(b"\r\n") {
        return Some(2);
    }
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn split_hdr(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&c| c == b':')?;
    let name = &line[..colon];
    if name.is_empty() || name.iter().any(|&c| c == b' ' || c == b'\t') {
        return None;
    }
    Some((name, &line[colon + 1..]))
}

fn parse_hex(data: &[u8]) -> Option<u64> {
    if data.is_empty() || data.len() > 16 {
        return None;
    }
    let mut v: u64 = 0;
    for &c in data {
        let d = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => return None,
        };
        v = (v << 4) | u64::from(d);
    }
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn htx() -> Htx {
        Htx::new(Htx::DEFAULT_SIZE)
    }

    #[test]
    fn simple_get() {
        let mut m = H1m::request();
        let mut out = htx();
        let input = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let n = m.parse(input, &mut out).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(m.state, H1mState::Done);
        assert!(m.flags.contains(H1mFlags::VER_11));

        match out.pop().unwrap() {
            HtxBlock::ReqSl(sl) => {
                assert_eq!(sl.meth(), b"GET");
                assert_eq!(sl.uri(), b"/");
                assert_eq!(sl.req_vsn(), b"HTTP/1.1");
                assert!(sl.flags.contains(SlFlags::VER_11));
            }
            b => panic!("unexpected {b:?}"),
        }
        assert_eq!(
            out.pop().unwrap(),
            HtxBlock::Hdr { name: b"host".to_vec(), value: b"x".to_vec() }
        );
        assert_eq!(out.pop().unwrap(), HtxBlock::Eoh);
        assert_eq!(out.pop().unwrap(), HtxBlock::Eom);
        assert!(out.pop().is_none());
    }

    #[test]
    fn incremental_headers() {
        let mut m = H1m::request();
        let mut out = htx();
        assert_eq!(m.parse(b"GET / HT", &mut out).unwrap(), 0);
        assert_eq!(m.parse(b"GET / HTTP/1.1\r\nHost:", &mut out).unwrap(), 0);
        let full = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(m.parse(full, &mut out).unwrap(), full.len());
        assert_eq!(m.state, H1mState::Done);
    }

    #[test]
    fn content_length_body() {
        let mut m = H1m::request();
        let mut out = htx();
        let input = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let n = m.parse(input, &mut out).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(m.state, H1mState::Done);
        assert_eq!(m.body_len, 5);
        let blocks: Vec<_> = out.iter().cloned().collect();
        assert!(blocks.contains(&HtxBlock::Data(b"hello".to_vec())));
        assert_eq!(blocks.last(), Some(&HtxBlock::Eom));
    }

    #[test]
    fn split_body_arrives_later() {
        let mut m = H1m::request();
        let mut out = htx();
        let part1 = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhe";
        let n = m.parse(part1, &mut out).unwrap();
        assert_eq!(n, part1.len());
        assert_eq!(m.state, H1mState::Data);
        assert_eq!(m.curr_len, 3);
        let n = m.parse(b"llo", &mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(m.state, H1mState::Done);
    }

    #[test]
    fn chunked_with_trailers() {
        let mut m = H1m::request();
        let mut out = htx();
        let input = b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                      5\r\nhello\r\n6\r\n world\r\n0\r\nX-Sum: ok\r\n\r\n";
        let n = m.parse(input, &mut out).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(m.state, H1mState::Done);
        assert_eq!(m.body_len, 11);
        let blocks: Vec<_> = out.iter().cloned().collect();
        assert!(blocks.contains(&HtxBlock::Data(b"hello world".to_vec())));
        assert!(blocks.contains(&HtxBlock::Tlr { name: b"x-sum".to_vec(), value: b"ok".to_vec() }));
        assert_eq!(blocks.last(), Some(&HtxBlock::Eom));
    }

    #[test]
    fn chunk_size_extensions_skipped() {
        let mut m = H1m::request();
        let mut out = htx();
        let input =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nabc\r\n0\r\n\r\n";
        let n = m.parse(input, &mut out).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(m.state, H1mState::Done);
    }

    #[test]
    fn response_close_delimited() {
        let mut m = H1m::response();
        let mut out = htx();
        let input = b"HTTP/1.0 200 OK\r\n\r\nsome body";
        let n = m.parse(input, &mut out).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(m.state, H1mState::Data);
        assert_eq!(m.status, 200);
        assert!(!m.flags.contains(H1mFlags::XFER_LEN));
        m.report_eos(&mut out).unwrap();
        assert_eq!(m.state, H1mState::Done);
    }

    #[test]
    fn response_204_bodyless() {
        let mut m = H1m::response();
        let mut out = htx();
        let input = b"HTTP/1.1 204 No Content\r\n\r\n";
        m.parse(input, &mut out).unwrap();
        assert_eq!(m.state, H1mState::Done);
        assert!(m.flags.contains(H1mFlags::BODYLESS));
    }

    #[test]
    fn eos_inside_framed_body_is_truncation() {
        let mut m = H1m::request();
        let mut out = htx();
        m.parse(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc", &mut out).unwrap();
        assert_eq!(m.report_eos(&mut out).unwrap_err(), H1Error::Truncated);
        assert_eq!(m.state, H1mState::Error);
    }

    #[test]
    fn duplicate_mismatched_content_length_rejected() {
        let mut m = H1m::request();
        let mut out = htx();
        let input = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        assert!(m.parse(input, &mut out).is_err());
        assert_eq!(m.state, H1mState::Error);
        assert!(m.err_pos.is_some());
    }

    #[test]
    fn bad_version_rejected() {
        let mut m = H1m::request();
        let mut out = htx();
        assert!(m.parse(b"GET / HTTQ/1.1\r\n\r\n", &mut out).is_err());
    }

    #[test]
    fn connection_tokens() {
        let mut m = H1m::request();
        let mut out = htx();
        m.parse(b"GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\n\r\n", &mut out).unwrap();
        assert!(m.flags.contains(H1mFlags::CONN_KAL));
        assert!(m.flags.contains(H1mFlags::CONN_UPG));
        assert!(!m.flags.contains(H1mFlags::CONN_CLO));
    }

    #[test]
    fn obs_fold_continuation() {
        let mut m = H1m::request();
        let mut out = htx();
        m.parse(b"GET / HTTP/1.1\r\nX-Long: part1\r\n part2\r\n\r\n", &mut out).unwrap();
        assert_eq!(out.header(b"x-long"), Some(&b"part1 part2"[..]));
    }

    #[test]
    fn connect_request_has_no_body() {
        let mut m = H1m::request();
        let mut out = htx();
        m.parse(b"CONNECT host:443 HTTP/1.1\r\nHost: host\r\n\r\n", &mut out).unwrap();
        assert_eq!(m.state, H1mState::Done);
        assert!(m.flags.contains(H1mFlags::METH_CONNECT));
    }
}
