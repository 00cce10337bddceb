use std::collections::VecDeque;

use strand_buf::Buffer;

/// Outcome of one transport read or write attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum XprtResult {
    /// Bytes moved (0 is a valid write outcome when the buffer was empty).
    Bytes(usize),
    /// Not ready; subscribe and retry.
    WouldBlock,
    /// Orderly shutdown from the peer (reads only).
    Closed,
    /// Hard transport error with the errno that produced it.
    Error(i32),
}

/// Byte-level transport under a connection. The raw implementation talks to
/// the socket directly; TLS stacks implement the same trait and are opaque
/// to everything above.
pub trait Transport: Send {
    fn name(&self) -> &'static str;

    /// Non-destructive read of the leading bytes, for handshake parsers
    /// that must not consume application data.
    fn peek(&mut self, fd: i32, dst: &mut [u8]) -> XprtResult;

    /// Consumes exactly `n` bytes previously seen by [`peek`](Self::peek).
    fn drain(&mut self, fd: i32, n: usize) -> XprtResult;

    /// Appends up to `count` bytes into `buf`.
    fn rcv_buf(&mut self, fd: i32, buf: &mut Buffer, count: usize) -> XprtResult;

    /// Sends from the head of `buf`, consuming what was written.
    fn snd_buf(&mut self, fd: i32, buf: &mut Buffer, count: usize) -> XprtResult;

    /// Transport-level handshake; true when complete (raw has none).
    fn handshake(&mut self, _fd: i32) -> Result<bool, i32> {
        Ok(true)
    }

    fn shutw(&mut self, fd: i32, clean: bool);

    /// Concrete-type access for harnesses driving in-memory transports.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Plain socket transport.
pub struct RawSock;

impl RawSock {
    fn errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    }
}

impl Transport for RawSock {
    fn name(&self) -> &'static str {
        "RAW"
    }

    fn peek(&mut self, fd: i32, dst: &mut [u8]) -> XprtResult {
        loop {
            let n = unsafe { libc::recv(fd, dst.as_mut_ptr().cast(), dst.len(), libc::MSG_PEEK) };
            if n > 0 {
                return XprtResult::Bytes(n as usize);
            }
            if n == 0 {
                return XprtResult::Closed;
            }
            match Self::errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return XprtResult::WouldBlock,
                e => return XprtResult::Error(e),
            }
        }
    }

    fn drain(&mut self, fd: i32, n: usize) -> XprtResult {
        let mut tmp = vec![0u8; n];
        loop {
            let r = unsafe { libc::recv(fd, tmp.as_mut_ptr().cast(), n, 0) };
            if r == n as isize {
                return XprtResult::Bytes(n);
            }
            if r < 0 && Self::errno() == libc::EINTR {
                continue;
            }
            // the peeked bytes must be re-readable in one go
            return XprtResult::Error(libc::EIO);
        }
    }

    fn rcv_buf(&mut self, fd: i32, buf: &mut Buffer, count: usize) -> XprtResult {
        let mut total = 0usize;
        while total < count && !buf.is_full() {
            let space = buf.space_slice();
            let want = space.len().min(count - total);
            let n = unsafe { libc::recv(fd, space.as_mut_ptr().cast(), want, 0) };
            if n > 0 {
                buf.add(n as usize);
                total += n as usize;
                if (n as usize) < want {
                    break;
                }
                continue;
            }
            if n == 0 {
                return if total > 0 { XprtResult::Bytes(total) } else { XprtResult::Closed };
            }
            match Self::errno() {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    return if total > 0 { XprtResult::Bytes(total) } else { XprtResult::WouldBlock };
                }
                e => return XprtResult::Error(e),
            }
        }
        XprtResult::Bytes(total)
    }

    fn snd_buf(&mut self, fd: i32, buf: &mut Buffer, count: usize) -> XprtResult {
        let mut total = 0usize;
        while total < count && !buf.is_empty() {
            let (head, _) = buf.data_slices();
            let want = head.len().min(count - total);
            let n = unsafe {
                libc::send(fd, head.as_ptr().cast(), want, libc::MSG_NOSIGNAL)
            };
            if n > 0 {
                buf.del(n as usize);
                total += n as usize;
                if (n as usize) < want {
                    break;
                }
                continue;
            }
            match Self::errno() {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    return if total > 0 { XprtResult::Bytes(total) } else { XprtResult::WouldBlock };
                }
                e => return XprtResult::Error(e),
            }
        }
        XprtResult::Bytes(total)
    }

    fn shutw(&mut self, fd: i32, clean: bool) {
        if !clean {
            let nolinger = libc::linger { l_onoff: 1, l_linger: 0 };
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    std::ptr::addr_of!(nolinger).cast(),
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
        }
        unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// In-memory transport driving the muxes and handshake parsers in tests:
/// bytes pushed into `rx` come out of reads, writes land in `tx`.
#[derive(Default)]
pub struct MemTransport {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    /// Peer performed an orderly shutdown after `rx` drains.
    pub eof: bool,
    /// Fail every operation with this errno.
    pub broken: Option<i32>,
}

impl MemTransport {
    pub fn with_input(input: &[u8]) -> Self {
        Self { rx: input.iter().copied().collect(), ..Default::default() }
    }

    pub fn push_input(&mut self, input: &[u8]) {
        self.rx.extend(input.iter().copied());
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

impl Transport for MemTransport {
    fn name(&self) -> &'static str {
        "MEM"
    }

    fn peek(&mut self, _fd: i32, dst: &mut [u8]) -> XprtResult {
        if let Some(e) = self.broken {
            return XprtResult::Error(e);
        }
        if self.rx.is_empty() {
            return if self.eof { XprtResult::Closed } else { XprtResult::WouldBlock };
        }
        let n = dst.len().min(self.rx.len());
        for (i, d) in dst.iter_mut().enumerate().take(n) {
            *d = self.rx[i];
        }
        XprtResult::Bytes(n)
    }

    fn drain(&mut self, _fd: i32, n: usize) -> XprtResult {
        if self.rx.len() < n {
            return XprtResult::Error(libc::EIO);
        }
        self.rx.drain(..n);
        XprtResult::Bytes(n)
    }

    fn rcv_buf(&mut self, _fd: i32, buf: &mut Buffer, count: usize) -> XprtResult {
        if let Some(e) = self.broken {
            return XprtResult::Error(e);
        }
        if self.rx.is_empty() {
            return if self.eof { XprtResult::Closed } else { XprtResult::WouldBlock };
        }
        let mut total = 0;
        while total < count && !buf.is_full() {
            let Some(&b) = self.rx.front() else { break };
            if buf.put(&[b]) == 0 {
                break;
            }
            self.rx.pop_front();
            total += 1;
        }
        XprtResult::Bytes(total)
    }

    fn snd_buf(&mut self, _fd: i32, buf: &mut Buffer, count: usize) -> XprtResult {
        if let Some(e) = self.broken {
            return XprtResult::Error(e);
        }
        let n = count.min(buf.data());
        let mut tmp = vec![0u8; n];
        buf.get(&mut tmp);
        self.tx.extend_from_slice(&tmp);
        XprtResult::Bytes(n)
    }

    fn shutw(&mut self, _fd: i32, _clean: bool) {}

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
