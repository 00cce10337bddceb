use crate::Buffer;

/// A fixed circular array of buffers, flushed strictly head-to-tail.
///
/// Muxes append frames at the tail while older, already-framed bytes remain
/// readable at the head; that keeps wire order FIFO per connection without
/// one giant reallocating buffer.
pub struct BufRing {
    bufs: Vec<Buffer>,
    head: usize,
    len: usize,
}

impl BufRing {
    pub fn new(slots: usize) -> Self {
        assert!(slots >= 1);
        Self { bufs: (0..slots).map(|_| Buffer::null()).collect(), head: 0, len: 0 }
    }

    #[inline]
    pub fn slots(&self) -> usize {
        self.bufs.len()
    }

    /// Number of occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.bufs.len()
    }

    /// Total buffered bytes across all slots.
    pub fn bytes(&self) -> usize {
        (0..self.len).map(|i| self.at(i).data()).sum()
    }

    #[inline]
    fn idx(&self, i: usize) -> usize {
        (self.head + i) % self.bufs.len()
    }

    fn at(&self, i: usize) -> &Buffer {
        &self.bufs[self.idx(i)]
    }

    /// Oldest occupied buffer, the one to flush first.
    pub fn head(&mut self) -> Option<&mut Buffer> {
        if self.len == 0 {
            return None;
        }
        let i = self.head;
        Some(&mut self.bufs[i])
    }

    /// Current tail buffer for appending, if any slot is occupied.
    pub fn tail(&mut self) -> Option<&mut Buffer> {
        if self.len == 0 {
            return None;
        }
        let i = self.idx(self.len - 1);
        Some(&mut self.bufs[i])
    }

    /// Opens a fresh tail slot and returns it. Fails when the ring is full.
    pub fn push_tail(&mut self, buf: Buffer) -> Result<&mut Buffer, Buffer> {
        if self.is_full() {
            return Err(buf);
        }
        let i = self.idx(self.len);
        self.bufs[i] = buf;
        self.len += 1;
        Ok(&mut self.bufs[i])
    }

    /// Releases the head slot once fully flushed, returning its storage so
    /// the caller can recycle it.
    pub fn pop_head(&mut self) -> Option<Buffer> {
        if self.len == 0 {
            return None;
        }
        let buf = std::mem::replace(&mut self.bufs[self.head], Buffer::null());
        self.head = (self.head + 1) % self.bufs.len();
        self.len -= 1;
        if self.len == 0 {
            self.head = 0;
        }
        Some(buf)
    }

    /// Drops every slot.
    pub fn clear(&mut self) {
        while self.pop_head().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(s: &[u8]) -> Buffer {
        let mut b = Buffer::with_capacity(16);
        b.put(s);
        b
    }

    #[test]
    fn fifo_order() {
        let mut br = BufRing::new(4);
        assert!(br.is_empty());
        br.push_tail(filled(b"one")).unwrap();
        br.push_tail(filled(b"two")).unwrap();
        br.push_tail(filled(b"three")).unwrap();
        assert_eq!(br.len(), 3);
        assert_eq!(br.bytes(), 11);

        let mut out = [0u8; 16];
        let n = br.head().unwrap().get(&mut out);
        assert_eq!(&out[..n], b"one");
        br.pop_head();
        let n = br.head().unwrap().get(&mut out);
        assert_eq!(&out[..n], b"two");
    }

    #[test]
    fn full_ring_refuses() {
        let mut br = BufRing::new(2);
        br.push_tail(filled(b"a")).unwrap();
        br.push_tail(filled(b"b")).unwrap();
        assert!(br.is_full());
        assert!(br.push_tail(filled(b"c")).is_err());
        br.pop_head();
        assert!(br.push_tail(filled(b"c")).is_ok());
    }

    #[test]
    fn wraps_slots() {
        let mut br = BufRing::new(2);
        for round in 0..5 {
            br.push_tail(filled(&[round])).unwrap();
            let popped = br.pop_head().unwrap();
            assert_eq!(popped.data(), 1);
        }
        assert!(br.is_empty());
    }
}
