/// A contiguous circular byte buffer.
///
/// `head` is the read offset into `area`, `data` the byte count; both wrap
/// modulo the area size. A zero-capacity buffer is the "not allocated yet"
/// state: muxes start with one and upgrade it when bytes actually flow.
#[derive(Default)]
pub struct Buffer {
    area: Box<[u8]>,
    head: usize,
    data: usize,
}

impl Buffer {
    pub fn with_capacity(size: usize) -> Self {
        Self { area: vec![0; size].into_boxed_slice(), head: 0, data: 0 }
    }

    /// The unallocated placeholder. Every accessor treats it as a full,
    /// empty buffer of size zero.
    pub fn null() -> Self {
        Self { area: Box::new([]), head: 0, data: 0 }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.area.len()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.area.is_empty()
    }

    #[inline]
    pub fn data(&self) -> usize {
        self.data
    }

    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn room(&self) -> usize {
        self.size() - self.data
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.data == self.size()
    }

    #[inline]
    fn wrap(&self, ofs: usize) -> usize {
        let size = self.size();
        if size == 0 { 0 } else { ofs % size }
    }

    /// Byte at offset `ofs` past the head. `ofs` must be < `data`.
    #[inline]
    pub fn peek(&self, ofs: usize) -> u8 {
        debug_assert!(ofs < self.data);
        self.area[self.wrap(self.head + ofs)]
    }

    /// Copies up to `dst.len()` bytes starting `ofs` past the head without
    /// consuming them. Returns the number of bytes copied.
    pub fn peek_at(&self, ofs: usize, dst: &mut [u8]) -> usize {
        let avail = self.data.saturating_sub(ofs);
        let n = dst.len().min(avail);
        for (i, d) in dst.iter_mut().enumerate().take(n) {
            *d = self.area[self.wrap(self.head + ofs + i)];
        }
        n
    }

    /// Appends as many bytes of `src` as fit. Returns the count taken.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.room());
        let tail = self.wrap(self.head + self.data);
        let first = n.min(self.size() - tail);
        self.area[tail..tail + first].copy_from_slice(&src[..first]);
        if n > first {
            self.area[..n - first].copy_from_slice(&src[first..n]);
        }
        self.data += n;
        n
    }

    /// All-or-nothing append; fails without side effect when `src` does not
    /// fit.
    pub fn put_full(&mut self, src: &[u8]) -> Result<(), ()> {
        if src.len() > self.room() {
            return Err(());
        }
        self.put(src);
        Ok(())
    }

    /// Consumes up to `dst.len()` bytes from the head. Returns the count.
    pub fn get(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek_at(0, dst);
        self.del(n);
        n
    }

    /// Advances the head, dropping `n` leading bytes.
    #[inline]
    pub fn del(&mut self, n: usize) {
        debug_assert!(n <= self.data);
        self.head = self.wrap(self.head + n);
        self.data -= n;
        if self.data == 0 {
            self.head = 0;
        }
    }

    /// Accounts `n` bytes written externally into the tail space (via
    /// [`space_slices`](Self::space_slices)).
    #[inline]
    pub fn add(&mut self, n: usize) {
        debug_assert!(n <= self.room());
        self.data += n;
    }

    /// Length of the readable region that is contiguous in memory.
    #[inline]
    pub fn contig_data(&self) -> usize {
        self.data.min(self.size() - self.head)
    }

    /// Length of the writable region that is contiguous in memory.
    #[inline]
    pub fn contig_space(&self) -> usize {
        let tail = self.wrap(self.head + self.data);
        if self.data >= self.size() - self.head {
            // tail wrapped: free area runs from tail to head
            self.head - tail
        } else {
            self.size() - tail
        }
    }

    /// The two readable regions, second possibly empty.
    pub fn data_slices(&self) -> (&[u8], &[u8]) {
        let first = self.contig_data();
        let a = &self.area[self.head..self.head + first];
        let b = &self.area[..self.data - first];
        (a, b)
    }

    /// The contiguous writable region at the tail. Pair with
    /// [`add`](Self::add) after an external write (eg. `recv`).
    pub fn space_slice(&mut self) -> &mut [u8] {
        let tail = self.wrap(self.head + self.data);
        let len = self.contig_space();
        &mut self.area[tail..tail + len]
    }

    /// Makes the whole content contiguous starting at offset 0, copying
    /// through `scratch` (which must be at least as large as the area).
    pub fn slow_realign(&mut self, scratch: &mut [u8]) {
        debug_assert!(scratch.len() >= self.size());
        let (a, b) = self.data_slices();
        let (la, lb) = (a.len(), b.len());
        scratch[..la].copy_from_slice(a);
        scratch[la..la + lb].copy_from_slice(b);
        self.area[..la + lb].copy_from_slice(&scratch[..la + lb]);
        self.head = 0;
    }

    /// Drops everything.
    pub fn reset(&mut self) {
        self.head = 0;
        self.data = 0;
    }

    /// Swaps storage and content with `other`; the zero-copy exchange used
    /// when a full buffer can be handed over instead of copied.
    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer{{size: {}, head: {}, data: {}}}", self.size(), self.head, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_buffer() {
        let b = Buffer::null();
        assert!(b.is_null());
        assert_eq!(b.room(), 0);
        assert!(b.is_full());
        assert!(b.is_empty());
    }

    #[test]
    fn put_get_wrap() {
        let mut b = Buffer::with_capacity(8);
        assert_eq!(b.put(b"abcdef"), 6);
        let mut out = [0u8; 4];
        assert_eq!(b.get(&mut out), 4);
        assert_eq!(&out, b"abcd");
        // head is now 4; this put wraps around the end
        assert_eq!(b.put(b"ghijkl"), 6);
        assert_eq!(b.data(), 8);
        assert!(b.is_full());
        let mut all = [0u8; 8];
        assert_eq!(b.get(&mut all), 8);
        assert_eq!(&all, b"efghijkl");
        assert_eq!(b.head(), 0);
    }

    #[test]
    fn put_full_refuses() {
        let mut b = Buffer::with_capacity(4);
        b.put(b"abc");
        assert!(b.put_full(b"de").is_err());
        assert_eq!(b.data(), 3);
        assert!(b.put_full(b"d").is_ok());
        assert!(b.is_full());
    }

    #[test]
    fn contig_and_realign() {
        let mut b = Buffer::with_capacity(8);
        b.put(b"abcdef");
        b.del(4);
        b.put(b"ghij");
        // content "efghij" with head at 4, wrapping after "efgh"
        assert_eq!(b.contig_data(), 4);
        let mut scratch = [0u8; 8];
        b.slow_realign(&mut scratch);
        assert_eq!(b.head(), 0);
        assert_eq!(b.contig_data(), 6);
        let (a, _) = b.data_slices();
        assert_eq!(a, b"efghij");
    }

    #[test]
    fn space_slice_then_add() {
        let mut b = Buffer::with_capacity(8);
        b.put(b"ab");
        b.del(2);
        b.put(b"cdefgh");
        let free = b.contig_space();
        let s = b.space_slice();
        assert_eq!(s.len(), free);
        s[0] = b'x';
        b.add(1);
        assert_eq!(b.data(), 7);
    }
}
