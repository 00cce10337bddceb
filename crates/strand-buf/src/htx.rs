use std::collections::VecDeque;

use bitflags::bitflags;

bitflags! {
    /// Message-level knowledge recorded on the start line while parsing.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SlFlags: u32 {
        /// Protocol version is 1.1 or above.
        const VER_11   = 0x0001;
        /// The message length is known (content-length or chunked).
        const XFER_LEN = 0x0002;
        /// Length comes from a Content-Length header.
        const CLEN     = 0x0004;
        /// Body is chunked.
        const CHNK     = 0x0008;
        /// No body may follow (HEAD answer, 1xx/204/304).
        const BODYLESS = 0x0010;
        /// CONNECT method; a 2xx answer switches to tunnel mode.
        const CONNECT  = 0x0020;
    }
}

/// Request or response first line, three textual parts plus parse flags.
/// Requests store method/uri/version, responses version/status/reason.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartLine {
    pub flags: SlFlags,
    parts: [Vec<u8>; 3],
}

impl StartLine {
    pub fn request(meth: &[u8], uri: &[u8], vsn: &[u8]) -> Self {
        Self { flags: SlFlags::default(), parts: [meth.to_vec(), uri.to_vec(), vsn.to_vec()] }
    }

    pub fn response(vsn: &[u8], status: &[u8], reason: &[u8]) -> Self {
        Self { flags: SlFlags::default(), parts: [vsn.to_vec(), status.to_vec(), reason.to_vec()] }
    }

    #[inline]
    pub fn meth(&self) -> &[u8] {
        &self.parts[0]
    }

    #[inline]
    pub fn uri(&self) -> &[u8] {
        &self.parts[1]
    }

    #[inline]
    pub fn req_vsn(&self) -> &[u8] {
        &self.parts[2]
    }

    #[inline]
    pub fn res_vsn(&self) -> &[u8] {
        &self.parts[0]
    }

    /// Response status code; 0 when unparsable.
    pub fn status(&self) -> u16 {
        std::str::from_utf8(&self.parts[1]).ok().and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    pub fn reason(&self) -> &[u8] {
        &self.parts[2]
    }

    fn size(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }
}

/// One typed element of an HTX message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HtxBlock {
    ReqSl(StartLine),
    ResSl(StartLine),
    Hdr { name: Vec<u8>, value: Vec<u8> },
    /// End of headers.
    Eoh,
    Data(Vec<u8>),
    Tlr { name: Vec<u8>, value: Vec<u8> },
    /// End of trailers.
    Eot,
    /// End of message.
    Eom,
}

impl HtxBlock {
    fn size(&self) -> usize {
        const BLK_OVERHEAD: usize = 8;
        BLK_OVERHEAD
            + match self {
                HtxBlock::ReqSl(sl) | HtxBlock::ResSl(sl) => sl.size(),
                HtxBlock::Hdr { name, value } | HtxBlock::Tlr { name, value } => {
                    name.len() + value.len()
                }
                HtxBlock::Data(d) => d.len(),
                HtxBlock::Eoh | HtxBlock::Eot | HtxBlock::Eom => 0,
            }
    }
}

/// The internal typed-block representation of an HTTP message.
///
/// Blocks are appended at the tail and consumed at the head; the whole
/// message can be handed across layers by swapping the owned storage, which
/// is the zero-copy exchange the muxes rely on.
#[derive(Debug, Default)]
pub struct Htx {
    blocks: VecDeque<HtxBlock>,
    used: usize,
    max_size: usize,
}

impl Htx {
    pub const DEFAULT_SIZE: usize = 16384;

    pub fn new(max_size: usize) -> Self {
        Self { blocks: VecDeque::new(), used: 0, max_size }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn used_space(&self) -> usize {
        self.used
    }

    /// Bytes of DATA payload still acceptable before the message is full.
    #[inline]
    pub fn free_data_space(&self) -> usize {
        self.max_size.saturating_sub(self.used).saturating_sub(8)
    }

    fn push(&mut self, blk: HtxBlock) -> Result<(), HtxBlock> {
        let sz = blk.size();
        if self.used + sz > self.max_size {
            return Err(blk);
        }
        self.used += sz;
        self.blocks.push_back(blk);
        Ok(())
    }

    pub fn add_stline(&mut self, blk: HtxBlock) -> Result<(), HtxBlock> {
        debug_assert!(matches!(blk, HtxBlock::ReqSl(_) | HtxBlock::ResSl(_)));
        self.push(blk)
    }

    pub fn add_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), ()> {
        self.push(HtxBlock::Hdr { name: name.to_ascii_lowercase(), value: value.to_vec() })
            .map_err(|_| ())
    }

    pub fn add_trailer(&mut self, name: &[u8], value: &[u8]) -> Result<(), ()> {
        self.push(HtxBlock::Tlr { name: name.to_ascii_lowercase(), value: value.to_vec() })
            .map_err(|_| ())
    }

    pub fn add_endof(&mut self, blk: HtxBlock) -> Result<(), ()> {
        debug_assert!(matches!(blk, HtxBlock::Eoh | HtxBlock::Eot | HtxBlock::Eom));
        self.push(blk).map_err(|_| ())
    }

    /// Appends as much of `data` as fits, merging into a trailing DATA block
    /// when possible. Returns the number of bytes consumed.
    pub fn add_data(&mut self, data: &[u8]) -> usize {
        let room = self.free_data_space();
        let n = data.len().min(room);
        if n == 0 {
            return 0;
        }
        if let Some(HtxBlock::Data(tail)) = self.blocks.back_mut() {
            tail.extend_from_slice(&data[..n]);
            self.used += n;
        } else {
            // push cannot fail: n was clamped to free_data_space
            let _ = self.push(HtxBlock::Data(data[..n].to_vec()));
        }
        n
    }

    #[inline]
    pub fn first(&self) -> Option<&HtxBlock> {
        self.blocks.front()
    }

    pub fn pop(&mut self) -> Option<HtxBlock> {
        let blk = self.blocks.pop_front()?;
        self.used -= blk.size();
        Some(blk)
    }

    /// Puts back a block at the head, eg. a partially-consumed DATA block.
    pub fn push_front(&mut self, blk: HtxBlock) {
        self.used += blk.size();
        self.blocks.push_front(blk);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HtxBlock> {
        self.blocks.iter()
    }

    /// Finds a header by (lowercase) name in the current head message.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.blocks.iter().find_map(|b| match b {
            HtxBlock::Hdr { name: n, value } if n.as_slice() == name => Some(value.as_slice()),
            _ => None,
        })
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.used = 0;
    }

    /// Zero-copy exchange with `other`.
    pub fn swap(&mut self, other: &mut Htx) {
        std::mem::swap(self, other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Htx {
        let mut htx = Htx::new(Htx::DEFAULT_SIZE);
        let mut sl = StartLine::request(b"GET", b"/", b"HTTP/1.1");
        sl.flags |= SlFlags::VER_11;
        htx.add_stline(HtxBlock::ReqSl(sl)).unwrap();
        htx.add_header(b"Host", b"x").unwrap();
        htx.add_endof(HtxBlock::Eoh).unwrap();
        htx.add_endof(HtxBlock::Eom).unwrap();
        htx
    }

    #[test]
    fn build_and_walk() {
        let mut htx = req();
        assert_eq!(htx.len(), 4);
        assert!(matches!(htx.pop(), Some(HtxBlock::ReqSl(_))));
        assert!(matches!(htx.pop(), Some(HtxBlock::Hdr { .. })));
        assert!(matches!(htx.pop(), Some(HtxBlock::Eoh)));
        assert!(matches!(htx.pop(), Some(HtxBlock::Eom)));
        assert!(htx.pop().is_none());
        assert_eq!(htx.used_space(), 0);
    }

    #[test]
    fn header_names_lowercased() {
        let htx = req();
        assert_eq!(htx.header(b"host"), Some(&b"x"[..]));
        assert_eq!(htx.header(b"Host"), None);
    }

    #[test]
    fn data_merges_and_clamps() {
        let mut htx = Htx::new(64);
        let n = htx.add_data(b"hello ");
        assert_eq!(n, 6);
        let n = htx.add_data(b"world");
        assert_eq!(n, 5);
        assert_eq!(htx.len(), 1, "contiguous data merges into one block");
        let big = vec![b'x'; 1024];
        let n = htx.add_data(&big);
        assert!(n < big.len());
        assert_eq!(htx.free_data_space(), 0);
    }

    #[test]
    fn swap_moves_everything() {
        let mut a = req();
        let mut b = Htx::new(Htx::DEFAULT_SIZE);
        a.swap(&mut b);
        assert!(a.is_empty());
        assert_eq!(b.len(), 4);
    }
}
