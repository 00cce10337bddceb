mod buffer;
mod htx;
mod ring;

pub use buffer::Buffer;
pub use htx::{Htx, HtxBlock, SlFlags, StartLine};
pub use ring::BufRing;
