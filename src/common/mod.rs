pub mod buf;
pub mod config;

pub use buf::{ArgBuf, ResBuf};
pub use config::Config;

use std::{
    fmt::{self, Display, Formatter},
    io,
};

pub type Xid = u32;
pub type Program = u32;
pub type Opaque = Vec<u8>;

/// Length of the transaction id that leads every call and every reply.
pub const XID_LEN: usize = 4;
/// Length of the record marker in front of every RPC-over-TCP record.
pub const MARKER_LEN: usize = 4;
/// Marker bit for the last fragment of a record. The remaining 31 bits carry
/// the fragment length.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;
/// Largest body length a record marker can express.
pub const MAX_FRAGMENT: usize = !LAST_FRAGMENT as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Big-endian record marker for a single, final fragment of `length` bytes.
pub fn record_marker(length: usize) -> [u8; MARKER_LEN] {
    debug_assert!(length <= MAX_FRAGMENT);
    (LAST_FRAGMENT | length as u32).to_be_bytes()
}

/// Body length announced by `marker`.
///
/// Records are always sent as one fragment by the clients we care about, so
/// a marker without the last-fragment bit is refused instead of reassembled.
pub fn parse_record_marker(marker: [u8; MARKER_LEN]) -> io::Result<usize> {
    let marker = u32::from_be_bytes(marker);
    if marker & LAST_FRAGMENT == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "multi-fragment record",
        ));
    }
    Ok((marker & !LAST_FRAGMENT) as usize)
}

/// RFC 1071 checksum: complement of the folded ones' complement sum of all
/// 16-bit big-endian words, an odd trailing byte padded with zero.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u64;
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = words.remainder() {
        sum += (*last as u64) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
