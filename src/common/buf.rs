use super::{Opaque, XID_LEN};

/// Bytes of a received call with a read cursor.
///
/// The cursor only moves forward. Everything before it has been consumed by
/// the transport (the XID), everything after it belongs to the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgBuf {
    bytes: Opaque,
    cursor: usize,
}

impl ArgBuf {
    pub fn new(bytes: Opaque) -> Self {
        Self { bytes, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Unconsumed length.
    pub fn len(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.cursor..]
    }

    /// Take one big-endian XDR word.
    pub fn get_u32(&mut self) -> Option<u32> {
        let word = self.remaining().get(..XID_LEN)?;
        let word = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        self.cursor += XID_LEN;
        Some(word)
    }

    pub fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.bytes.len());
    }
}

impl AsRef<[u8]> for ArgBuf {
    fn as_ref(&self) -> &[u8] {
        self.remaining()
    }
}

/// Reply bytes, appended to by the dispatcher after the transport has put
/// the XID in front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResBuf {
    bytes: Opaque,
}

impl ResBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_be_bytes());
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_inner(self) -> Opaque {
        self.bytes
    }
}

impl AsRef<[u8]> for ResBuf {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}
