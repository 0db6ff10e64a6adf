//! Big-endian integer primitives
//!
//! Reads go through a bounds-checked [`Reader`]. Writes go through the
//! [`Sink`] trait so that the same serialization routine can either count
//! bytes ([`Counter`]) or write them ([`SliceWriter`]).

use crate::error::ProtocolError;

// ============================================================================
// Reading
// ============================================================================

/// Cursor over a byte slice reading big-endian integers
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let end = self.pos.checked_add(N).ok_or(ProtocolError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(ProtocolError::Truncated)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take()?))
    }
}

/// Read a big-endian u32 at the start of `buf` without consuming it
pub fn peek_u32(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

// ============================================================================
// Writing
// ============================================================================

/// Destination for big-endian writes
pub trait Sink {
    fn put_bytes(&mut self, bytes: &[u8]);

    fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }
}

/// Sink that only counts the bytes it is given
#[derive(Debug, Default)]
pub struct Counter {
    count: usize,
}

impl Counter {
    pub fn new() -> Self {
        Counter { count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Sink for Counter {
    fn put_bytes(&mut self, bytes: &[u8]) {
        self.count += bytes.len();
    }
}

/// Sink writing into a fixed slice
///
/// Writes past the end are dropped and remembered in [`SliceWriter::overflowed`].
#[derive(Debug)]
pub struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    overflowed: bool,
}

impl<'a> SliceWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        SliceWriter {
            buf,
            pos: 0,
            overflowed: false,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }
}

impl Sink for SliceWriter<'_> {
    fn put_bytes(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        match self.buf.get_mut(self.pos..end) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                self.pos = end;
            }
            None => self.overflowed = true,
        }
    }
}
