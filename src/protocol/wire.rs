//! Primitive wire types: fixed-width little-endian integers, length-encoded
//! integers and byte strings, and NUL-terminated strings.
//!
//! Every read is bounds-checked against the remaining buffer and faults with
//! a protocol error carrying the requested vs. available byte counts, so a
//! malformed payload can be diagnosed without a packet capture.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Result of decoding a length-encoded integer.
///
/// `0xFB` is the SQL NULL sentinel in row-data context; it is surfaced as a
/// distinct variant rather than a value so callers must handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenEnc {
    Int(u64),
    Null,
}

impl LenEnc {
    /// Unwrap an integer, faulting on the NULL sentinel.
    pub fn int(self) -> Result<u64> {
        match self {
            LenEnc::Int(v) => Ok(v),
            LenEnc::Null => Err(Error::Protocol(
                "unexpected NULL sentinel in length-encoded integer".into(),
            )),
        }
    }
}

/// Cursor-style reader over a payload.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn out_of_range(&self, wanted: usize) -> Error {
        Error::Protocol(format!(
            "out-of-range read: wanted {} bytes, {} remaining",
            wanted,
            self.remaining()
        ))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(self.out_of_range(len));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    /// Consume and return everything left in the payload.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// 3-byte little-endian integer (packet lengths, mid-size lenenc values).
    pub fn read_u24_le(&mut self) -> Result<u32> {
        let b = self.read_bytes(3)?;
        Ok(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Length-encoded integer. Prefix `0xFB` yields [`LenEnc::Null`];
    /// `0xFF` is reserved (it introduces an ERR payload) and faults.
    pub fn read_lenenc(&mut self) -> Result<LenEnc> {
        let first = self.read_u8()?;
        match first {
            0..=0xFA => Ok(LenEnc::Int(u64::from(first))),
            0xFB => Ok(LenEnc::Null),
            0xFC => Ok(LenEnc::Int(u64::from(self.read_u16_le()?))),
            0xFD => Ok(LenEnc::Int(u64::from(self.read_u24_le()?))),
            0xFE => Ok(LenEnc::Int(self.read_u64_le()?)),
            0xFF => Err(Error::Protocol(
                "reserved prefix 0xFF in length-encoded integer".into(),
            )),
        }
    }

    /// Length-encoded integer that must not be the NULL sentinel.
    pub fn read_lenenc_int(&mut self) -> Result<u64> {
        self.read_lenenc()?.int()
    }

    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_lenenc_int()? as usize;
        self.read_bytes(len)
    }

    pub fn read_lenenc_str(&mut self) -> Result<&'a str> {
        let bytes = self.read_lenenc_bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in length-encoded string: {e}")))
    }

    /// NUL-terminated string; the terminator is consumed but not returned.
    pub fn read_null_terminated(&mut self) -> Result<&'a str> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("unterminated string in payload".into()))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in string: {e}")))?;
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Append-only payload writer over a `BytesMut`.
///
/// Each write reserves at most once, so growth stays amortized.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_u24_le(&mut self, v: u32) {
        debug_assert!(v <= 0xFF_FF_FF);
        self.buf.reserve(3);
        self.buf.put_u8((v & 0xFF) as u8);
        self.buf.put_u8(((v >> 8) & 0xFF) as u8);
        self.buf.put_u8(((v >> 16) & 0xFF) as u8);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_null_terminated(&mut self, s: &str) {
        self.buf.reserve(s.len() + 1);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    pub fn write_lenenc_int(&mut self, v: u64) {
        if v < 0xFB {
            self.buf.put_u8(v as u8);
        } else if v < 65_536 {
            self.buf.reserve(3);
            self.buf.put_u8(0xFC);
            self.buf.put_u16_le(v as u16);
        } else if v < 16_777_216 {
            self.buf.reserve(4);
            self.buf.put_u8(0xFD);
            self.write_u24_le(v as u32);
        } else {
            self.buf.reserve(9);
            self.buf.put_u8(0xFE);
            self.buf.put_u64_le(v);
        }
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    pub fn write_lenenc_str(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
