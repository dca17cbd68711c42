//! Bounds-checked cursors for fixed-layout records.
//!
//! All multi-byte integers are big-endian. Fixed-width string fields are UTF-8,
//! padded with NUL bytes to their declared width.

use uuid::Uuid;

use crate::error::Result;
use crate::error::WireError;

/// A read cursor over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    slice: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.slice.len().saturating_sub(self.pos)
    }

    #[inline]
    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.slice.len() {
            Err(WireError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let slice = &self.slice[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    pub fn uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.array()?))
    }

    /// Reads a NUL-padded string occupying exactly `width` bytes.
    pub fn fixed_str(&mut self, field: &'static str, width: usize) -> Result<&'a str> {
        let raw = self.bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        std::str::from_utf8(&raw[..end]).map_err(|_| WireError::InvalidUtf8(field))
    }

    /// Reads a `u32` length followed by that many bytes.
    pub fn blob(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    /// Reads a `u32` length followed by that many bytes of UTF-8.
    pub fn str(&mut self, field: &'static str) -> Result<&'a str> {
        let raw = self.blob()?;
        std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8(field))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.slice[self.pos.min(self.slice.len())..];
        self.pos = self.slice.len();
        rest
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// An append-only write cursor.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.u64(v.to_bits());
    }

    pub fn uuid(&mut self, v: &Uuid) {
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Writes `v` NUL-padded to exactly `width` bytes.
    ///
    /// # Errors
    /// `FieldTooLong` if `v` does not fit.
    pub fn fixed_str(&mut self, field: &'static str, v: &str, width: usize) -> Result<()> {
        let len = v.len();
        if len > width {
            return Err(WireError::FieldTooLong { field, len, max: width });
        }
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.resize(self.buf.len() + (width - len), 0);
        Ok(())
    }

    /// Writes a `u32` length followed by the bytes.
    pub fn blob(&mut self, field: &'static str, v: &[u8]) -> Result<()> {
        let len = u32::try_from(v.len()).map_err(|_| WireError::FieldTooLong {
            field,
            len: v.len(),
            max: u32::MAX as usize,
        })?;
        self.u32(len);
        self.buf.extend_from_slice(v);
        Ok(())
    }

    pub fn str(&mut self, field: &'static str, v: &str) -> Result<()> {
        self.blob(field, v.as_bytes())
    }
}
