//! Bounds-checked read cursor over wire bytes.
//!
//! Every read fails with [`DdfError::WireFormat`] instead of running past
//! the end of the buffer. Sub-buffers keep track of their absolute
//! position inside the outermost input so that positions recorded in one
//! pass can be matched up in the next.
//!
//! # Example
//!
//! ```
//! use ddf::wire::InputBuffer;
//!
//! let data = [0x96, 0x01, 0x03, b'a', b'b', b'c'];
//! let mut input = InputBuffer::new(&data);
//!
//! assert_eq!(input.read_varint32().unwrap(), 150);
//! let len = input.read_varint32().unwrap() as usize;
//! assert_eq!(input.read(len).unwrap(), b"abc");
//! assert!(input.eof());
//! ```

use super::wire_type::{WireType, MAX_VARINT_LEN};
use crate::error::{DdfError, Result};

/// Read cursor over a span of wire bytes.
#[derive(Debug, Clone)]
pub struct InputBuffer<'a> {
    /// Bytes of this span.
    data: &'a [u8],
    /// Cursor relative to `data`.
    pos: usize,
    /// Absolute position of `data[0]` in the outermost input.
    origin: usize,
}

impl<'a> InputBuffer<'a> {
    /// Create a cursor over the whole input.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            origin: 0,
        }
    }

    /// Check if the cursor reached the end of the span.
    #[inline]
    pub fn eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Current position relative to the start of this span.
    #[inline]
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Current position relative to the outermost input.
    #[inline]
    pub fn absolute_position(&self) -> usize {
        self.origin + self.pos
    }

    /// Bytes left in this span.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Move the cursor to a position within this span.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(DdfError::WireFormat(format!(
                "Seek to {} beyond end of {} byte buffer",
                pos,
                self.data.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    /// Read `len` bytes.
    pub fn read(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(DdfError::WireFormat(format!(
                "Need {} bytes at position {}, only {} left",
                len,
                self.absolute_position(),
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read(len).map(|_| ())
    }

    /// Split off the next `len` bytes as their own cursor.
    ///
    /// The parent cursor moves past the span. Reads on the returned cursor
    /// stop at its end, so a submessage decoded from it either consumes the
    /// whole span or fails.
    pub fn sub_buffer(&mut self, len: usize) -> Result<InputBuffer<'a>> {
        let origin = self.absolute_position();
        let data = self.read(len)?;
        Ok(InputBuffer {
            data,
            pos: 0,
            origin,
        })
    }

    /// Read a base-128 varint of up to ten bytes.
    pub fn read_varint64(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let Some(&byte) = self.data.get(self.pos) else {
                return Err(DdfError::WireFormat(format!(
                    "Truncated varint at position {}",
                    self.absolute_position()
                )));
            };
            self.pos += 1;
            result |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DdfError::WireFormat(format!(
            "Varint longer than {} bytes",
            MAX_VARINT_LEN
        )))
    }

    /// Read a varint and keep its low 32 bits.
    ///
    /// Negative int32 values are sign-extended to ten bytes on the wire,
    /// so truncation is the correct narrowing.
    pub fn read_varint32(&mut self) -> Result<u32> {
        self.read_varint64().map(|v| v as u32)
    }

    /// Read four little-endian bytes.
    pub fn read_fixed32(&mut self) -> Result<u32> {
        let bytes = self.read(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read eight little-endian bytes.
    pub fn read_fixed64(&mut self) -> Result<u64> {
        let bytes = self.read(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a varint length prefix and return that many bytes.
    pub fn read_length_delimited(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint32()? as usize;
        self.read(len)
    }

    /// Skip one field payload of the given wire type.
    pub fn skip_field(&mut self, wire_type: WireType) -> Result<()> {
        match wire_type {
            WireType::Varint => self.read_varint64().map(|_| ()),
            WireType::Fixed64 => self.skip(8),
            WireType::LengthDelimited => self.read_length_delimited().map(|_| ()),
            WireType::Fixed32 => self.skip(4),
            WireType::StartGroup | WireType::EndGroup => Err(DdfError::WireFormat(
                "Group wire type is not supported".to_string(),
            )),
        }
    }
}
