//! Output stream and save sinks.
//!
//! The encoder writes through a [`SaveSink`]. Submessage lengths are
//! measured by encoding into a [`CountingSink`] first, so the encoder
//! never needs to seek back.
//!
//! # Example
//!
//! ```
//! use ddf::wire::{OutputStream, WireType};
//!
//! let mut buf = Vec::new();
//! let mut out = OutputStream::new(&mut buf);
//! out.write_tag(1, WireType::Varint).unwrap();
//! out.write_varint32(150).unwrap();
//!
//! assert_eq!(buf, [0x08, 0x96, 0x01]);
//! ```

use std::io::Write;

use bytes::BytesMut;

use super::wire_type::{encode_tag, WireType, MAX_VARINT_LEN};
use crate::error::Result;

/// Destination for encoded bytes.
pub trait SaveSink {
    /// Append bytes to the destination.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
}

impl SaveSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl SaveSink for BytesMut {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Sink that discards bytes and only counts them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountingSink {
    count: usize,
}

impl CountingSink {
    /// Create a new counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }
}

impl SaveSink for CountingSink {
    #[inline]
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.count += bytes.len();
        Ok(())
    }
}

/// Sink adapter for any [`std::io::Write`].
///
/// Write failures surface as [`crate::DdfError::Io`].
pub struct WriterSink<W: Write> {
    inner: W,
}

impl<W: Write> WriterSink<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> SaveSink for WriterSink<W> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }
}

/// Encoder for wire primitives.
pub struct OutputStream<'s, S: SaveSink + ?Sized> {
    sink: &'s mut S,
    written: usize,
}

impl<'s, S: SaveSink + ?Sized> OutputStream<'s, S> {
    /// Create a stream writing into `sink`.
    pub fn new(sink: &'s mut S) -> Self {
        Self { sink, written: 0 }
    }

    /// Bytes written through this stream.
    #[inline]
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Write raw bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write(bytes)?;
        self.written += bytes.len();
        Ok(())
    }

    /// Write a varint.
    pub fn write_varint64(&mut self, mut value: u64) -> Result<()> {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let mut len = 0;
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                buf[len] = byte;
                len += 1;
                break;
            }
            buf[len] = byte | 0x80;
            len += 1;
        }
        self.write(&buf[..len])
    }

    /// Write a 32-bit varint.
    #[inline]
    pub fn write_varint32(&mut self, value: u32) -> Result<()> {
        self.write_varint64(u64::from(value))
    }

    /// Write four little-endian bytes.
    pub fn write_fixed32(&mut self, value: u32) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    /// Write eight little-endian bytes.
    pub fn write_fixed64(&mut self, value: u64) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    /// Write a field key.
    pub fn write_tag(&mut self, field_number: u32, wire_type: WireType) -> Result<()> {
        self.write_varint32(encode_tag(field_number, wire_type))
    }

    /// Write a length-prefixed string.
    ///
    /// `None` (a null string) is written as a zero length.
    pub fn write_string(&mut self, value: Option<&[u8]>) -> Result<()> {
        match value {
            Some(bytes) => {
                self.write_varint32(bytes.len() as u32)?;
                self.write(bytes)
            }
            None => self.write_varint32(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_varint() {
        let mut buf = Vec::new();
        let mut out = OutputStream::new(&mut buf);

        out.write_varint32(0).unwrap();
        out.write_varint32(300).unwrap();
        out.write_varint64(u64::MAX).unwrap();

        assert_eq!(out.bytes_written(), 1 + 2 + 10);
        assert_eq!(&buf[..3], &[0x00, 0xAC, 0x02]);
        assert_eq!(buf[12], 0x01);
    }

    #[test]
    fn test_write_negative_int32() {
        let mut buf = Vec::new();
        let mut out = OutputStream::new(&mut buf);

        out.write_varint64(-1i32 as i64 as u64).unwrap();

        assert_eq!(buf.len(), 10);
        assert!(buf[..9].iter().all(|&b| b == 0xFF));
        assert_eq!(buf[9], 0x01);
    }

    #[test]
    fn test_write_string() {
        let mut buf = Vec::new();
        let mut out = OutputStream::new(&mut buf);

        out.write_string(Some(b"hi")).unwrap();
        out.write_string(None).unwrap();

        assert_eq!(buf, [0x02, b'h', b'i', 0x00]);
    }

    #[test]
    fn test_counting_sink() {
        let mut counter = CountingSink::new();
        let mut out = OutputStream::new(&mut counter);

        out.write_tag(1, WireType::Fixed64).unwrap();
        out.write_fixed64(7).unwrap();

        assert_eq!(counter.count(), 9);
    }

    #[test]
    fn test_bytes_mut_sink() {
        let mut buf = BytesMut::new();
        let mut out = OutputStream::new(&mut buf);

        out.write_fixed32(0x0403_0201).unwrap();

        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_writer_sink_error() {
        struct Broken;

        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut sink = WriterSink::new(Broken);
        let mut out = OutputStream::new(&mut sink);

        let result = out.write_varint32(1);
        assert!(matches!(result, Err(crate::DdfError::Io(_))));
    }
}
