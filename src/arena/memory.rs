//! Arena storage.
//!
//! [`AlignedBuffer`] is the single allocation a decoded message lives in.
//! It is always 16-byte aligned, so any offset that is a multiple of 16
//! is also a 16-byte aligned address.
//!
//! Decoding runs twice over an [`ArenaMemory`]: first over [`DryRun`],
//! which only measures, then over an [`ArenaBuffer`] sized from that
//! measurement.

use crate::error::{DdfError, Result};
use crate::schema::ARENA_ALIGNMENT;

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Block([u8; ARENA_ALIGNMENT]);

/// Zero-initialised, 16-byte aligned byte buffer.
#[derive(Clone)]
pub struct AlignedBuffer {
    blocks: Vec<Block>,
    len: usize,
}

impl AlignedBuffer {
    /// Allocate `len` zero bytes.
    ///
    /// At least one block is always allocated so the buffer has a real,
    /// non-null address even when `len` is zero.
    pub fn zeroed(len: usize) -> Self {
        let count = len.div_ceil(ARENA_ALIGNMENT).max(1);
        Self {
            blocks: vec![Block([0; ARENA_ALIGNMENT]); count],
            len,
        }
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::zeroed(bytes.len());
        buffer.as_bytes_mut().copy_from_slice(bytes);
        buffer
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte.
    #[inline]
    pub fn address(&self) -> usize {
        self.blocks.as_ptr() as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: Block is repr(C) over a byte array, so the blocks form one
        // contiguous run of initialised bytes at least `len` long.
        unsafe { std::slice::from_raw_parts(self.blocks.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_bytes`, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.blocks.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .finish()
    }
}

/// Memory a decode pass writes into.
pub trait ArenaMemory {
    /// Check if writes are discarded.
    fn is_dry(&self) -> bool;

    /// Address of offset 0, used for absolute pointers.
    fn base_address(&self) -> usize;

    /// Bytes available, `None` when unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Copy `bytes` to `offset`.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;
}

/// Memory that accepts every write and stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRun;

impl ArenaMemory for DryRun {
    #[inline]
    fn is_dry(&self) -> bool {
        true
    }

    #[inline]
    fn base_address(&self) -> usize {
        0
    }

    #[inline]
    fn capacity(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn write(&mut self, _offset: usize, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Memory backed by a sized byte slice.
#[derive(Debug)]
pub struct ArenaBuffer<'b> {
    bytes: &'b mut [u8],
}

impl<'b> ArenaBuffer<'b> {
    pub fn new(bytes: &'b mut [u8]) -> Self {
        Self { bytes }
    }
}

impl ArenaMemory for ArenaBuffer<'_> {
    #[inline]
    fn is_dry(&self) -> bool {
        false
    }

    #[inline]
    fn base_address(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    #[inline]
    fn capacity(&self) -> Option<usize> {
        Some(self.bytes.len())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                DdfError::Internal(format!(
                    "Write of {} bytes at {} outside {} byte arena",
                    bytes.len(),
                    offset,
                    self.bytes.len()
                ))
            })?;
        self.bytes[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer() {
        let buffer = AlignedBuffer::zeroed(37);

        assert_eq!(buffer.len(), 37);
        assert_eq!(buffer.address() % ARENA_ALIGNMENT, 0);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_buffer_has_address() {
        let buffer = AlignedBuffer::zeroed(0);

        assert!(buffer.is_empty());
        assert_ne!(buffer.address(), 0);
        assert_eq!(buffer.address() % ARENA_ALIGNMENT, 0);
    }

    #[test]
    fn test_from_bytes() {
        let buffer = AlignedBuffer::from_bytes(&[1, 2, 3]);
        assert_eq!(buffer.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_arena_buffer_bounds() {
        let mut storage = [0u8; 8];
        let mut arena = ArenaBuffer::new(&mut storage);

        arena.write(4, &[9, 9, 9, 9]).unwrap();
        assert!(arena.write(6, &[1, 1, 1]).is_err());
        assert_eq!(arena.capacity(), Some(8));
        assert!(!arena.is_dry());

        assert_eq!(storage, [0, 0, 0, 0, 9, 9, 9, 9]);
    }

    #[test]
    fn test_dry_run_discards() {
        let mut dry = DryRun;
        dry.write(1_000_000, &[1, 2, 3]).unwrap();
        assert!(dry.is_dry());
        assert_eq!(dry.capacity(), None);
    }
}
