//! Load context: bump allocation and cross-pass bookkeeping.
//!
//! One context exists per decode pass. The dry context collects repeated
//! field counts and dynamic submessage offsets while it measures the
//! arena. Its [`LoadTables`] are then handed to the real context so the
//! second decode lays data out identically.

use rustc_hash::FxHashMap;

use super::memory::ArenaMemory;
use crate::error::{DdfError, Result};
use crate::schema::{
    align_up, Descriptor, FieldDescriptor, Registry, ARENA_ALIGNMENT, REPEATED_COUNT_OFFSET,
};

/// How pointer slots are stored in a decoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Addressing {
    /// Slots hold machine addresses; zero is null.
    #[default]
    Absolute,
    /// Slots hold offsets from the start of the arena. Any value smaller
    /// than the root struct size is null.
    Relative,
}

impl Addressing {
    /// Value stored in a slot pointing at `target`.
    #[inline]
    pub fn encode(self, target: Option<usize>, base_address: usize) -> usize {
        match (self, target) {
            (_, None) => 0,
            (Addressing::Absolute, Some(offset)) => base_address + offset,
            (Addressing::Relative, Some(offset)) => offset,
        }
    }

    /// Arena offset a slot value points at, `None` for null.
    ///
    /// Fails when the value points outside an arena of `len` bytes.
    pub fn locate(
        self,
        raw: usize,
        base_address: usize,
        root_size: usize,
        len: usize,
    ) -> Result<Option<usize>> {
        let offset = match self {
            Addressing::Absolute if raw == 0 => return Ok(None),
            Addressing::Absolute => raw.checked_sub(base_address),
            Addressing::Relative if raw < root_size => return Ok(None),
            Addressing::Relative => Some(raw),
        };
        match offset {
            Some(offset) if offset <= len => Ok(Some(offset)),
            _ => Err(DdfError::Internal(format!(
                "Pointer {:#x} outside arena of {} bytes",
                raw, len
            ))),
        }
    }
}

/// State shared between the dry and the real decode pass.
///
/// Message instances are identified by a key: the wire position where
/// their first occurrence starts. Later occurrences of the same
/// non-repeated submessage map to the key of the first one, so their
/// fields merge into a single instance.
#[derive(Debug, Clone, Default)]
pub struct LoadTables {
    /// Element counts keyed by (instance key, field number).
    array_counts: FxHashMap<(usize, u32), u32>,
    /// Keys of non-repeated submessages by (parent key, field number).
    struct_keys: FxHashMap<(usize, u32), usize>,
    /// Dynamic submessage offsets relative to the dynamic region.
    dynamic_offsets: Vec<usize>,
    /// Next entry of `dynamic_offsets` to hand out.
    dynamic_cursor: usize,
}

/// Allocation and bookkeeping for one decode pass.
pub struct LoadContext<'r, M: ArenaMemory> {
    registry: &'r Registry,
    memory: M,
    addressing: Addressing,
    /// Bump cursor.
    current: usize,
    /// Start of the dynamic submessage region.
    dynamic_base: usize,
    tables: LoadTables,
}

impl<'r, M: ArenaMemory> LoadContext<'r, M> {
    /// Create a context with empty tables.
    pub fn new(registry: &'r Registry, memory: M, addressing: Addressing) -> Self {
        Self::with_tables(registry, memory, addressing, LoadTables::default())
    }

    /// Create a context reusing tables collected by an earlier pass.
    pub fn with_tables(
        registry: &'r Registry,
        memory: M,
        addressing: Addressing,
        tables: LoadTables,
    ) -> Self {
        Self {
            registry,
            memory,
            addressing,
            current: 0,
            dynamic_base: 0,
            tables,
        }
    }

    /// Give up the context, keeping its tables.
    pub fn into_tables(self) -> LoadTables {
        self.tables
    }

    #[inline]
    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    #[inline]
    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    /// Check if writes are discarded.
    #[inline]
    pub fn is_dry(&self) -> bool {
        self.memory.is_dry()
    }

    /// Bytes carved out so far.
    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.current
    }

    fn reserve(&mut self, align: usize, size: usize) -> Result<usize> {
        let offset = align_up(self.current, align);
        let end = offset
            .checked_add(size)
            .ok_or_else(|| DdfError::Internal("Arena size overflow".to_string()))?;
        if let Some(capacity) = self.memory.capacity() {
            if end > capacity {
                return Err(DdfError::Internal(format!(
                    "Arena exhausted: need {} bytes, have {}",
                    end, capacity
                )));
            }
        }
        self.current = end;
        Ok(offset)
    }

    /// Carve out one struct of the given type.
    pub fn alloc_message(&mut self, desc: &Descriptor) -> Result<usize> {
        self.reserve(ARENA_ALIGNMENT, desc.size)
    }

    /// Carve out the element array of a repeated field.
    pub fn alloc_repeated(&mut self, field: &FieldDescriptor, count: u32) -> Result<usize> {
        let stride = self.registry.element_stride(field)?;
        let size = stride
            .checked_mul(count as usize)
            .ok_or_else(|| DdfError::Internal("Array size overflow".to_string()))?;
        self.reserve(ARENA_ALIGNMENT, size)
    }

    /// Carve out `len` unaligned bytes for string data, including the NUL.
    pub fn alloc_string(&mut self, len: usize) -> Result<usize> {
        self.reserve(1, len)
    }

    /// Carve out `len` bytes of 16-byte aligned blob data.
    pub fn alloc_bytes(&mut self, len: usize) -> Result<usize> {
        self.reserve(ARENA_ALIGNMENT, len)
    }

    /// Carve out the region dynamic submessages are placed in.
    pub fn alloc_dynamic_region(&mut self, size: usize) -> Result<usize> {
        let offset = self.reserve(ARENA_ALIGNMENT, size)?;
        self.dynamic_base = offset;
        Ok(offset)
    }

    /// Value a slot pointing at `target` must hold.
    #[inline]
    pub fn pointer_value(&self, target: Option<usize>) -> usize {
        self.addressing.encode(target, self.memory.base_address())
    }

    /// Store a pointer to `target` in the slot at `slot`.
    pub fn put_pointer(&mut self, slot: usize, target: Option<usize>) -> Result<()> {
        let value = self.pointer_value(target);
        self.memory.write(slot, &value.to_ne_bytes())
    }

    /// Store a RepeatedField header in the slot at `slot`.
    pub fn put_repeated_header(
        &mut self,
        slot: usize,
        data: Option<usize>,
        count: u32,
    ) -> Result<()> {
        self.put_pointer(slot, data)?;
        self.memory
            .write(slot + REPEATED_COUNT_OFFSET, &count.to_ne_bytes())
    }

    /// Copy raw bytes into the arena.
    #[inline]
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.memory.write(offset, bytes)
    }

    /// Count one more element of a repeated field.
    pub fn increase_array_count(&mut self, key: usize, field_number: u32) {
        self.add_array_count(key, field_number, 1);
    }

    /// Count `n` more elements of a repeated field.
    pub fn add_array_count(&mut self, key: usize, field_number: u32, n: u32) {
        let count = self
            .tables
            .array_counts
            .entry((key, field_number))
            .or_insert(0);
        *count = count.saturating_add(n);
    }

    /// Elements counted for a repeated field of the instance `key`.
    pub fn array_count(&self, key: usize, field_number: u32) -> u32 {
        self.tables
            .array_counts
            .get(&(key, field_number))
            .copied()
            .unwrap_or(0)
    }

    /// Key of the non-repeated submessage `field_number` of instance
    /// `parent`, registering `position` when it occurs for the first time.
    pub fn struct_key(&mut self, parent: usize, field_number: u32, position: usize) -> usize {
        *self
            .tables
            .struct_keys
            .entry((parent, field_number))
            .or_insert(position)
    }

    /// Queue the offset of a dynamic submessage within the dynamic region.
    pub fn add_dynamic_type_offset(&mut self, offset: usize) {
        self.tables.dynamic_offsets.push(offset);
    }

    /// Arena offset of the next dynamic submessage, in queue order.
    pub fn next_dynamic_type_offset(&mut self) -> Result<usize> {
        let relative = self
            .tables
            .dynamic_offsets
            .get(self.tables.dynamic_cursor)
            .copied()
            .ok_or_else(|| {
                DdfError::Internal("Dynamic submessage queue exhausted".to_string())
            })?;
        self.tables.dynamic_cursor += 1;
        Ok(self.dynamic_base + relative)
    }

    /// Rewind the dynamic submessage queue for another pass.
    pub fn reset_dynamic_type_offsets(&mut self) {
        self.tables.dynamic_cursor = 0;
    }

    /// Number of queued dynamic submessages.
    #[inline]
    pub fn dynamic_type_count(&self) -> usize {
        self.tables.dynamic_offsets.len()
    }
}
