//! Field decoding into the arena.
//!
//! The same routine runs for the dry pass, which only advances the bump
//! cursor, and for the real pass, which writes values. Allocations happen
//! in the same order both times so the dry pass measures exactly what the
//! real pass uses.
//!
//! A non-repeated submessage that occurs more than once merges into one
//! instance: singular fields keep the last value and repeated fields
//! append. Repeated headers, required checks and defaults therefore wait
//! until every occurrence has been decoded.

use rustc_hash::FxHashMap;

use super::measure::check_depth;
use super::ROOT_KEY;
use crate::arena::{ArenaMemory, LoadContext};
use crate::error::{DdfError, Result};
use crate::schema::{Descriptor, FieldDescriptor, Type};
use crate::wire::{InputBuffer, Tag, WireType};

/// Element array of one repeated field while its message is decoded.
#[derive(Debug, Clone, Copy)]
struct ArrayState {
    data: usize,
    count: u32,
    capacity: u32,
    stride: usize,
}

impl ArrayState {
    fn next_slot(&mut self, field: &FieldDescriptor) -> Result<usize> {
        if self.count >= self.capacity {
            return Err(DdfError::Internal(format!(
                "Repeated field '{}' has more elements than counted ({})",
                field.name, self.capacity
            )));
        }
        let slot = self.data + self.count as usize * self.stride;
        self.count += 1;
        Ok(slot)
    }
}

/// Decode state of one message instance, kept across its occurrences.
#[derive(Debug)]
struct Instance {
    base: usize,
    seen: Vec<bool>,
    arrays: Vec<Option<ArrayState>>,
    /// Keys of non-repeated submessage children, per field.
    children: Vec<Option<usize>>,
}

impl Instance {
    fn new(desc: &Descriptor, base: usize) -> Self {
        let count = desc.fields.len();
        Self {
            base,
            seen: vec![false; count],
            arrays: vec![None; count],
            children: vec![None; count],
        }
    }
}

/// One decode pass over the input.
pub(super) struct Decoder<'c, 'r, M: ArenaMemory> {
    ctx: &'c mut LoadContext<'r, M>,
    max_depth: usize,
    /// Instances still open for more occurrences, by key.
    instances: FxHashMap<usize, Instance>,
}

impl<'c, 'r, M: ArenaMemory> Decoder<'c, 'r, M> {
    pub(super) fn new(ctx: &'c mut LoadContext<'r, M>, max_depth: usize) -> Self {
        Self {
            ctx,
            max_depth,
            instances: FxHashMap::default(),
        }
    }

    /// Decode a whole message into the struct at `base`.
    pub(super) fn decode_root(
        &mut self,
        input: &mut InputBuffer<'_>,
        desc: &Descriptor,
        base: usize,
    ) -> Result<()> {
        self.decode_message(input, desc, base, ROOT_KEY, 0)?;
        self.finish(desc, ROOT_KEY)
    }

    /// Decode one occurrence of the instance `key` into the struct at
    /// `base`. Unknown fields are skipped.
    fn decode_message(
        &mut self,
        input: &mut InputBuffer<'_>,
        desc: &Descriptor,
        base: usize,
        key: usize,
        depth: usize,
    ) -> Result<()> {
        check_depth(depth, self.max_depth)?;
        let mut instance = self
            .instances
            .remove(&key)
            .unwrap_or_else(|| Instance::new(desc, base));
        self.decode_fields(input, desc, key, &mut instance, depth)?;
        self.instances.insert(key, instance);
        Ok(())
    }

    fn decode_fields(
        &mut self,
        input: &mut InputBuffer<'_>,
        desc: &Descriptor,
        key: usize,
        instance: &mut Instance,
        depth: usize,
    ) -> Result<()> {
        let registry = self.ctx.registry();
        let base = instance.base;

        while !input.eof() {
            let tag = Tag::decode(input.read_varint32()?)?;
            let Some(index) = desc.find_field_index(tag.field_number) else {
                tracing::trace!(
                    "Skipping unknown field {} in '{}'",
                    tag.field_number,
                    desc.name
                );
                input.skip_field(tag.wire_type)?;
                continue;
            };

            let field = &desc.fields[index];
            let expected = match field.ty.wire_type() {
                Some(wire_type) if !field.ty.is_reserved() => wire_type,
                _ => {
                    tracing::warn!(
                        "Field '{}' of '{}' has unsupported type {}",
                        field.name,
                        desc.name,
                        field.ty.name()
                    );
                    return Err(DdfError::Internal(format!(
                        "Cannot load field '{}' of unsupported type {}",
                        field.name,
                        field.ty.name()
                    )));
                }
            };

            let packed = field.is_repeated()
                && field.ty.is_scalar()
                && tag.wire_type == WireType::LengthDelimited;
            if !packed && tag.wire_type != expected {
                return Err(DdfError::WireFormat(format!(
                    "Field '{}' of '{}' expects wire type {:?}, got {:?}",
                    field.name, desc.name, expected, tag.wire_type
                )));
            }

            if !field.is_repeated() {
                if field.is_oneof_member() {
                    self.select_oneof(desc, instance, index)?;
                }
                instance.seen[index] = true;
                let slot = base + field.offset;

                if field.ty != Type::Message {
                    self.decode_value(input, field, slot)?;
                    continue;
                }
                let nested = registry.nested(field)?;
                let len = input.read_varint32()? as usize;
                let mut sub = input.sub_buffer(len)?;
                let child = self
                    .ctx
                    .struct_key(key, field.number, sub.absolute_position());
                let target = self.singular_target(field, slot, child)?;
                instance.children[index] = Some(child);
                self.decode_message(&mut sub, nested, target, child, depth + 1)?;
                continue;
            }

            let mut state = match instance.arrays[index] {
                Some(state) => state,
                None => {
                    let capacity = self.ctx.array_count(key, field.number);
                    ArrayState {
                        data: self.ctx.alloc_repeated(field, capacity)?,
                        count: 0,
                        capacity,
                        stride: registry.element_stride(field)?,
                    }
                }
            };

            if packed {
                let len = input.read_varint32()? as usize;
                let mut run = input.sub_buffer(len)?;
                while !run.eof() {
                    let slot = state.next_slot(field)?;
                    self.decode_value(&mut run, field, slot)?;
                }
            } else if field.ty == Type::Message {
                // Each element is its own instance, complete after one span
                let slot = state.next_slot(field)?;
                let nested = registry.nested(field)?;
                let len = input.read_varint32()? as usize;
                let mut sub = input.sub_buffer(len)?;
                let element = sub.absolute_position();
                self.decode_message(&mut sub, nested, slot, element, depth + 1)?;
                self.finish(nested, element)?;
            } else {
                let slot = state.next_slot(field)?;
                self.decode_value(input, field, slot)?;
            }
            instance.arrays[index] = Some(state);
        }
        Ok(())
    }

    /// Struct offset for one occurrence of a non-repeated submessage.
    fn singular_target(
        &mut self,
        field: &FieldDescriptor,
        slot: usize,
        child: usize,
    ) -> Result<usize> {
        if !field.is_dynamic() {
            return Ok(slot);
        }
        // Every occurrence takes its queued offset to stay in step with the
        // measuring pass, even when it merges into an earlier one
        let fresh = self.ctx.next_dynamic_type_offset()?;
        if let Some(existing) = self.instances.get(&child) {
            return Ok(existing.base);
        }
        self.ctx.put_pointer(slot, Some(fresh))?;
        Ok(fresh)
    }

    /// Make field `index` the set member of its oneof.
    ///
    /// Switching members clears the union slot and drops the previous
    /// member's decode state.
    fn select_oneof(
        &mut self,
        desc: &Descriptor,
        instance: &mut Instance,
        index: usize,
    ) -> Result<()> {
        let field = &desc.fields[index];
        let oneof = desc.oneof_of(field).ok_or_else(|| {
            DdfError::Internal(format!("Field '{}' has no oneof group", field.name))
        })?;

        let previous = (0..desc.fields.len()).find(|&i| {
            i != index && desc.fields[i].oneof_index == field.oneof_index && instance.seen[i]
        });
        if let Some(previous) = previous {
            tracing::trace!(
                "Oneof '{}' of '{}' switches from '{}' to '{}'",
                oneof.name,
                desc.name,
                desc.fields[previous].name,
                field.name
            );
            instance.seen[previous] = false;
            if let Some(child) = instance.children[previous].take() {
                self.discard(child);
            }
            self.ctx
                .write(instance.base + oneof.offset, &vec![0u8; oneof.size])?;
        }
        self.ctx
            .write(instance.base + oneof.case_offset, &field.number.to_ne_bytes())
    }

    /// Forget the instance `key` and its submessages.
    fn discard(&mut self, key: usize) {
        if let Some(instance) = self.instances.remove(&key) {
            for child in instance.children.into_iter().flatten() {
                self.discard(child);
            }
        }
    }

    /// Close the instance `key` and its non-repeated submessages: write
    /// repeated headers, check required fields and apply defaults to
    /// optional fields that never appeared.
    fn finish(&mut self, desc: &Descriptor, key: usize) -> Result<()> {
        let instance = self.instances.remove(&key).ok_or_else(|| {
            DdfError::Internal(format!("No decode state for '{}' at {}", desc.name, key))
        })?;
        let registry = self.ctx.registry();

        for (index, field) in desc.fields.iter().enumerate() {
            if let Some(state) = instance.arrays[index] {
                self.ctx.put_repeated_header(
                    instance.base + field.offset,
                    Some(state.data),
                    state.count,
                )?;
            }
            if let Some(child) = instance.children[index] {
                self.finish(registry.nested(field)?, child)?;
            }
        }

        apply_defaults(&mut *self.ctx, desc, instance.base, &instance.seen)
    }

    /// Decode one scalar, string or bytes value into the slot at `slot`.
    fn decode_value(
        &mut self,
        input: &mut InputBuffer<'_>,
        field: &FieldDescriptor,
        slot: usize,
    ) -> Result<()> {
        let ctx = &mut *self.ctx;
        match field.ty {
            Type::Bool => {
                let v = input.read_varint64()?;
                ctx.write(slot, &[u8::from(v != 0)])
            }
            // int32 and enum share the bit pattern of the truncated varint
            Type::Int32 | Type::Enum | Type::Uint32 => {
                let v = input.read_varint32()?;
                ctx.write(slot, &v.to_ne_bytes())
            }
            Type::Int64 | Type::Uint64 => {
                let v = input.read_varint64()?;
                ctx.write(slot, &v.to_ne_bytes())
            }
            Type::Float | Type::Fixed32 => {
                let v = input.read_fixed32()?;
                ctx.write(slot, &v.to_ne_bytes())
            }
            Type::Double | Type::Fixed64 => {
                let v = input.read_fixed64()?;
                ctx.write(slot, &v.to_ne_bytes())
            }
            // Stored as is; UTF-8 is checked when read as text
            Type::String => {
                let bytes = input.read_length_delimited()?;
                let offset = ctx.alloc_string(bytes.len() + 1)?;
                ctx.write(offset, bytes)?;
                ctx.write(offset + bytes.len(), &[0])?;
                ctx.put_pointer(slot, Some(offset))
            }
            Type::Bytes => {
                let bytes = input.read_length_delimited()?;
                let offset = ctx.alloc_bytes(bytes.len())?;
                ctx.write(offset, bytes)?;
                ctx.put_repeated_header(slot, Some(offset), bytes.len() as u32)
            }
            Type::Message => Err(DdfError::Internal(format!(
                "Submessage field '{}' decoded as a plain value",
                field.name
            ))),
            Type::Group | Type::Sfixed32 | Type::Sfixed64 | Type::Sint32 | Type::Sint64 => {
                Err(DdfError::Internal(format!(
                    "Cannot load field '{}' of unsupported type {}",
                    field.name,
                    field.ty.name()
                )))
            }
        }
    }
}

/// Check required fields and fill in defaults for absent optional ones.
fn apply_defaults<M: ArenaMemory>(
    ctx: &mut LoadContext<'_, M>,
    desc: &Descriptor,
    base: usize,
    seen: &[bool],
) -> Result<()> {
    for (field, &seen) in desc.fields.iter().zip(seen) {
        if seen || field.is_repeated() || field.is_oneof_member() {
            continue;
        }
        if field.is_required() {
            tracing::debug!(
                "Missing required field '{}' in '{}'",
                field.name,
                desc.name
            );
            return Err(DdfError::MissingRequiredField {
                message: desc.name.clone(),
                field: field.name.clone(),
            });
        }
        apply_field_default(ctx, field, base + field.offset)?;
    }
    Ok(())
}

fn apply_field_default<M: ArenaMemory>(
    ctx: &mut LoadContext<'_, M>,
    field: &FieldDescriptor,
    slot: usize,
) -> Result<()> {
    match field.ty {
        // An absent inline submessage still gets its own defaults
        Type::Message if !field.is_dynamic() => {
            let nested = ctx.registry().nested(field)?;
            for inner in &nested.fields {
                if !inner.is_repeated() && !inner.is_required() && !inner.is_oneof_member() {
                    apply_field_default(ctx, inner, slot + inner.offset)?;
                }
            }
            Ok(())
        }
        // Strings without a default read as empty, never as null
        Type::String => {
            let value = field.default_value.as_deref().unwrap_or_default();
            let offset = ctx.alloc_string(value.len() + 1)?;
            ctx.write(offset, value)?;
            ctx.write(offset + value.len(), &[0])?;
            ctx.put_pointer(slot, Some(offset))
        }
        ty => match (&field.default_value, ty.scalar_size()) {
            (Some(value), Some(size)) if value.len() == size => {
                ctx.write(slot, &native_order(value))
            }
            (Some(value), _) => Err(DdfError::Internal(format!(
                "Default of field '{}' has {} bytes, expected a {}",
                field.name,
                value.len(),
                ty.name()
            ))),
            (None, _) => Ok(()),
        },
    }
}

/// Convert a little-endian default to native byte order.
fn native_order(value: &[u8]) -> Vec<u8> {
    let mut bytes = value.to_vec();
    if cfg!(target_endian = "big") {
        bytes.reverse();
    }
    bytes
}
