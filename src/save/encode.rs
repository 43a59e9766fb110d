//! Recursive field encoder.

use crate::error::{DdfError, Result};
use crate::load::check_depth;
use crate::message::{BufferView, MessageRef};
use crate::schema::{FieldDescriptor, Registry, Type};
use crate::wire::{CountingSink, OutputStream, SaveSink};

/// Encode every field of `message` in descriptor order.
///
/// Nesting is limited by the depth the message was loaded with.
pub(super) fn encode_message<S: SaveSink + ?Sized>(
    out: &mut OutputStream<'_, S>,
    message: &MessageRef<'_>,
    depth: usize,
) -> Result<()> {
    let view = message.view();
    check_depth(depth, view.max_depth())?;
    let desc = message.descriptor();
    let registry = message.registry();

    for field in &desc.fields {
        if field.ty.is_reserved() {
            tracing::warn!(
                "Field '{}' of '{}' has unsupported type {}",
                field.name,
                desc.name,
                field.ty.name()
            );
            return Err(DdfError::Internal(format!(
                "Cannot save field '{}' of unsupported type {}",
                field.name,
                field.ty.name()
            )));
        }
        let slot = message.offset() + field.offset;

        // Only the set member of a oneof is written
        if let Some(oneof) = desc.oneof_of(field) {
            if view.read_oneof_case(message.offset(), oneof)? != field.number {
                continue;
            }
        }

        if field.is_repeated() {
            let (data, count) = view.read_header(slot)?;
            let Some(data) = data else {
                continue;
            };
            let stride = registry.element_stride(field)?;
            for i in 0..count as usize {
                encode_value(out, registry, view, field, data + i * stride, depth)?;
            }
            continue;
        }

        match field.ty {
            // Null only in images built outside the loader
            Type::String => {
                if view.read_pointer(slot)?.is_some() {
                    encode_value(out, registry, view, field, slot, depth)?;
                }
            }
            Type::Message if field.is_dynamic() => {
                if let Some(target) = view.read_pointer(slot)? {
                    encode_value(out, registry, view, field, target, depth)?;
                }
            }
            _ => encode_value(out, registry, view, field, slot, depth)?,
        }
    }
    Ok(())
}

/// Emit `tag + payload` for the value stored at `at`.
///
/// For strings and bytes `at` is the pointer slot or header, for messages
/// it is the struct itself.
fn encode_value<S: SaveSink + ?Sized>(
    out: &mut OutputStream<'_, S>,
    registry: &Registry,
    view: BufferView<'_>,
    field: &FieldDescriptor,
    at: usize,
    depth: usize,
) -> Result<()> {
    let wire_type = field.ty.wire_type().ok_or_else(|| {
        DdfError::Internal(format!("Field '{}' has no wire type", field.name))
    })?;
    out.write_tag(field.number, wire_type)?;

    match field.ty {
        Type::Bool => {
            let [v] = view.read_array::<1>(at)?;
            out.write_varint32(u32::from(v != 0))
        }
        // Sign-extended, so negatives take ten bytes
        Type::Int32 | Type::Enum => {
            let v = i32::from_ne_bytes(view.read_array(at)?);
            out.write_varint64(v as i64 as u64)
        }
        Type::Uint32 => out.write_varint32(u32::from_ne_bytes(view.read_array(at)?)),
        Type::Int64 | Type::Uint64 => out.write_varint64(u64::from_ne_bytes(view.read_array(at)?)),
        Type::Float | Type::Fixed32 => out.write_fixed32(u32::from_ne_bytes(view.read_array(at)?)),
        Type::Double | Type::Fixed64 => {
            out.write_fixed64(u64::from_ne_bytes(view.read_array(at)?))
        }
        Type::String => out.write_string(view.read_string(at)?),
        Type::Bytes => out.write_string(Some(view.read_bytes(at)?)),
        Type::Message => {
            let nested = MessageRef::new(registry, registry.nested(field)?, view, at);

            let mut counter = CountingSink::new();
            encode_message(&mut OutputStream::new(&mut counter), &nested, depth + 1)?;
            let len = u32::try_from(counter.count()).map_err(|_| {
                DdfError::Internal(format!(
                    "Submessage '{}' encodes to {} bytes",
                    field.name,
                    counter.count()
                ))
            })?;

            out.write_varint32(len)?;
            encode_message(out, &nested, depth + 1)
        }
        Type::Group | Type::Sfixed32 | Type::Sfixed64 | Type::Sint32 | Type::Sint64 => {
            Err(DdfError::Internal(format!(
                "Cannot save field '{}' of unsupported type {}",
                field.name,
                field.ty.name()
            )))
        }
    }
}
