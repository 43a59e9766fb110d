//! Pre-decode passes over the wire bytes.
//!
//! Neither pass writes to the arena. They fill the context tables the
//! decode passes rely on:
//! - dynamic measurement queues one arena slot per dynamic submessage, in
//!   the order the decoder will meet them
//! - repeated counting records the element count of every repeated field,
//!   keyed by the message instance it belongs to. Repeated occurrences of
//!   a non-repeated submessage share one instance key

use crate::arena::{DryRun, LoadContext};
use crate::error::{DdfError, Result};
use crate::schema::{align_up, Descriptor, Type, ARENA_ALIGNMENT};
use crate::wire::{InputBuffer, Tag, WireType};

pub(crate) fn check_depth(depth: usize, max_depth: usize) -> Result<()> {
    if depth > max_depth {
        return Err(DdfError::WireFormat(format!(
            "Message nesting exceeds {} levels",
            max_depth
        )));
    }
    Ok(())
}

/// Queue dynamic submessage offsets and total the dynamic region size.
///
/// Offsets are relative to the start of the dynamic region and 16-byte
/// aligned. Submessages are recorded before their contents are walked.
pub(super) fn measure_dynamic(
    ctx: &mut LoadContext<'_, DryRun>,
    input: &mut InputBuffer<'_>,
    desc: &Descriptor,
    dynamic_size: &mut usize,
    depth: usize,
    max_depth: usize,
) -> Result<()> {
    check_depth(depth, max_depth)?;
    let registry = ctx.registry();

    while !input.eof() {
        let tag = Tag::decode(input.read_varint32()?)?;
        match desc.find_field(tag.field_number) {
            Some(field)
                if field.ty == Type::Message && tag.wire_type == WireType::LengthDelimited =>
            {
                let nested = registry.nested(field)?;
                let len = input.read_varint32()? as usize;
                let mut sub = input.sub_buffer(len)?;

                if field.is_dynamic() {
                    *dynamic_size = align_up(*dynamic_size, ARENA_ALIGNMENT);
                    ctx.add_dynamic_type_offset(*dynamic_size);
                    *dynamic_size += nested.size;
                }
                measure_dynamic(ctx, &mut sub, nested, dynamic_size, depth + 1, max_depth)?;
            }
            _ => input.skip_field(tag.wire_type)?,
        }
    }
    Ok(())
}

/// Count repeated field elements of every message instance.
///
/// `key` identifies the instance `input` belongs to.
pub(super) fn count_repeated(
    ctx: &mut LoadContext<'_, DryRun>,
    input: &mut InputBuffer<'_>,
    desc: &Descriptor,
    key: usize,
    depth: usize,
    max_depth: usize,
) -> Result<()> {
    check_depth(depth, max_depth)?;
    let registry = ctx.registry();

    while !input.eof() {
        let tag = Tag::decode(input.read_varint32()?)?;
        let Some(field) = desc.find_field(tag.field_number) else {
            input.skip_field(tag.wire_type)?;
            continue;
        };

        if field.is_repeated() {
            if tag.wire_type == WireType::LengthDelimited && field.ty.is_scalar() {
                let len = input.read_varint32()? as usize;
                let mut packed = input.sub_buffer(len)?;
                let count = count_packed(&mut packed, field.ty)?;
                ctx.add_array_count(key, field.number, count);
                continue;
            }
            ctx.increase_array_count(key, field.number);
        }

        if field.ty == Type::Message && tag.wire_type == WireType::LengthDelimited {
            let nested = registry.nested(field)?;
            let len = input.read_varint32()? as usize;
            let mut sub = input.sub_buffer(len)?;
            let position = sub.absolute_position();
            let child = if field.is_repeated() {
                position
            } else {
                ctx.struct_key(key, field.number, position)
            };
            count_repeated(ctx, &mut sub, nested, child, depth + 1, max_depth)?;
        } else {
            input.skip_field(tag.wire_type)?;
        }
    }
    Ok(())
}

/// Number of elements in a packed run of scalars.
fn count_packed(input: &mut InputBuffer<'_>, ty: Type) -> Result<u32> {
    let width = match ty.wire_type() {
        Some(WireType::Fixed32) => 4,
        Some(WireType::Fixed64) => 8,
        _ => {
            let mut count = 0u32;
            while !input.eof() {
                input.read_varint64()?;
                count += 1;
            }
            return Ok(count);
        }
    };

    let len = input.remaining();
    if len % width != 0 {
        return Err(DdfError::WireFormat(format!(
            "Packed run of {} bytes is not a multiple of {}",
            len, width
        )));
    }
    input.skip(len)?;
    Ok((len / width) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Addressing;
    use crate::schema::{FieldSpec, MessageSpec, Registry, SchemaSpec};

    fn registry() -> Registry {
        SchemaSpec::new()
            .message(
                MessageSpec::new("node")
                    .field(FieldSpec::optional("value", 1, Type::Int32))
                    .field(FieldSpec::optional("next", 2, Type::Message).type_name("node"))
                    .field(FieldSpec::repeated("tags", 3, Type::Int32))
                    .field(FieldSpec::repeated("weights", 4, Type::Float)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_count_repeated_per_instance() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        // tags=1, tags=2, next { tags=3 }
        let data = [0x18, 0x01, 0x18, 0x02, 0x12, 0x02, 0x18, 0x03];
        let mut input = InputBuffer::new(&data);
        let mut ctx = LoadContext::new(&registry, DryRun, Addressing::Absolute);

        count_repeated(&mut ctx, &mut input, desc, 0, 0, 100).unwrap();

        assert_eq!(ctx.array_count(0, 3), 2);
        assert_eq!(ctx.array_count(6, 3), 1);
    }

    #[test]
    fn test_count_merges_repeated_occurrences() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        // next { tags=1 } next { tags=2 tags=3 }
        let data = [0x12, 0x02, 0x18, 0x01, 0x12, 0x04, 0x18, 0x02, 0x18, 0x03];
        let mut input = InputBuffer::new(&data);
        let mut ctx = LoadContext::new(&registry, DryRun, Addressing::Absolute);

        count_repeated(&mut ctx, &mut input, desc, 0, 0, 100).unwrap();

        assert_eq!(ctx.array_count(2, 3), 3);
        assert_eq!(ctx.array_count(6, 3), 0);
    }

    #[test]
    fn test_count_packed() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        // tags packed [1, 300], weights packed [0.0, 0.0]
        let data = [
            0x1A, 0x03, 0x01, 0xAC, 0x02, 0x22, 0x08, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        let mut input = InputBuffer::new(&data);
        let mut ctx = LoadContext::new(&registry, DryRun, Addressing::Absolute);

        count_repeated(&mut ctx, &mut input, desc, 0, 0, 100).unwrap();

        assert_eq!(ctx.array_count(0, 3), 2);
        assert_eq!(ctx.array_count(0, 4), 2);
    }

    #[test]
    fn test_packed_fixed_misaligned() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        let data = [0x22, 0x03, 0, 0, 0];
        let mut input = InputBuffer::new(&data);
        let mut ctx = LoadContext::new(&registry, DryRun, Addressing::Absolute);

        let result = count_repeated(&mut ctx, &mut input, desc, 0, 0, 100);
        assert!(matches!(result, Err(DdfError::WireFormat(_))));
    }

    #[test]
    fn test_measure_dynamic() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        // next { next { value=1 } }, unknown field 9
        let data = [0x12, 0x04, 0x12, 0x02, 0x08, 0x01, 0x48, 0x05];
        let mut input = InputBuffer::new(&data);
        let mut ctx = LoadContext::new(&registry, DryRun, Addressing::Absolute);
        let mut size = 0;

        measure_dynamic(&mut ctx, &mut input, desc, &mut size, 0, 100).unwrap();

        assert_eq!(ctx.dynamic_type_count(), 2);
        assert_eq!(size, align_up(desc.size, ARENA_ALIGNMENT) + desc.size);
    }

    #[test]
    fn test_depth_limit() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        let data = [0x12, 0x04, 0x12, 0x02, 0x08, 0x01];
        let mut input = InputBuffer::new(&data);
        let mut ctx = LoadContext::new(&registry, DryRun, Addressing::Absolute);
        let mut size = 0;

        let result = measure_dynamic(&mut ctx, &mut input, desc, &mut size, 0, 1);
        assert!(result.unwrap_err().to_string().contains("nesting"));
    }
}
