//! Pointer fix-ups for decoded arenas.
//!
//! Both operations walk the message tree through its descriptors and
//! rewrite every pointer slot exactly once: string pointers, the data
//! pointer of bytes and repeated headers, and the pointer of each dynamic
//! submessage. Scalars and counts are left alone. Of a oneof, only the
//! member named by the case slot is walked.

use crate::arena::Addressing;
use crate::error::{DdfError, Result};
use crate::load::{check_depth, DEFAULT_MAX_DEPTH};
use crate::message::Message;
use crate::schema::{
    Descriptor, FieldDescriptor, Registry, Type, POINTER_SIZE, REPEATED_COUNT_OFFSET,
};

/// Slot rewriter for one arena.
struct Fixup<'a, L, E> {
    registry: &'a Registry,
    bytes: &'a mut [u8],
    locate: L,
    encode: E,
    max_depth: usize,
    rewritten: usize,
}

impl<L, E> Fixup<'_, L, E>
where
    L: Fn(usize, usize) -> Result<Option<usize>>,
    E: Fn(Option<usize>) -> usize,
{
    fn read_pointer(&self, slot: usize) -> Result<usize> {
        let end = slot + POINTER_SIZE;
        let raw = self.bytes.get(slot..end).ok_or_else(|| out_of_bounds(slot, self.bytes.len()))?;
        let mut buf = [0u8; POINTER_SIZE];
        buf.copy_from_slice(raw);
        Ok(usize::from_ne_bytes(buf))
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        let raw = self
            .bytes
            .get(offset..offset + 4)
            .ok_or_else(|| out_of_bounds(offset, self.bytes.len()))?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(raw);
        Ok(u32::from_ne_bytes(buf))
    }

    fn read_count(&self, slot: usize) -> Result<u32> {
        self.read_u32(slot + REPEATED_COUNT_OFFSET)
    }

    /// Rewrite the pointer in `slot`, returning the arena offset it refers to.
    fn fix_slot(&mut self, slot: usize) -> Result<Option<usize>> {
        let raw = self.read_pointer(slot)?;
        let target = (self.locate)(raw, self.bytes.len())?;
        let value = (self.encode)(target);
        self.bytes[slot..slot + POINTER_SIZE].copy_from_slice(&value.to_ne_bytes());
        if target.is_some() {
            self.rewritten += 1;
        }
        Ok(target)
    }

    fn walk(&mut self, desc: &Descriptor, base: usize, depth: usize) -> Result<()> {
        check_depth(depth, self.max_depth)?;
        let registry = self.registry;

        for field in &desc.fields {
            let slot = base + field.offset;
            if let Some(oneof) = desc.oneof_of(field) {
                if self.read_u32(base + oneof.case_offset)? != field.number {
                    continue;
                }
            }
            if field.is_repeated() {
                self.walk_repeated(registry, field, slot, depth)?;
                continue;
            }
            match field.ty {
                Type::String | Type::Bytes => {
                    self.fix_slot(slot)?;
                }
                Type::Message if field.is_dynamic() => {
                    if let Some(target) = self.fix_slot(slot)? {
                        self.walk(registry.nested(field)?, target, depth + 1)?;
                    }
                }
                Type::Message => self.walk(registry.nested(field)?, slot, depth + 1)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn walk_repeated(
        &mut self,
        registry: &Registry,
        field: &FieldDescriptor,
        slot: usize,
        depth: usize,
    ) -> Result<()> {
        let count = self.read_count(slot)? as usize;
        let Some(data) = self.fix_slot(slot)? else {
            return Ok(());
        };
        let stride = registry.element_stride(field)?;
        let end = count
            .checked_mul(stride)
            .and_then(|len| data.checked_add(len))
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| out_of_bounds(data, self.bytes.len()))?;

        match field.ty {
            Type::String | Type::Bytes => {
                for element in (data..end).step_by(stride) {
                    self.fix_slot(element)?;
                }
            }
            Type::Message => {
                let nested = registry.nested(field)?;
                for element in (data..end).step_by(stride.max(1)) {
                    self.walk(nested, element, depth + 1)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn out_of_bounds(offset: usize, len: usize) -> DdfError {
    DdfError::Internal(format!(
        "Pointer slot at {} outside arena of {} bytes",
        offset, len
    ))
}

/// Convert a message loaded with relative addressing to absolute pointers.
///
/// Null slots become zero. Fails when the message already uses absolute
/// addressing.
pub fn resolve_pointers(message: &mut Message<'_>) -> Result<()> {
    if message.addressing() == Addressing::Absolute {
        return Err(DdfError::Internal(format!(
            "Message '{}' already uses absolute pointers",
            message.descriptor().name
        )));
    }

    let registry = message.registry();
    let descriptor = message.descriptor();
    let base = message.base_address();
    let root_size = descriptor.size;
    let max_depth = message.max_depth();

    let mut fixup = Fixup {
        registry,
        bytes: message.storage_mut().as_bytes_mut(),
        locate: |raw, len| Addressing::Relative.locate(raw, base, root_size, len),
        encode: |target| Addressing::Absolute.encode(target, base),
        max_depth,
        rewritten: 0,
    };
    fixup.walk(descriptor, 0, 0)?;
    tracing::trace!(
        "Resolved {} pointers in '{}' at {:#x}",
        fixup.rewritten,
        descriptor.name,
        base
    );

    message.set_addressing(Addressing::Absolute);
    Ok(())
}

/// Move the absolute pointers of an arena image from `old_base` to
/// `new_base`.
///
/// Used after the image of a message loaded with absolute addressing has
/// been copied to a new address. Null pointers stay null. Trees nested
/// deeper than [`DEFAULT_MAX_DEPTH`] are rejected; [`Message::try_clone`]
/// applies the message's own limit instead.
pub fn rebase_message_pointers(
    registry: &Registry,
    descriptor: &Descriptor,
    bytes: &mut [u8],
    old_base: usize,
    new_base: usize,
) -> Result<()> {
    rebase(registry, descriptor, bytes, old_base, new_base, DEFAULT_MAX_DEPTH)
}

pub(crate) fn rebase(
    registry: &Registry,
    descriptor: &Descriptor,
    bytes: &mut [u8],
    old_base: usize,
    new_base: usize,
    max_depth: usize,
) -> Result<()> {
    if !registry.owns(descriptor) {
        return Err(DdfError::Internal(format!(
            "Descriptor '{}' does not belong to this registry",
            descriptor.name
        )));
    }
    if bytes.len() < descriptor.size {
        return Err(out_of_bounds(descriptor.size, bytes.len()));
    }

    let root_size = descriptor.size;
    let mut fixup = Fixup {
        registry,
        bytes,
        locate: |raw, len| Addressing::Absolute.locate(raw, old_base, root_size, len),
        encode: |target| Addressing::Absolute.encode(target, new_base),
        max_depth,
        rewritten: 0,
    };
    fixup.walk(descriptor, 0, 0)?;
    tracing::trace!(
        "Rebased {} pointers in '{}' from {:#x} to {:#x}",
        fixup.rewritten,
        descriptor.name,
        old_base,
        new_base
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::{load_message, LoadOptions};
    use crate::schema::{FieldSpec, MessageSpec, SchemaSpec};

    fn registry() -> Registry {
        SchemaSpec::new()
            .message(
                MessageSpec::new("node")
                    .field(FieldSpec::optional("label", 1, Type::String))
                    .field(FieldSpec::optional("next", 2, Type::Message).type_name("node"))
                    .field(FieldSpec::repeated("tags", 3, Type::String))
                    .field(FieldSpec::optional("blob", 4, Type::Bytes)),
            )
            .build()
            .unwrap()
    }

    // node { label: "a" next { label: "b" } tags: ["x", "y"] blob: 01 02 }
    const NODE: [u8; 18] = [
        0x0A, 0x01, b'a', // label
        0x12, 0x03, 0x0A, 0x01, b'b', // next
        0x1A, 0x01, b'x', // tags
        0x1A, 0x01, b'y', // tags
        0x22, 0x02, 0x01, 0x02, // blob
    ];

    fn check(message: &Message<'_>) {
        let root = message.root();
        assert_eq!(root.get_string("label").unwrap(), Some("a"));
        let next = root.get_message("next").unwrap().unwrap();
        assert_eq!(next.get_string("label").unwrap(), Some("b"));
        assert!(next.get_message("next").unwrap().is_none());
        let tags = root.get_repeated("tags").unwrap();
        assert_eq!(tags.string(0).unwrap(), Some("x"));
        assert_eq!(tags.string(1).unwrap(), Some("y"));
        assert_eq!(root.get_bytes("blob").unwrap(), &[1, 2]);
    }

    #[test]
    fn test_resolve_relative() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        let mut message =
            load_message(&registry, desc, &NODE, LoadOptions::new().offset_pointers()).unwrap();
        check(&message);

        message.resolve_pointers().unwrap();
        assert_eq!(message.addressing(), Addressing::Absolute);
        check(&message);

        let label_slot = desc.field_by_name("label").unwrap().offset;
        let raw = usize::from_ne_bytes(
            message.as_bytes()[label_slot..label_slot + POINTER_SIZE]
                .try_into()
                .unwrap(),
        );
        assert!(raw > message.base_address());
    }

    #[test]
    fn test_resolve_twice_fails() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        let mut message =
            load_message(&registry, desc, &NODE, LoadOptions::new().offset_pointers()).unwrap();

        message.resolve_pointers().unwrap();
        assert!(matches!(
            message.resolve_pointers(),
            Err(DdfError::Internal(_))
        ));
    }

    #[test]
    fn test_rebase_copied_image() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        let message = load_message(&registry, desc, &NODE, LoadOptions::new()).unwrap();

        let mut image = message.as_bytes().to_vec();
        let old_base = message.base_address();
        let new_base = image.as_ptr() as usize;
        rebase_message_pointers(&registry, desc, &mut image, old_base, new_base).unwrap();

        // Every rebased pointer now lands in the copy
        let label_slot = desc.field_by_name("label").unwrap().offset;
        let raw = usize::from_ne_bytes(image[label_slot..label_slot + POINTER_SIZE].try_into().unwrap());
        assert!(raw >= new_base && raw < new_base + image.len());
        let offset = raw - new_base;
        assert_eq!(&image[offset..offset + 2], b"a\0");

        // Rebasing back restores the original image
        rebase_message_pointers(&registry, desc, &mut image, new_base, old_base).unwrap();
        assert_eq!(image, message.as_bytes());
    }

    #[test]
    fn test_rebase_rejects_stray_pointer() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        let message = load_message(&registry, desc, &NODE, LoadOptions::new()).unwrap();

        let mut image = message.as_bytes().to_vec();
        let old_base = message.base_address();
        let label_slot = desc.field_by_name("label").unwrap().offset;
        let stray = old_base + image.len() + 64;
        image[label_slot..label_slot + POINTER_SIZE].copy_from_slice(&stray.to_ne_bytes());

        let result = rebase_message_pointers(&registry, desc, &mut image, old_base, 0x1000);
        assert!(result.is_err());
    }

    #[test]
    fn test_walk_skips_unset_oneof_member() {
        let registry = SchemaSpec::new()
            .message(
                MessageSpec::new("value")
                    .field(FieldSpec::optional("text", 1, Type::String).oneof("kind"))
                    .field(FieldSpec::optional("number", 2, Type::Uint64).oneof("kind")),
            )
            .build()
            .unwrap();
        let desc = registry.get_descriptor("value").unwrap();

        // number=5 sits where a text pointer would
        let number = load_message(&registry, desc, &[0x10, 0x05], LoadOptions::new()).unwrap();
        let copy = number.try_clone().unwrap();
        assert_eq!(copy.root().get::<u64>("number").unwrap(), 5);

        let mut text = load_message(
            &registry,
            desc,
            &[0x0A, 0x01, b't'],
            LoadOptions::new().offset_pointers(),
        )
        .unwrap();
        text.resolve_pointers().unwrap();
        assert_eq!(text.root().get_string("text").unwrap(), Some("t"));
        assert!(text.root().get::<u64>("number").is_err());
    }
}
