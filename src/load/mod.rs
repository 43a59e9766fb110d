//! Load module - wire bytes to a native message tree.
//!
//! Decoding runs four passes over the input:
//! 1. measure the dynamic submessage region (only when the type graph
//!    has dynamic fields)
//! 2. count repeated field elements per message instance
//! 3. dry decode to measure the arena
//! 4. real decode into a zeroed, 16-byte aligned arena of exactly that size
//!
//! Both decode passes merge repeated occurrences of a non-repeated
//! submessage into one instance, as protobuf parsers do.
//!
//! # Example
//!
//! ```
//! use ddf::{load_message, LoadOptions, Registry};
//!
//! let registry = Registry::from_json(r#"{ "messages": [
//!     { "name": "counter", "fields": [ { "name": "value", "number": 1, "type": "uint32" } ] }
//! ]}"#).unwrap();
//! let desc = registry.get_descriptor("counter").unwrap();
//!
//! let message = load_message(&registry, desc, &[0x08, 0x2A], LoadOptions::default()).unwrap();
//! assert_eq!(message.root().get::<u32>("value").unwrap(), 42);
//! ```

mod decode;
mod measure;

pub(crate) use measure::check_depth;

use crate::arena::{AlignedBuffer, Addressing, ArenaBuffer, DryRun, LoadContext};
use crate::error::{DdfError, Result};
use crate::message::Message;
use crate::schema::{Descriptor, Registry, MAJOR_VERSION};
use crate::wire::InputBuffer;

/// Default limit on submessage nesting.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Instance key of the root message.
const ROOT_KEY: usize = 0;

/// Options controlling how a message is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// How pointer slots are stored.
    pub addressing: Addressing,
    /// Deepest submessage nesting accepted.
    pub max_depth: usize,
}

impl LoadOptions {
    /// Absolute pointers, default nesting limit.
    pub fn new() -> Self {
        Self {
            addressing: Addressing::Absolute,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Store pointers as offsets from the start of the arena.
    pub fn offset_pointers(mut self) -> Self {
        self.addressing = Addressing::Relative;
        self
    }

    /// Set the addressing mode.
    pub fn with_addressing(mut self, addressing: Addressing) -> Self {
        self.addressing = addressing;
        self
    }

    /// Set the nesting limit.
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode `bytes` as a message of type `descriptor`.
///
/// On success the returned message owns one arena holding the whole tree;
/// its size is [`Message::size`]. On failure nothing is allocated.
pub fn load_message<'r>(
    registry: &'r Registry,
    descriptor: &'r Descriptor,
    bytes: &[u8],
    options: LoadOptions,
) -> Result<Message<'r>> {
    if !registry.owns(descriptor) {
        return Err(DdfError::Internal(format!(
            "Descriptor '{}' does not belong to this registry",
            descriptor.name
        )));
    }
    if descriptor.major_version != MAJOR_VERSION {
        tracing::debug!(
            "Rejecting '{}' with major version {}",
            descriptor.name,
            descriptor.major_version
        );
        return Err(DdfError::VersionMismatch {
            expected: MAJOR_VERSION,
            found: descriptor.major_version,
        });
    }

    let max_depth = options.max_depth;
    let has_dynamic = registry.has_dynamic_fields(descriptor);
    let mut input = InputBuffer::new(bytes);
    let mut dry = LoadContext::new(registry, DryRun, options.addressing);

    let mut dynamic_size = 0;
    if has_dynamic {
        measure::measure_dynamic(&mut dry, &mut input, descriptor, &mut dynamic_size, 0, max_depth)?;
        input.seek(0)?;
    }

    measure::count_repeated(&mut dry, &mut input, descriptor, ROOT_KEY, 0, max_depth)?;
    input.seek(0)?;

    let root = dry.alloc_message(descriptor)?;
    if has_dynamic {
        dry.alloc_dynamic_region(dynamic_size)?;
    }
    decode::Decoder::new(&mut dry, max_depth).decode_root(&mut input, descriptor, root)?;
    let size = dry.memory_usage();
    let tables = dry.into_tables();

    let mut storage = AlignedBuffer::zeroed(size);
    {
        let memory = ArenaBuffer::new(storage.as_bytes_mut());
        let mut ctx = LoadContext::with_tables(registry, memory, options.addressing, tables);
        ctx.reset_dynamic_type_offsets();
        input.seek(0)?;

        let root = ctx.alloc_message(descriptor)?;
        if has_dynamic {
            ctx.alloc_dynamic_region(dynamic_size)?;
        }
        decode::Decoder::new(&mut ctx, max_depth).decode_root(&mut input, descriptor, root)?;

        if ctx.memory_usage() != size {
            return Err(DdfError::Internal(format!(
                "Decode used {} bytes but measured {}",
                ctx.memory_usage(),
                size
            )));
        }
    }

    tracing::debug!(
        "Loaded '{}' from {} bytes into {} byte arena ({} dynamic)",
        descriptor.name,
        bytes.len(),
        size,
        dynamic_size
    );

    Ok(Message::from_parts(
        registry,
        descriptor,
        storage,
        options.addressing,
        max_depth,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, MessageSpec, SchemaSpec, Type, ARENA_ALIGNMENT};

    fn registry() -> Registry {
        SchemaSpec::new()
            .message(
                MessageSpec::new("inner")
                    .field(FieldSpec::optional("x", 1, Type::Int32).default_value(7))
                    .field(FieldSpec::optional("label", 2, Type::String).default_value("none")),
            )
            .message(
                MessageSpec::new("outer")
                    .field(FieldSpec::optional("id", 1, Type::Uint64))
                    .field(FieldSpec::optional("inner", 2, Type::Message).type_name("inner"))
                    .field(FieldSpec::repeated("items", 3, Type::Message).type_name("inner"))
                    .field(FieldSpec::repeated("names", 4, Type::String))
                    .field(FieldSpec::optional("blob", 5, Type::Bytes))
                    .field(FieldSpec::optional("ratio", 6, Type::Double).default_value(0.25))
                    .field(FieldSpec::optional("flag", 7, Type::Bool)),
            )
            .message(
                MessageSpec::new("node")
                    .field(FieldSpec::required("value", 1, Type::Int32))
                    .field(FieldSpec::optional("next", 2, Type::Message).type_name("node")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_load_scalars_and_defaults() {
        let registry = registry();
        let desc = registry.get_descriptor("outer").unwrap();
        // id=5, flag=true
        let message = load_message(&registry, desc, &[0x08, 0x05, 0x38, 0x01], LoadOptions::new()).unwrap();
        let root = message.root();

        assert_eq!(root.get::<u64>("id").unwrap(), 5);
        assert!(root.get::<bool>("flag").unwrap());
        assert_eq!(root.get::<f64>("ratio").unwrap(), 0.25);

        // Absent inline submessage still carries its defaults
        let inner = root.get_message("inner").unwrap().unwrap();
        assert_eq!(inner.get::<i32>("x").unwrap(), 7);
        assert_eq!(inner.get_string("label").unwrap(), Some("none"));

        assert!(root.get_repeated("items").unwrap().is_empty());
        assert!(root.get_bytes("blob").unwrap().is_empty());
    }

    #[test]
    fn test_load_repeated_messages() {
        let registry = registry();
        let desc = registry.get_descriptor("outer").unwrap();
        // items { x=1 } items { label="a" } names="p" names="q"
        let data = [
            0x1A, 0x02, 0x08, 0x01, 0x1A, 0x03, 0x12, 0x01, b'a', 0x22, 0x01, b'p', 0x22, 0x01,
            b'q',
        ];
        let message = load_message(&registry, desc, &data, LoadOptions::new()).unwrap();
        let root = message.root();

        let items = root.get_repeated("items").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.message(0).unwrap().get::<i32>("x").unwrap(), 1);
        assert_eq!(items.message(0).unwrap().get_string("label").unwrap(), Some("none"));
        assert_eq!(items.message(1).unwrap().get::<i32>("x").unwrap(), 7);
        assert_eq!(items.message(1).unwrap().get_string("label").unwrap(), Some("a"));
        assert_eq!(items.data_offset().unwrap() % ARENA_ALIGNMENT, 0);

        let names = root.get_repeated("names").unwrap();
        assert_eq!(names.string(0).unwrap(), Some("p"));
        assert_eq!(names.string(1).unwrap(), Some("q"));
    }

    #[test]
    fn test_load_bytes_aligned() {
        let registry = registry();
        let desc = registry.get_descriptor("outer").unwrap();
        let data = [0x2A, 0x03, 1, 2, 3];
        let message = load_message(&registry, desc, &data, LoadOptions::new()).unwrap();

        let blob = message.root().get_bytes("blob").unwrap();
        assert_eq!(blob, &[1, 2, 3]);
        assert_eq!(blob.as_ptr() as usize % ARENA_ALIGNMENT, 0);
    }

    #[test]
    fn test_load_recursive() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        // value=1 next { value=2 next { value=3 } }
        let data = [0x08, 0x01, 0x12, 0x06, 0x08, 0x02, 0x12, 0x02, 0x08, 0x03];
        let message = load_message(&registry, desc, &data, LoadOptions::new()).unwrap();

        let mut values = Vec::new();
        let mut node = Some(message.root());
        while let Some(current) = node {
            values.push(current.get::<i32>("value").unwrap());
            node = current.get_message("next").unwrap();
        }
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_required_in_nested() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        // value=1 next { }
        let data = [0x08, 0x01, 0x12, 0x00];

        let result = load_message(&registry, desc, &data, LoadOptions::new());
        match result {
            Err(DdfError::MissingRequiredField { message, field }) => {
                assert_eq!(message, "node");
                assert_eq!(field, "value");
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.size())),
        }
    }

    #[test]
    fn test_wire_type_mismatch() {
        let registry = registry();
        let desc = registry.get_descriptor("outer").unwrap();
        // id sent as fixed32
        let data = [0x0D, 0, 0, 0, 0];

        let result = load_message(&registry, desc, &data, LoadOptions::new());
        assert!(matches!(result, Err(DdfError::WireFormat(_))));
    }

    #[test]
    fn test_invalid_utf8_stored_verbatim() {
        let registry = registry();
        let desc = registry.get_descriptor("outer").unwrap();
        let data = [0x22, 0x02, 0xC3, 0x28];

        let message = load_message(&registry, desc, &data, LoadOptions::new()).unwrap();
        let names = message.root().get_repeated("names").unwrap();
        assert_eq!(names.string_bytes(0).unwrap(), Some(&[0xC3, 0x28][..]));
        assert!(names.string(0).unwrap_err().to_string().contains("UTF-8"));
    }

    #[test]
    fn test_repeated_dynamic_occurrences_merge() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        // value=1 next { value=2 } next { next { value=3 } }
        let data = [
            0x08, 0x01, 0x12, 0x02, 0x08, 0x02, 0x12, 0x04, 0x12, 0x02, 0x08, 0x03,
        ];
        let message = load_message(&registry, desc, &data, LoadOptions::new()).unwrap();

        let mut values = Vec::new();
        let mut node = Some(message.root());
        while let Some(current) = node {
            values.push(current.get::<i32>("value").unwrap());
            node = current.get_message("next").unwrap();
        }
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_repeated_inline_occurrences_merge() {
        let registry = registry();
        let desc = registry.get_descriptor("outer").unwrap();
        // inner { label="a" } inner { x=9 }
        let data = [0x12, 0x03, 0x12, 0x01, b'a', 0x12, 0x02, 0x08, 0x09];
        let message = load_message(&registry, desc, &data, LoadOptions::new()).unwrap();

        let inner = message.root().get_message("inner").unwrap().unwrap();
        assert_eq!(inner.get::<i32>("x").unwrap(), 9);
        assert_eq!(inner.get_string("label").unwrap(), Some("a"));
    }

    #[test]
    fn test_version_mismatch() {
        let registry = SchemaSpec::new()
            .message(MessageSpec::new("old").field(FieldSpec::optional("a", 1, Type::Int32)))
            .build()
            .unwrap();
        let mut descriptors: Vec<_> = registry.descriptors().cloned().collect();
        descriptors[0].major_version = 2;
        let registry = Registry::new(descriptors, Vec::new()).unwrap();
        let desc = registry.get_descriptor("old").unwrap();

        let result = load_message(&registry, desc, &[], LoadOptions::new());
        assert!(matches!(
            result,
            Err(DdfError::VersionMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_foreign_descriptor_rejected() {
        let registry = registry();
        let other = registry.clone();
        let desc = other.get_descriptor("outer").unwrap();

        let result = load_message(&registry, desc, &[], LoadOptions::new());
        assert!(matches!(result, Err(DdfError::Internal(_))));
    }

    #[test]
    fn test_depth_option() {
        let registry = registry();
        let desc = registry.get_descriptor("node").unwrap();
        let data = [0x08, 0x01, 0x12, 0x06, 0x08, 0x02, 0x12, 0x02, 0x08, 0x03];

        let result = load_message(&registry, desc, &data, LoadOptions::new().max_depth(1));
        assert!(result.unwrap_err().to_string().contains("nesting"));
    }
}
