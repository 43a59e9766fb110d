//! Schema module - descriptors, registry and layout computation.
//!
//! This module describes message types to the codec:
//! - Descriptor tables (field numbers, types, labels, native offsets)
//! - Registry owning every descriptor, with lookups by name and hash
//! - Serde-friendly schema specs that compute C-compatible layouts

mod builder;
mod descriptor;
mod registry;

pub(crate) use builder::align_up;
pub use builder::{DefaultSpec, EnumSpec, EnumValueSpec, FieldSpec, MessageSpec, SchemaSpec};
pub use descriptor::{
    hash_name, scalar_type_size, wire_type_for, Descriptor, DescriptorId, EnumDescriptor, EnumId,
    EnumValueDescriptor, FieldDescriptor, Label, OneofDescriptor, Type, ARENA_ALIGNMENT,
    MAJOR_VERSION, MINOR_VERSION, ONEOF_CASE_SIZE, POINTER_SIZE, REPEATED_COUNT_OFFSET,
    REPEATED_HEADER_SIZE,
};
pub use registry::Registry;
