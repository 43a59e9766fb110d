//! Descriptor tables.
//!
//! A [`Descriptor`] describes one message type: its native struct size and
//! alignment plus, for every field, the wire number, semantic type, label
//! and byte offset of the field's slot inside the struct.
//!
//! Slot layouts:
//! ```text
//! scalar            natural width (bool 1, 32-bit 4, 64-bit 8)
//! string            pointer-width slot, NUL-terminated tail data
//! bytes / repeated  RepeatedField header { data: pointer, count: u32 }
//! message (inline)  nested struct embedded at the offset
//! message (dynamic) pointer-width slot to a tail-allocated struct
//! oneof             members share one union slot, followed by a u32
//!                   case slot holding the number of the member set
//! ```

use std::hash::Hasher;
use std::mem::size_of;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::wire::WireType;

/// Descriptor major version understood by this runtime.
pub const MAJOR_VERSION: u16 = 1;

/// Descriptor minor version emitted by the schema builder.
pub const MINOR_VERSION: u16 = 0;

/// Width of a pointer slot on this platform.
pub const POINTER_SIZE: usize = size_of::<usize>();

/// Size of a RepeatedField header: pointer, u32 count, padding.
pub const REPEATED_HEADER_SIZE: usize = (POINTER_SIZE + 4 + POINTER_SIZE - 1) & !(POINTER_SIZE - 1);

/// Offset of the count within a RepeatedField header.
pub const REPEATED_COUNT_OFFSET: usize = POINTER_SIZE;

/// Alignment of every arena carve-out except strings.
pub const ARENA_ALIGNMENT: usize = 16;

/// Width of a oneof case slot.
pub const ONEOF_CASE_SIZE: usize = 4;

/// Semantic field type. Discriminants follow the protobuf numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Type {
    Double = 1,
    Float = 2,
    Int64 = 3,
    Uint64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    /// Reserved, never encoded or decoded.
    Group = 10,
    Message = 11,
    Bytes = 12,
    Uint32 = 13,
    Enum = 14,
    /// Reserved, never encoded or decoded.
    Sfixed32 = 15,
    /// Reserved, never encoded or decoded.
    Sfixed64 = 16,
    /// Reserved, never encoded or decoded.
    Sint32 = 17,
    /// Reserved, never encoded or decoded.
    Sint64 = 18,
}

impl Type {
    /// Native width of a scalar value, `None` for aggregates.
    pub fn scalar_size(self) -> Option<usize> {
        match self {
            Type::Bool => Some(1),
            Type::Int32
            | Type::Uint32
            | Type::Float
            | Type::Enum
            | Type::Fixed32
            | Type::Sfixed32
            | Type::Sint32 => Some(4),
            Type::Int64
            | Type::Uint64
            | Type::Double
            | Type::Fixed64
            | Type::Sfixed64
            | Type::Sint64 => Some(8),
            Type::String | Type::Bytes | Type::Message | Type::Group => None,
        }
    }

    /// Wire type used to encode this type, `None` for groups.
    pub fn wire_type(self) -> Option<WireType> {
        match self {
            Type::Double | Type::Fixed64 | Type::Sfixed64 => Some(WireType::Fixed64),
            Type::Float | Type::Fixed32 | Type::Sfixed32 => Some(WireType::Fixed32),
            Type::String | Type::Bytes | Type::Message => Some(WireType::LengthDelimited),
            Type::Group => None,
            Type::Int32
            | Type::Int64
            | Type::Uint32
            | Type::Uint64
            | Type::Bool
            | Type::Enum
            | Type::Sint32
            | Type::Sint64 => Some(WireType::Varint),
        }
    }

    /// Check if the type has no encoder or decoder.
    #[inline]
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Type::Group | Type::Sfixed32 | Type::Sfixed64 | Type::Sint32 | Type::Sint64
        )
    }

    /// Check if values of this type are stored inline by value.
    #[inline]
    pub fn is_scalar(self) -> bool {
        self.scalar_size().is_some()
    }

    /// Lowercase name, as used in schema JSON.
    pub fn name(self) -> &'static str {
        match self {
            Type::Double => "double",
            Type::Float => "float",
            Type::Int64 => "int64",
            Type::Uint64 => "uint64",
            Type::Int32 => "int32",
            Type::Fixed64 => "fixed64",
            Type::Fixed32 => "fixed32",
            Type::Bool => "bool",
            Type::String => "string",
            Type::Group => "group",
            Type::Message => "message",
            Type::Bytes => "bytes",
            Type::Uint32 => "uint32",
            Type::Enum => "enum",
            Type::Sfixed32 => "sfixed32",
            Type::Sfixed64 => "sfixed64",
            Type::Sint32 => "sint32",
            Type::Sint64 => "sint64",
        }
    }
}

/// Native width of a scalar type (standalone function).
#[inline]
pub fn scalar_type_size(ty: Type) -> Option<usize> {
    ty.scalar_size()
}

/// Wire type for a semantic type (standalone function).
#[inline]
pub fn wire_type_for(ty: Type) -> Option<WireType> {
    ty.wire_type()
}

/// Field cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Label {
    #[default]
    Optional = 1,
    Required = 2,
    Repeated = 3,
}

/// Index of a message descriptor inside its [`super::Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub u32);

impl DescriptorId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an enum descriptor inside its [`super::Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumId(pub u32);

impl EnumId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One field of a message type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: String,
    /// Wire field number.
    pub number: u32,
    /// Semantic type.
    pub ty: Type,
    /// Cardinality.
    pub label: Label,
    /// Nested message type, for message fields.
    pub message: Option<DescriptorId>,
    /// Enum type, for enum fields (informational).
    pub enum_type: Option<EnumId>,
    /// Byte offset of the slot inside the owning struct.
    pub offset: usize,
    /// Default value in little-endian form (scalars) or UTF-8 (strings).
    pub default_value: Option<Vec<u8>>,
    /// False for non-repeated submessages stored behind a pointer because
    /// the nested type (transitively) contains the owner.
    pub fully_defined: bool,
    /// Index into [`Descriptor::oneofs`] for oneof members.
    pub oneof_index: Option<u32>,
}

impl FieldDescriptor {
    /// Create a scalar field with no default at offset 0.
    pub fn new(name: &str, number: u32, ty: Type, label: Label) -> Self {
        Self {
            name: name.to_string(),
            number,
            ty,
            label,
            message: None,
            enum_type: None,
            offset: 0,
            default_value: None,
            fully_defined: true,
            oneof_index: None,
        }
    }

    #[inline]
    pub fn is_repeated(&self) -> bool {
        self.label == Label::Repeated
    }

    #[inline]
    pub fn is_required(&self) -> bool {
        self.label == Label::Required
    }

    /// Check if this is a non-repeated submessage stored behind a pointer.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.ty == Type::Message && !self.is_repeated() && !self.fully_defined
    }

    /// Check if the field's slot holds a RepeatedField header.
    #[inline]
    pub fn has_repeated_header(&self) -> bool {
        self.is_repeated() || self.ty == Type::Bytes
    }

    #[inline]
    pub fn is_oneof_member(&self) -> bool {
        self.oneof_index.is_some()
    }
}

/// A group of fields of which at most one is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneofDescriptor {
    pub name: String,
    /// Offset of the union slot every member shares.
    pub offset: usize,
    /// Size of the union slot: the widest member.
    pub size: usize,
    /// Offset of the u32 holding the set member's number, 0 when none.
    pub case_offset: usize,
}

/// One message type.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Position in the owning registry.
    pub id: DescriptorId,
    /// Type name.
    pub name: String,
    /// Stable 64-bit hash of `name`.
    pub name_hash: u64,
    pub major_version: u16,
    pub minor_version: u16,
    /// Native struct size in bytes.
    pub size: usize,
    /// Native struct alignment.
    pub align: usize,
    /// Fields in declaration order.
    pub fields: Vec<FieldDescriptor>,
    /// Oneof groups, referenced by [`FieldDescriptor::oneof_index`].
    pub oneofs: Vec<OneofDescriptor>,
}

impl Descriptor {
    /// Create an empty descriptor at the current version.
    pub fn new(id: DescriptorId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            name_hash: hash_name(name),
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            size: 0,
            align: 1,
            fields: Vec::new(),
            oneofs: Vec::new(),
        }
    }

    /// Find a field by wire number.
    pub fn find_field(&self, number: u32) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.number == number)
    }

    /// Find a field's position by wire number.
    pub fn find_field_index(&self, number: u32) -> Option<usize> {
        self.fields.iter().position(|f| f.number == number)
    }

    /// Find a field by name.
    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Oneof group a field belongs to.
    pub fn oneof_of(&self, field: &FieldDescriptor) -> Option<&OneofDescriptor> {
        field
            .oneof_index
            .and_then(|index| self.oneofs.get(index as usize))
    }

    /// Find a oneof group by name.
    pub fn oneof_by_name(&self, name: &str) -> Option<&OneofDescriptor> {
        self.oneofs.iter().find(|o| o.name == name)
    }
}

/// Name/value pair of an enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValueDescriptor {
    pub name: String,
    pub value: i32,
}

/// One enum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDescriptor {
    pub id: EnumId,
    pub name: String,
    pub name_hash: u64,
    pub major_version: u16,
    pub minor_version: u16,
    pub values: Vec<EnumValueDescriptor>,
}

impl EnumDescriptor {
    /// Create an enum descriptor from name/value pairs.
    pub fn new(id: EnumId, name: &str, values: &[(&str, i32)]) -> Self {
        Self {
            id,
            name: name.to_string(),
            name_hash: hash_name(name),
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            values: values
                .iter()
                .map(|&(name, value)| EnumValueDescriptor {
                    name: name.to_string(),
                    value,
                })
                .collect(),
        }
    }

    /// Name of the first enumerator with `value`.
    pub fn get_enum_name(&self, value: i32) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.value == value)
            .map(|v| v.name.as_str())
    }

    /// Value of the enumerator called `name`.
    pub fn get_enum_value(&self, name: &str) -> Option<i32> {
        self.values.iter().find(|v| v.name == name).map(|v| v.value)
    }
}

/// Stable 64-bit hash of a type name.
pub fn hash_name(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(scalar_type_size(Type::Bool), Some(1));
        assert_eq!(scalar_type_size(Type::Int32), Some(4));
        assert_eq!(scalar_type_size(Type::Enum), Some(4));
        assert_eq!(scalar_type_size(Type::Float), Some(4));
        assert_eq!(scalar_type_size(Type::Uint64), Some(8));
        assert_eq!(scalar_type_size(Type::Double), Some(8));
        assert_eq!(scalar_type_size(Type::String), None);
        assert_eq!(scalar_type_size(Type::Message), None);
    }

    #[test]
    fn test_wire_types() {
        assert_eq!(wire_type_for(Type::Int32), Some(WireType::Varint));
        assert_eq!(wire_type_for(Type::Bool), Some(WireType::Varint));
        assert_eq!(wire_type_for(Type::Float), Some(WireType::Fixed32));
        assert_eq!(wire_type_for(Type::Double), Some(WireType::Fixed64));
        assert_eq!(wire_type_for(Type::Bytes), Some(WireType::LengthDelimited));
        assert_eq!(wire_type_for(Type::Message), Some(WireType::LengthDelimited));
        assert_eq!(wire_type_for(Type::Group), None);
    }

    #[test]
    fn test_reserved_types() {
        assert!(Type::Group.is_reserved());
        assert!(Type::Sint32.is_reserved());
        assert!(Type::Sfixed64.is_reserved());
        assert!(!Type::Fixed32.is_reserved());
        assert!(!Type::Enum.is_reserved());
    }

    #[test]
    fn test_repeated_header_size() {
        assert_eq!(REPEATED_HEADER_SIZE % POINTER_SIZE, 0);
        assert!(REPEATED_HEADER_SIZE >= POINTER_SIZE + 4);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(REPEATED_HEADER_SIZE, 16);
    }

    #[test]
    fn test_find_field() {
        let mut desc = Descriptor::new(DescriptorId(0), "pair");
        desc.fields.push(FieldDescriptor::new("a", 1, Type::Int32, Label::Optional));
        desc.fields.push(FieldDescriptor::new("b", 7, Type::Int32, Label::Optional));

        assert_eq!(desc.find_field(7).unwrap().name, "b");
        assert_eq!(desc.find_field_index(1), Some(0));
        assert!(desc.find_field(2).is_none());
        assert_eq!(desc.field_by_name("a").unwrap().number, 1);
    }

    #[test]
    fn test_enum_lookup() {
        let e = EnumDescriptor::new(EnumId(0), "color", &[("RED", 0), ("GREEN", 1), ("ALIAS", 1)]);

        assert_eq!(e.get_enum_name(1), Some("GREEN"));
        assert_eq!(e.get_enum_value("ALIAS"), Some(1));
        assert_eq!(e.get_enum_name(9), None);
        assert_eq!(e.get_enum_value("BLUE"), None);
    }

    #[test]
    fn test_name_hash_stable() {
        assert_eq!(hash_name("scene"), hash_name("scene"));
        assert_ne!(hash_name("scene"), hash_name("scenes"));
    }

    #[test]
    fn test_type_serde_names() {
        let ty: Type = serde_json::from_str("\"uint32\"").unwrap();
        assert_eq!(ty, Type::Uint32);
        assert_eq!(ty.name(), "uint32");

        let label: Label = serde_json::from_str("\"repeated\"").unwrap();
        assert_eq!(label, Label::Repeated);
    }
}
