//! Schema specs and native layout computation.
//!
//! A [`SchemaSpec`] lists message and enum types by name. [`SchemaSpec::build`]
//! turns it into a [`Registry`], computing the C-compatible struct layout of
//! every message along the way:
//! - scalars use their natural width and alignment
//! - strings and dynamic submessages occupy a pointer slot
//! - repeated and bytes fields occupy a RepeatedField header
//! - other submessages are embedded inline
//!
//! A non-repeated submessage field whose type can reach the owning type
//! through non-repeated submessage fields is not fully defined and gets a
//! pointer slot instead of an inline struct.
//!
//! Consecutive fields naming the same oneof share one union slot, sized
//! and aligned for the widest member, followed by a u32 case slot.
//!
//! # Example
//!
//! ```
//! use ddf::schema::{FieldSpec, MessageSpec, SchemaSpec, Type};
//!
//! let registry = SchemaSpec::new()
//!     .message(
//!         MessageSpec::new("item")
//!             .field(FieldSpec::required("id", 1, Type::Uint32))
//!             .field(FieldSpec::optional("name", 2, Type::String).default_value("unnamed")),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert!(registry.get_descriptor("item").is_some());
//! ```

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::descriptor::{
    Descriptor, DescriptorId, EnumDescriptor, EnumId, FieldDescriptor, Label, OneofDescriptor,
    Type, ARENA_ALIGNMENT, ONEOF_CASE_SIZE, POINTER_SIZE, REPEATED_HEADER_SIZE,
};
use super::registry::Registry;
use crate::error::{DdfError, Result};

/// Default value of a field, as written in a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultSpec {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    /// String contents, or an enumerator name for enum fields.
    Str(String),
}

impl From<bool> for DefaultSpec {
    fn from(v: bool) -> Self {
        DefaultSpec::Bool(v)
    }
}

impl From<i32> for DefaultSpec {
    fn from(v: i32) -> Self {
        DefaultSpec::Int(i64::from(v))
    }
}

impl From<i64> for DefaultSpec {
    fn from(v: i64) -> Self {
        DefaultSpec::Int(v)
    }
}

impl From<u32> for DefaultSpec {
    fn from(v: u32) -> Self {
        DefaultSpec::Uint(u64::from(v))
    }
}

impl From<u64> for DefaultSpec {
    fn from(v: u64) -> Self {
        DefaultSpec::Uint(v)
    }
}

impl From<f32> for DefaultSpec {
    fn from(v: f32) -> Self {
        DefaultSpec::Float(f64::from(v))
    }
}

impl From<f64> for DefaultSpec {
    fn from(v: f64) -> Self {
        DefaultSpec::Float(v)
    }
}

impl From<&str> for DefaultSpec {
    fn from(v: &str) -> Self {
        DefaultSpec::Str(v.to_string())
    }
}

/// One field of a message spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub number: u32,
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default)]
    pub label: Label,
    /// Message or enum type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultSpec>,
    /// Align the slot to 16 bytes.
    #[serde(default)]
    pub align: bool,
    /// Name of the oneof group the field belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oneof: Option<String>,
}

impl FieldSpec {
    /// Create a field spec.
    pub fn new(name: &str, number: u32, ty: Type, label: Label) -> Self {
        Self {
            name: name.to_string(),
            number,
            ty,
            label,
            type_name: None,
            default: None,
            align: false,
            oneof: None,
        }
    }

    pub fn optional(name: &str, number: u32, ty: Type) -> Self {
        Self::new(name, number, ty, Label::Optional)
    }

    pub fn required(name: &str, number: u32, ty: Type) -> Self {
        Self::new(name, number, ty, Label::Required)
    }

    pub fn repeated(name: &str, number: u32, ty: Type) -> Self {
        Self::new(name, number, ty, Label::Repeated)
    }

    /// Set the message or enum type name.
    pub fn type_name(mut self, name: &str) -> Self {
        self.type_name = Some(name.to_string());
        self
    }

    /// Set the default value.
    pub fn default_value(mut self, value: impl Into<DefaultSpec>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Align the slot to 16 bytes.
    pub fn aligned(mut self) -> Self {
        self.align = true;
        self
    }

    /// Make the field a member of a oneof group.
    pub fn oneof(mut self, name: &str) -> Self {
        self.oneof = Some(name.to_string());
        self
    }
}

/// One message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSpec {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Align the whole struct to 16 bytes.
    #[serde(default)]
    pub align: bool,
}

impl MessageSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            align: false,
        }
    }

    /// Append a field.
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Align the whole struct to 16 bytes.
    pub fn aligned(mut self) -> Self {
        self.align = true;
        self
    }
}

/// Enumerator of an enum spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValueSpec {
    pub name: String,
    pub value: i32,
}

/// One enum type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumSpec {
    pub name: String,
    #[serde(default)]
    pub values: Vec<EnumValueSpec>,
}

impl EnumSpec {
    pub fn new(name: &str, values: &[(&str, i32)]) -> Self {
        Self {
            name: name.to_string(),
            values: values
                .iter()
                .map(|&(name, value)| EnumValueSpec {
                    name: name.to_string(),
                    value,
                })
                .collect(),
        }
    }
}

/// A whole schema: message and enum types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSpec {
    #[serde(default)]
    pub messages: Vec<MessageSpec>,
    #[serde(default)]
    pub enums: Vec<EnumSpec>,
}

impl SchemaSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message type.
    pub fn message(mut self, message: MessageSpec) -> Self {
        self.messages.push(message);
        self
    }

    /// Add an enum type.
    pub fn enumeration(mut self, spec: EnumSpec) -> Self {
        self.enums.push(spec);
        self
    }

    /// Parse a schema from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the schema to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Compute layouts and build the registry.
    pub fn build(&self) -> Result<Registry> {
        LayoutBuilder::new(self)?.build()
    }
}

/// Size and alignment of a struct or slot.
#[derive(Debug, Clone, Copy)]
struct Layout {
    size: usize,
    align: usize,
}

/// Slot offsets and oneof groups of one message.
struct Placement {
    offsets: Vec<usize>,
    oneof_index: Vec<Option<u32>>,
    oneofs: Vec<OneofDescriptor>,
    layout: Layout,
}

#[derive(Clone, Copy)]
enum LayoutState {
    Pending,
    InProgress,
    Done(Layout),
}

struct LayoutBuilder<'s> {
    spec: &'s SchemaSpec,
    message_ids: FxHashMap<&'s str, DescriptorId>,
    enum_ids: FxHashMap<&'s str, EnumId>,
    /// Per message, per field: nested message id.
    nested: Vec<Vec<Option<DescriptorId>>>,
    /// Per message, per field: stored behind a pointer.
    dynamic: Vec<Vec<bool>>,
    layouts: Vec<LayoutState>,
}

impl<'s> LayoutBuilder<'s> {
    fn new(spec: &'s SchemaSpec) -> Result<Self> {
        let mut message_ids = FxHashMap::default();
        for (i, message) in spec.messages.iter().enumerate() {
            if message_ids
                .insert(message.name.as_str(), DescriptorId(i as u32))
                .is_some()
            {
                return Err(DdfError::Schema(format!(
                    "Duplicate message type '{}'",
                    message.name
                )));
            }
        }

        let mut enum_ids = FxHashMap::default();
        for (i, e) in spec.enums.iter().enumerate() {
            if enum_ids.insert(e.name.as_str(), EnumId(i as u32)).is_some() {
                return Err(DdfError::Schema(format!("Duplicate enum type '{}'", e.name)));
            }
        }

        let mut nested = Vec::with_capacity(spec.messages.len());
        for message in &spec.messages {
            let mut ids = Vec::with_capacity(message.fields.len());
            for field in &message.fields {
                if field.ty != Type::Message {
                    ids.push(None);
                    continue;
                }
                let id = field
                    .type_name
                    .as_deref()
                    .and_then(|name| message_ids.get(name).copied())
                    .ok_or_else(|| {
                        DdfError::Schema(format!(
                            "{}.{}: unknown message type {:?}",
                            message.name, field.name, field.type_name
                        ))
                    })?;
                ids.push(Some(id));
            }
            nested.push(ids);
        }

        let mut builder = Self {
            spec,
            message_ids,
            enum_ids,
            nested,
            dynamic: Vec::new(),
            layouts: vec![LayoutState::Pending; spec.messages.len()],
        };
        builder.dynamic = builder.find_dynamic_fields();
        Ok(builder)
    }

    /// Mark non-repeated submessage fields that lie on a cycle.
    fn find_dynamic_fields(&self) -> Vec<Vec<bool>> {
        self.spec
            .messages
            .iter()
            .enumerate()
            .map(|(owner, message)| {
                message
                    .fields
                    .iter()
                    .zip(&self.nested[owner])
                    .map(|(field, nested)| match nested {
                        Some(id) if field.label != Label::Repeated => {
                            self.reaches(*id, DescriptorId(owner as u32))
                        }
                        _ => false,
                    })
                    .collect()
            })
            .collect()
    }

    /// Check if `to` is reachable from `from` via non-repeated submessages.
    fn reaches(&self, from: DescriptorId, to: DescriptorId) -> bool {
        let mut visited = vec![false; self.spec.messages.len()];
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if std::mem::replace(&mut visited[id.index()], true) {
                continue;
            }
            let fields = &self.spec.messages[id.index()].fields;
            for (field, nested) in fields.iter().zip(&self.nested[id.index()]) {
                match nested {
                    Some(nested) if field.label != Label::Repeated => stack.push(*nested),
                    _ => {}
                }
            }
        }
        false
    }

    fn slot_layout(&mut self, owner: usize, index: usize) -> Result<Layout> {
        let spec = self.spec;
        let message = &spec.messages[owner];
        let field = &message.fields[index];

        let mut layout = if field.label == Label::Repeated || field.ty == Type::Bytes {
            Layout {
                size: REPEATED_HEADER_SIZE,
                align: POINTER_SIZE,
            }
        } else {
            match field.ty {
                Type::String => Layout {
                    size: POINTER_SIZE,
                    align: POINTER_SIZE,
                },
                Type::Message if self.dynamic[owner][index] => Layout {
                    size: POINTER_SIZE,
                    align: POINTER_SIZE,
                },
                Type::Message => match self.nested[owner][index] {
                    Some(id) => self.message_layout(id)?,
                    None => return Err(DdfError::Internal("unresolved message field".into())),
                },
                Type::Group => {
                    return Err(DdfError::Schema(format!(
                        "{}.{}: group fields are not supported",
                        message.name, field.name
                    )))
                }
                ty => {
                    let size = ty.scalar_size().unwrap_or(1);
                    Layout { size, align: size }
                }
            }
        };

        if field.align {
            layout.align = layout.align.max(ARENA_ALIGNMENT);
        }
        Ok(layout)
    }

    fn message_layout(&mut self, id: DescriptorId) -> Result<Layout> {
        match self.layouts[id.index()] {
            LayoutState::Done(layout) => return Ok(layout),
            LayoutState::InProgress => {
                return Err(DdfError::Schema(format!(
                    "Message '{}' embeds itself inline",
                    self.spec.messages[id.index()].name
                )))
            }
            LayoutState::Pending => {}
        }
        self.layouts[id.index()] = LayoutState::InProgress;

        let layout = self.place_fields(id.index())?.layout;
        self.layouts[id.index()] = LayoutState::Done(layout);
        Ok(layout)
    }

    fn place_fields(&mut self, owner: usize) -> Result<Placement> {
        let spec = self.spec;
        let message = &spec.messages[owner];
        let count = message.fields.len();
        let mut offsets = vec![0; count];
        let mut oneof_index = vec![None; count];
        let mut oneofs: Vec<OneofDescriptor> = Vec::new();
        let mut cursor = 0;
        let mut align = 1;

        let mut index = 0;
        while index < count {
            let Some(group) = message.fields[index].oneof.as_deref() else {
                let slot = self.slot_layout(owner, index)?;
                offsets[index] = align_up(cursor, slot.align);
                cursor = offsets[index] + slot.size;
                align = align.max(slot.align);
                index += 1;
                continue;
            };
            if oneofs.iter().any(|o| o.name == group) {
                return Err(DdfError::Schema(format!(
                    "{}: members of oneof '{}' must be declared together",
                    message.name, group
                )));
            }

            let start = index;
            let mut union = Layout { size: 0, align: 1 };
            while index < count && message.fields[index].oneof.as_deref() == Some(group) {
                let field = &message.fields[index];
                if field.label != Label::Optional {
                    return Err(DdfError::Schema(format!(
                        "{}.{}: oneof members must be optional",
                        message.name, field.name
                    )));
                }
                if field.default.is_some() {
                    return Err(DdfError::Schema(format!(
                        "{}.{}: oneof members cannot have a default",
                        message.name, field.name
                    )));
                }
                let slot = self.slot_layout(owner, index)?;
                union.size = union.size.max(slot.size);
                union.align = union.align.max(slot.align);
                index += 1;
            }

            let offset = align_up(cursor, union.align);
            let case_offset = align_up(offset + union.size, ONEOF_CASE_SIZE);
            cursor = case_offset + ONEOF_CASE_SIZE;
            align = align.max(union.align).max(ONEOF_CASE_SIZE);

            offsets[start..index].fill(offset);
            oneof_index[start..index].fill(Some(oneofs.len() as u32));
            oneofs.push(OneofDescriptor {
                name: group.to_string(),
                offset,
                size: union.size,
                case_offset,
            });
        }
        if message.align {
            align = align.max(ARENA_ALIGNMENT);
        }

        Ok(Placement {
            offsets,
            oneof_index,
            oneofs,
            layout: Layout {
                size: align_up(cursor, align),
                align,
            },
        })
    }

    fn build(mut self) -> Result<Registry> {
        let schema = self.spec;
        let mut descriptors = Vec::with_capacity(schema.messages.len());

        for (owner, message) in schema.messages.iter().enumerate() {
            let id = DescriptorId(owner as u32);
            self.message_layout(id)?;
            let placement = self.place_fields(owner)?;

            let mut desc = Descriptor::new(id, &message.name);
            desc.size = placement.layout.size;
            desc.align = placement.layout.align;
            desc.oneofs = placement.oneofs;

            for (index, spec) in message.fields.iter().enumerate() {
                let enum_type = match (spec.ty, spec.type_name.as_deref()) {
                    (Type::Enum, Some(name)) => Some(
                        self.enum_ids
                            .get(name)
                            .copied()
                            .ok_or_else(|| {
                                DdfError::Schema(format!(
                                    "{}.{}: unknown enum type '{}'",
                                    message.name, spec.name, name
                                ))
                            })?,
                    ),
                    _ => None,
                };

                let mut field = FieldDescriptor::new(&spec.name, spec.number, spec.ty, spec.label);
                field.offset = placement.offsets[index];
                field.oneof_index = placement.oneof_index[index];
                field.message = self.nested[owner][index];
                field.enum_type = enum_type;
                field.fully_defined = !self.dynamic[owner][index];
                field.default_value = match &spec.default {
                    Some(value) => Some(self.encode_default(message, spec, enum_type, value)?),
                    None => None,
                };
                desc.fields.push(field);
            }
            descriptors.push(desc);
        }

        let enums = schema
            .enums
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let values: Vec<(&str, i32)> =
                    e.values.iter().map(|v| (v.name.as_str(), v.value)).collect();
                EnumDescriptor::new(EnumId(i as u32), &e.name, &values)
            })
            .collect();

        debug_assert_eq!(self.message_ids.len(), descriptors.len());
        Registry::new(descriptors, enums)
    }

    /// Convert a default to the little-endian raw form stored in the
    /// descriptor.
    fn encode_default(
        &self,
        message: &MessageSpec,
        field: &FieldSpec,
        enum_type: Option<EnumId>,
        value: &DefaultSpec,
    ) -> Result<Vec<u8>> {
        let invalid = || {
            DdfError::Schema(format!(
                "{}.{}: default {:?} does not fit type {}",
                message.name,
                field.name,
                value,
                field.ty.name()
            ))
        };

        if field.label == Label::Repeated {
            return Err(DdfError::Schema(format!(
                "{}.{}: repeated fields cannot have a default",
                message.name, field.name
            )));
        }

        let as_i64 = || match *value {
            DefaultSpec::Int(v) => Some(v),
            DefaultSpec::Uint(v) => i64::try_from(v).ok(),
            DefaultSpec::Bool(v) => Some(i64::from(v)),
            _ => None,
        };
        let as_u64 = || match *value {
            DefaultSpec::Int(v) => u64::try_from(v).ok(),
            DefaultSpec::Uint(v) => Some(v),
            DefaultSpec::Bool(v) => Some(u64::from(v)),
            _ => None,
        };
        let as_f64 = || match *value {
            DefaultSpec::Int(v) => Some(v as f64),
            DefaultSpec::Uint(v) => Some(v as f64),
            DefaultSpec::Float(v) => Some(v),
            _ => None,
        };

        let bytes = match field.ty {
            Type::Bool => match *value {
                DefaultSpec::Bool(v) => vec![u8::from(v)],
                _ => vec![u8::from(as_i64().ok_or_else(invalid)? != 0)],
            },
            Type::Int32 | Type::Sint32 | Type::Sfixed32 => {
                let v = i32::try_from(as_i64().ok_or_else(invalid)?).map_err(|_| invalid())?;
                v.to_le_bytes().to_vec()
            }
            Type::Enum => {
                let v = match (value, enum_type) {
                    (DefaultSpec::Str(name), Some(id)) => self.spec.enums[id.index()]
                        .values
                        .iter()
                        .find(|v| &v.name == name)
                        .map(|v| v.value)
                        .ok_or_else(invalid)?,
                    _ => i32::try_from(as_i64().ok_or_else(invalid)?).map_err(|_| invalid())?,
                };
                v.to_le_bytes().to_vec()
            }
            Type::Uint32 | Type::Fixed32 => {
                let v = u32::try_from(as_u64().ok_or_else(invalid)?).map_err(|_| invalid())?;
                v.to_le_bytes().to_vec()
            }
            Type::Int64 | Type::Sint64 | Type::Sfixed64 => {
                as_i64().ok_or_else(invalid)?.to_le_bytes().to_vec()
            }
            Type::Uint64 | Type::Fixed64 => as_u64().ok_or_else(invalid)?.to_le_bytes().to_vec(),
            Type::Float => (as_f64().ok_or_else(invalid)? as f32)
                .to_bits()
                .to_le_bytes()
                .to_vec(),
            Type::Double => as_f64().ok_or_else(invalid)?.to_bits().to_le_bytes().to_vec(),
            Type::String => match value {
                DefaultSpec::Str(s) => s.as_bytes().to_vec(),
                _ => return Err(invalid()),
            },
            Type::Bytes | Type::Message | Type::Group => return Err(invalid()),
        };
        Ok(bytes)
    }
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
