//! Descriptor registry.
//!
//! The registry owns every message and enum descriptor of a schema and
//! resolves nested type references by id. Types can be looked up by name
//! or by the 64-bit hash of their name.
//!
//! # Example
//!
//! ```
//! use ddf::schema::Registry;
//!
//! let registry = Registry::from_json(r#"{
//!     "messages": [
//!         { "name": "point", "fields": [
//!             { "name": "x", "number": 1, "type": "float" },
//!             { "name": "y", "number": 2, "type": "float" }
//!         ]}
//!     ]
//! }"#).unwrap();
//!
//! let point = registry.get_descriptor("point").unwrap();
//! assert_eq!(point.size, 8);
//! assert_eq!(registry.get_descriptor_by_hash(point.name_hash).unwrap().name, "point");
//! ```

use rustc_hash::FxHashMap;

use super::builder::SchemaSpec;
use super::descriptor::{
    Descriptor, DescriptorId, EnumDescriptor, EnumId, FieldDescriptor, Type, ONEOF_CASE_SIZE,
    POINTER_SIZE, REPEATED_HEADER_SIZE,
};
use crate::error::{DdfError, Result};
use crate::wire::MAX_FIELD_NUMBER;

/// Registry of message and enum descriptors.
#[derive(Debug, Clone)]
pub struct Registry {
    /// Message descriptors, indexed by id.
    descriptors: Vec<Descriptor>,
    /// Enum descriptors, indexed by id.
    enums: Vec<EnumDescriptor>,
    /// Message ids by name.
    by_name: FxHashMap<String, DescriptorId>,
    /// Message ids by name hash.
    by_hash: FxHashMap<u64, DescriptorId>,
    /// Enum ids by name.
    enums_by_name: FxHashMap<String, EnumId>,
    /// Whether a message transitively contains a dynamic submessage field.
    has_dynamic: Vec<bool>,
}

impl Registry {
    /// Build a registry from descriptor tables.
    ///
    /// The tables are validated: ids must match positions, names and field
    /// numbers must be unique, nested ids must resolve, every slot must lie
    /// inside its struct, oneof members must sit in their group's union
    /// slot, and inline submessages must not form a cycle.
    pub fn new(descriptors: Vec<Descriptor>, enums: Vec<EnumDescriptor>) -> Result<Self> {
        let mut registry = Self {
            descriptors,
            enums,
            by_name: FxHashMap::default(),
            by_hash: FxHashMap::default(),
            enums_by_name: FxHashMap::default(),
            has_dynamic: Vec::new(),
        };

        for (index, desc) in registry.descriptors.iter().enumerate() {
            if desc.id.index() != index {
                return Err(DdfError::Schema(format!(
                    "Descriptor '{}' has id {} but sits at position {}",
                    desc.name, desc.id.0, index
                )));
            }
            if registry.by_name.insert(desc.name.clone(), desc.id).is_some() {
                return Err(DdfError::Schema(format!(
                    "Duplicate message type '{}'",
                    desc.name
                )));
            }
            registry.by_hash.insert(desc.name_hash, desc.id);
        }

        for (index, e) in registry.enums.iter().enumerate() {
            if e.id.index() != index {
                return Err(DdfError::Schema(format!(
                    "Enum '{}' has id {} but sits at position {}",
                    e.name, e.id.0, index
                )));
            }
            if registry.enums_by_name.insert(e.name.clone(), e.id).is_some() {
                return Err(DdfError::Schema(format!("Duplicate enum type '{}'", e.name)));
            }
        }

        for desc in &registry.descriptors {
            registry.validate_descriptor(desc)?;
        }
        registry.check_inline_cycles()?;

        registry.has_dynamic = (0..registry.descriptors.len())
            .map(|i| registry.compute_has_dynamic(DescriptorId(i as u32)))
            .collect();

        tracing::debug!(
            "Registered {} message types and {} enum types",
            registry.descriptors.len(),
            registry.enums.len()
        );

        Ok(registry)
    }

    /// Build a registry from a JSON schema description.
    pub fn from_json(json: &str) -> Result<Self> {
        SchemaSpec::from_json(json)?.build()
    }

    /// Get a descriptor by id.
    ///
    /// # Panics
    ///
    /// Panics if the id does not belong to this registry.
    #[inline]
    pub fn descriptor(&self, id: DescriptorId) -> &Descriptor {
        &self.descriptors[id.index()]
    }

    /// Get a descriptor by id, `None` if out of range.
    pub fn get(&self, id: DescriptorId) -> Option<&Descriptor> {
        self.descriptors.get(id.index())
    }

    /// Check if `desc` is one of this registry's own descriptors.
    pub fn owns(&self, desc: &Descriptor) -> bool {
        self.get(desc.id).is_some_and(|own| std::ptr::eq(own, desc))
    }

    /// Get a descriptor by type name.
    pub fn get_descriptor(&self, name: &str) -> Option<&Descriptor> {
        self.by_name.get(name).map(|&id| self.descriptor(id))
    }

    /// Get a descriptor by name hash.
    pub fn get_descriptor_by_hash(&self, hash: u64) -> Option<&Descriptor> {
        self.by_hash.get(&hash).map(|&id| self.descriptor(id))
    }

    /// Get an enum descriptor by id.
    #[inline]
    pub fn enum_descriptor(&self, id: EnumId) -> &EnumDescriptor {
        &self.enums[id.index()]
    }

    /// Get an enum descriptor by type name.
    pub fn get_enum(&self, name: &str) -> Option<&EnumDescriptor> {
        self.enums_by_name.get(name).map(|&id| self.enum_descriptor(id))
    }

    /// Iterate over all message descriptors.
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter()
    }

    /// Number of message types.
    #[inline]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if the registry holds no message types.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Nested message descriptor of a message field.
    pub fn nested(&self, field: &FieldDescriptor) -> Result<&Descriptor> {
        field
            .message
            .and_then(|id| self.descriptors.get(id.index()))
            .ok_or_else(|| {
                DdfError::Internal(format!("Field '{}' has no message type", field.name))
            })
    }

    /// Check if a message's type graph contains a dynamic submessage field.
    #[inline]
    pub fn has_dynamic_fields(&self, desc: &Descriptor) -> bool {
        self.has_dynamic.get(desc.id.index()).copied().unwrap_or(false)
    }

    /// Width of one element of a field when stored in an array.
    ///
    /// Message elements use the nested struct size, strings a pointer,
    /// bytes a RepeatedField header, scalars their natural width.
    pub fn element_stride(&self, field: &FieldDescriptor) -> Result<usize> {
        match field.ty {
            Type::Message => Ok(self.nested(field)?.size),
            Type::String => Ok(POINTER_SIZE),
            Type::Bytes => Ok(REPEATED_HEADER_SIZE),
            ty => ty.scalar_size().ok_or_else(|| {
                DdfError::Internal(format!("Type {} has no element width", ty.name()))
            }),
        }
    }

    /// Width of a field's slot inside its struct.
    pub fn slot_size(&self, field: &FieldDescriptor) -> Result<usize> {
        if field.has_repeated_header() {
            return Ok(REPEATED_HEADER_SIZE);
        }
        match field.ty {
            Type::String => Ok(POINTER_SIZE),
            Type::Message if field.is_dynamic() => Ok(POINTER_SIZE),
            Type::Message => Ok(self.nested(field)?.size),
            ty => ty.scalar_size().ok_or_else(|| {
                DdfError::Internal(format!("Type {} has no slot width", ty.name()))
            }),
        }
    }

    fn validate_descriptor(&self, desc: &Descriptor) -> Result<()> {
        let schema_err = |msg: String| DdfError::Schema(format!("{}: {}", desc.name, msg));

        for (i, field) in desc.fields.iter().enumerate() {
            if field.number == 0 || field.number > MAX_FIELD_NUMBER {
                return Err(schema_err(format!(
                    "field '{}' has invalid number {}",
                    field.name, field.number
                )));
            }
            if desc.fields[..i].iter().any(|f| f.number == field.number) {
                return Err(schema_err(format!(
                    "field number {} used more than once",
                    field.number
                )));
            }
            if field.ty == Type::Message
                && field
                    .message
                    .map_or(true, |id| id.index() >= self.descriptors.len())
            {
                return Err(schema_err(format!(
                    "message field '{}' references no known type",
                    field.name
                )));
            }
            if let Some(id) = field.enum_type {
                if id.index() >= self.enums.len() {
                    return Err(schema_err(format!(
                        "enum field '{}' references no known type",
                        field.name
                    )));
                }
            }
            if field.ty == Type::Group {
                // Groups have no layout, the field can never be populated
                continue;
            }
            let end = field.offset + self.slot_size(field)?;
            if end > desc.size {
                return Err(schema_err(format!(
                    "field '{}' ends at {} past struct size {}",
                    field.name, end, desc.size
                )));
            }
            if let Some(index) = field.oneof_index {
                let Some(oneof) = desc.oneofs.get(index as usize) else {
                    return Err(schema_err(format!(
                        "field '{}' references unknown oneof {}",
                        field.name, index
                    )));
                };
                if field.is_repeated() || field.is_required() {
                    return Err(schema_err(format!(
                        "oneof member '{}' must be optional",
                        field.name
                    )));
                }
                if field.offset != oneof.offset || end > oneof.offset + oneof.size {
                    return Err(schema_err(format!(
                        "oneof member '{}' lies outside the slot of '{}'",
                        field.name, oneof.name
                    )));
                }
            }
        }

        for oneof in &desc.oneofs {
            if oneof.case_offset % ONEOF_CASE_SIZE != 0
                || oneof.case_offset + ONEOF_CASE_SIZE > desc.size
            {
                return Err(schema_err(format!(
                    "oneof '{}' has case slot at {} outside struct size {}",
                    oneof.name, oneof.case_offset, desc.size
                )));
            }
        }
        Ok(())
    }

    /// Reject inline submessages that would embed a struct inside itself.
    fn check_inline_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(registry: &Registry, id: DescriptorId, marks: &mut [Mark]) -> Result<()> {
            match marks[id.index()] {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    return Err(DdfError::Schema(format!(
                        "Message '{}' embeds itself inline",
                        registry.descriptor(id).name
                    )))
                }
                Mark::New => {}
            }
            marks[id.index()] = Mark::Active;
            for field in &registry.descriptor(id).fields {
                if field.ty == Type::Message && !field.is_repeated() && field.fully_defined {
                    if let Some(nested) = field.message {
                        visit(registry, nested, marks)?;
                    }
                }
            }
            marks[id.index()] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.descriptors.len()];
        for i in 0..self.descriptors.len() {
            visit(self, DescriptorId(i as u32), &mut marks)?;
        }
        Ok(())
    }

    fn compute_has_dynamic(&self, root: DescriptorId) -> bool {
        let mut visited = vec![false; self.descriptors.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut visited[id.index()], true) {
                continue;
            }
            for field in &self.descriptor(id).fields {
                if field.is_dynamic() {
                    return true;
                }
                if let Some(nested) = field.message {
                    stack.push(nested);
                }
            }
        }
        false
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            descriptors: Vec::new(),
            enums: Vec::new(),
            by_name: FxHashMap::default(),
            by_hash: FxHashMap::default(),
            enums_by_name: FxHashMap::default(),
            has_dynamic: Vec::new(),
        }
    }
}
