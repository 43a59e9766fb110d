//! Typed, bounds-checked views into a decoded arena.

use crate::arena::Addressing;
use crate::error::{DdfError, Result};
use crate::schema::{
    Descriptor, FieldDescriptor, OneofDescriptor, Registry, Type, POINTER_SIZE,
    REPEATED_COUNT_OFFSET,
};

/// Raw reads from an arena, resolving pointer slots to offsets.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferView<'a> {
    bytes: &'a [u8],
    base_address: usize,
    addressing: Addressing,
    root_size: usize,
    /// Nesting limit for walks over this arena.
    max_depth: usize,
}

impl<'a> BufferView<'a> {
    pub(crate) fn new(
        bytes: &'a [u8],
        base_address: usize,
        addressing: Addressing,
        root_size: usize,
        max_depth: usize,
    ) -> Self {
        Self {
            bytes,
            base_address,
            addressing,
            root_size,
            max_depth,
        }
    }

    #[inline]
    pub(crate) fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub(crate) fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| {
                DdfError::Internal(format!(
                    "Read of {} bytes at {} outside {} byte arena",
                    len,
                    offset,
                    self.bytes.len()
                ))
            })
    }

    pub(crate) fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.slice(offset, N)?);
        Ok(buf)
    }

    pub(crate) fn read_pointer(&self, slot: usize) -> Result<Option<usize>> {
        let raw = usize::from_ne_bytes(self.read_array::<POINTER_SIZE>(slot)?);
        self.addressing
            .locate(raw, self.base_address, self.root_size, self.bytes.len())
    }

    pub(crate) fn read_header(&self, slot: usize) -> Result<(Option<usize>, u32)> {
        let data = self.read_pointer(slot)?;
        let count = u32::from_ne_bytes(self.read_array::<4>(slot + REPEATED_COUNT_OFFSET)?);
        Ok((data, count))
    }

    /// Number of the member set in a oneof of the struct at `base`, 0 for
    /// none.
    pub(crate) fn read_oneof_case(&self, base: usize, oneof: &OneofDescriptor) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.read_array::<4>(base + oneof.case_offset)?))
    }

    /// NUL-terminated string a pointer slot refers to, `None` when null.
    pub(crate) fn read_string(&self, slot: usize) -> Result<Option<&'a [u8]>> {
        let Some(offset) = self.read_pointer(slot)? else {
            return Ok(None);
        };
        let tail = self.bytes.get(offset..).unwrap_or_default();
        let len = tail.iter().position(|&b| b == 0).ok_or_else(|| {
            DdfError::Internal(format!("Unterminated string at offset {}", offset))
        })?;
        Ok(Some(&tail[..len]))
    }

    /// Blob a RepeatedField header refers to.
    pub(crate) fn read_bytes(&self, slot: usize) -> Result<&'a [u8]> {
        match self.read_header(slot)? {
            (Some(offset), count) => self.slice(offset, count as usize),
            (None, _) => Ok(&[]),
        }
    }
}

mod private {
    pub trait Sealed {}
}

/// Scalar types readable from a field slot.
pub trait ScalarValue: Copy + private::Sealed {
    /// Native width in bytes.
    const SIZE: usize;

    /// Check if a field of type `ty` stores this Rust type.
    fn accepts(ty: Type) -> bool;

    /// Decode from `SIZE` native-order bytes.
    fn from_ne_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($t:ty, $size:expr, $types:pat) => {
        impl private::Sealed for $t {}

        impl ScalarValue for $t {
            const SIZE: usize = $size;

            #[inline]
            fn accepts(ty: Type) -> bool {
                matches!(ty, $types)
            }

            fn from_ne_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $size];
                buf.copy_from_slice(&bytes[..$size]);
                <$t>::from_ne_bytes(buf)
            }
        }
    };
}

impl_scalar!(i32, 4, Type::Int32 | Type::Enum | Type::Sint32 | Type::Sfixed32);
impl_scalar!(u32, 4, Type::Uint32 | Type::Fixed32);
impl_scalar!(i64, 8, Type::Int64 | Type::Sint64 | Type::Sfixed64);
impl_scalar!(u64, 8, Type::Uint64 | Type::Fixed64);
impl_scalar!(f32, 4, Type::Float);
impl_scalar!(f64, 8, Type::Double);

impl private::Sealed for bool {}

impl ScalarValue for bool {
    const SIZE: usize = 1;

    #[inline]
    fn accepts(ty: Type) -> bool {
        ty == Type::Bool
    }

    fn from_ne_slice(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

fn read_scalar<T: ScalarValue>(view: &BufferView<'_>, offset: usize) -> Result<T> {
    view.slice(offset, T::SIZE).map(T::from_ne_slice)
}

fn utf8<'a>(bytes: &'a [u8], field: &FieldDescriptor) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|_| {
        DdfError::Internal(format!("String field '{}' is not valid UTF-8", field.name))
    })
}

/// View of one message struct inside an arena.
#[derive(Debug, Clone, Copy)]
pub struct MessageRef<'a> {
    registry: &'a Registry,
    descriptor: &'a Descriptor,
    view: BufferView<'a>,
    offset: usize,
}

impl<'a> MessageRef<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        descriptor: &'a Descriptor,
        view: BufferView<'a>,
        offset: usize,
    ) -> Self {
        Self {
            registry,
            descriptor,
            view,
            offset,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &'a Descriptor {
        self.descriptor
    }

    #[inline]
    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// Arena offset of the struct.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub(crate) fn view(&self) -> BufferView<'a> {
        self.view
    }

    fn field(
        &self,
        name: &str,
        check: impl FnOnce(&FieldDescriptor) -> bool,
        reason: &'static str,
    ) -> Result<&'a FieldDescriptor> {
        let not_found = |reason| DdfError::FieldNotFound {
            message: self.descriptor.name.clone(),
            field: name.to_string(),
            reason,
        };
        let field = self
            .descriptor
            .field_by_name(name)
            .ok_or_else(|| not_found("no such field"))?;
        if !check(field) {
            return Err(not_found(reason));
        }
        if let Some(oneof) = self.descriptor.oneof_of(field) {
            if self.view.read_oneof_case(self.offset, oneof)? != field.number {
                return Err(not_found("oneof member not set"));
            }
        }
        Ok(field)
    }

    /// Member currently set in the oneof called `name`.
    pub fn which_oneof(&self, name: &str) -> Result<Option<&'a FieldDescriptor>> {
        let oneof = self.descriptor.oneof_by_name(name).ok_or_else(|| {
            DdfError::FieldNotFound {
                message: self.descriptor.name.clone(),
                field: name.to_string(),
                reason: "no such oneof",
            }
        })?;
        let case = self.view.read_oneof_case(self.offset, oneof)?;
        Ok(self
            .descriptor
            .fields
            .iter()
            .find(|f| f.number == case && self.descriptor.oneof_of(f) == Some(oneof)))
    }

    /// Read a non-repeated scalar field.
    pub fn get<T: ScalarValue>(&self, name: &str) -> Result<T> {
        let field = self.field(
            name,
            |f| !f.is_repeated() && T::accepts(f.ty),
            "not a singular field of the requested scalar type",
        )?;
        read_scalar(&self.view, self.offset + field.offset)
    }

    /// Read a non-repeated string field, `None` when the slot is null.
    ///
    /// Fails when the stored bytes are not UTF-8; use
    /// [`MessageRef::get_string_bytes`] to read them anyway.
    pub fn get_string(&self, name: &str) -> Result<Option<&'a str>> {
        let field = self.string_field(name)?;
        match self.view.read_string(self.offset + field.offset)? {
            Some(bytes) => utf8(bytes, field).map(Some),
            None => Ok(None),
        }
    }

    /// Raw bytes of a non-repeated string field, without the NUL.
    pub fn get_string_bytes(&self, name: &str) -> Result<Option<&'a [u8]>> {
        let field = self.string_field(name)?;
        self.view.read_string(self.offset + field.offset)
    }

    fn string_field(&self, name: &str) -> Result<&'a FieldDescriptor> {
        self.field(
            name,
            |f| !f.is_repeated() && f.ty == Type::String,
            "not a singular string field",
        )
    }

    /// Read a non-repeated bytes field.
    pub fn get_bytes(&self, name: &str) -> Result<&'a [u8]> {
        let field = self.field(
            name,
            |f| !f.is_repeated() && f.ty == Type::Bytes,
            "not a singular bytes field",
        )?;
        self.view.read_bytes(self.offset + field.offset)
    }

    /// Name of the enumerator stored in an enum field.
    pub fn get_enum_name(&self, name: &str) -> Result<Option<&'a str>> {
        let value = self.get::<i32>(name)?;
        let field = self.field(name, |f| f.ty == Type::Enum, "not an enum field")?;
        Ok(field
            .enum_type
            .and_then(|id| self.registry.enum_descriptor(id).get_enum_name(value)))
    }

    /// View a non-repeated submessage field.
    ///
    /// Inline submessages always exist; dynamic ones are `None` when unset.
    pub fn get_message(&self, name: &str) -> Result<Option<MessageRef<'a>>> {
        let field = self.field(
            name,
            |f| !f.is_repeated() && f.ty == Type::Message,
            "not a singular message field",
        )?;
        let nested = self.registry.nested(field)?;
        let slot = self.offset + field.offset;

        let target = if field.is_dynamic() {
            self.view.read_pointer(slot)?
        } else {
            Some(slot)
        };
        Ok(target.map(|offset| MessageRef::new(self.registry, nested, self.view, offset)))
    }

    /// View a repeated field.
    pub fn get_repeated(&self, name: &str) -> Result<RepeatedRef<'a>> {
        let field = self.field(name, |f| f.is_repeated(), "not a repeated field")?;
        let (data, count) = self.view.read_header(self.offset + field.offset)?;
        Ok(RepeatedRef {
            registry: self.registry,
            owner: self.descriptor,
            field,
            view: self.view,
            data,
            count: if data.is_some() { count } else { 0 },
            stride: self.registry.element_stride(field)?,
        })
    }
}

/// View of a repeated field's element array.
#[derive(Debug, Clone, Copy)]
pub struct RepeatedRef<'a> {
    registry: &'a Registry,
    owner: &'a Descriptor,
    field: &'a FieldDescriptor,
    view: BufferView<'a>,
    data: Option<usize>,
    count: u32,
    stride: usize,
}

impl<'a> RepeatedRef<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn field(&self) -> &'a FieldDescriptor {
        self.field
    }

    /// Arena offset of the first element, `None` for an unset field.
    #[inline]
    pub fn data_offset(&self) -> Option<usize> {
        self.data
    }

    fn element(&self, index: usize, ok: bool) -> Result<usize> {
        if !ok {
            return Err(DdfError::FieldNotFound {
                message: self.owner.name.clone(),
                field: self.field.name.clone(),
                reason: "element type does not match field type",
            });
        }
        match self.data {
            Some(data) if index < self.len() => Ok(data + index * self.stride),
            _ => Err(DdfError::Internal(format!(
                "Index {} out of range for '{}' with {} elements",
                index,
                self.field.name,
                self.len()
            ))),
        }
    }

    /// Read a scalar element.
    pub fn get<T: ScalarValue>(&self, index: usize) -> Result<T> {
        let offset = self.element(index, T::accepts(self.field.ty))?;
        read_scalar(&self.view, offset)
    }

    /// Read a string element, `None` when null.
    pub fn string(&self, index: usize) -> Result<Option<&'a str>> {
        match self.string_bytes(index)? {
            Some(bytes) => utf8(bytes, self.field).map(Some),
            None => Ok(None),
        }
    }

    /// Raw bytes of a string element, without the NUL.
    pub fn string_bytes(&self, index: usize) -> Result<Option<&'a [u8]>> {
        let offset = self.element(index, self.field.ty == Type::String)?;
        self.view.read_string(offset)
    }

    /// Read a bytes element.
    pub fn bytes(&self, index: usize) -> Result<&'a [u8]> {
        let offset = self.element(index, self.field.ty == Type::Bytes)?;
        self.view.read_bytes(offset)
    }

    /// View a message element.
    pub fn message(&self, index: usize) -> Result<MessageRef<'a>> {
        let offset = self.element(index, self.field.ty == Type::Message)?;
        let nested = self.registry.nested(self.field)?;
        Ok(MessageRef::new(self.registry, nested, self.view, offset))
    }

    /// Collect every scalar element.
    pub fn to_vec<T: ScalarValue>(&self) -> Result<Vec<T>> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}
