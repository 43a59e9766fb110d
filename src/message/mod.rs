//! Message module - decoded message trees.
//!
//! A [`Message`] owns the arena a tree was decoded into. Fields are read
//! through [`MessageRef`] and [`RepeatedRef`] views, which check every
//! access against the descriptor and the arena bounds.
//!
//! # Example
//!
//! ```
//! use ddf::schema::{FieldSpec, MessageSpec, SchemaSpec, Type};
//! use ddf::{load_message, LoadOptions};
//!
//! let registry = SchemaSpec::new()
//!     .message(
//!         MessageSpec::new("player")
//!             .field(FieldSpec::optional("name", 1, Type::String))
//!             .field(FieldSpec::repeated("scores", 2, Type::Float)),
//!     )
//!     .build()?;
//! let desc = registry.get_descriptor("player").unwrap();
//!
//! // name: "ann", scores: [1.5, 2.0]
//! let bytes = [
//!     0x0A, 0x03, b'a', b'n', b'n',
//!     0x15, 0x00, 0x00, 0xC0, 0x3F,
//!     0x15, 0x00, 0x00, 0x00, 0x40,
//! ];
//! let message = load_message(&registry, desc, &bytes, LoadOptions::default())?;
//! let root = message.root();
//!
//! assert_eq!(root.get_string("name")?, Some("ann"));
//! assert_eq!(root.get_repeated("scores")?.to_vec::<f32>()?, vec![1.5, 2.0]);
//! # Ok::<(), ddf::DdfError>(())
//! ```

mod view;

pub use view::{MessageRef, RepeatedRef, ScalarValue};

pub(crate) use view::BufferView;

use bytes::BytesMut;

use crate::arena::{Addressing, AlignedBuffer};
use crate::error::{DdfError, Result};
use crate::load::{load_message, LoadOptions, DEFAULT_MAX_DEPTH};
use crate::pointers;
use crate::save::save_message;
use crate::schema::{Descriptor, Registry};

/// A decoded message tree and the arena holding it.
pub struct Message<'r> {
    registry: &'r Registry,
    descriptor: &'r Descriptor,
    storage: AlignedBuffer,
    addressing: Addressing,
    /// Nesting limit the tree was loaded with, applied again on save,
    /// copy and pointer fix-ups.
    max_depth: usize,
}

impl<'r> Message<'r> {
    pub(crate) fn from_parts(
        registry: &'r Registry,
        descriptor: &'r Descriptor,
        storage: AlignedBuffer,
        addressing: Addressing,
        max_depth: usize,
    ) -> Self {
        Self {
            registry,
            descriptor,
            storage,
            addressing,
            max_depth,
        }
    }

    /// Rebuild a message from an arena image stored with relative
    /// addressing, e.g. one written out with [`Message::as_bytes`].
    ///
    /// The image is copied into fresh aligned storage. Pointers are
    /// checked lazily, on access. Walks over the tree use
    /// [`DEFAULT_MAX_DEPTH`] until changed with [`Message::with_max_depth`].
    pub fn from_relocatable_bytes(
        registry: &'r Registry,
        descriptor: &'r Descriptor,
        bytes: &[u8],
    ) -> Result<Self> {
        if !registry.owns(descriptor) {
            return Err(DdfError::Internal(format!(
                "Descriptor '{}' does not belong to this registry",
                descriptor.name
            )));
        }
        if bytes.len() < descriptor.size {
            return Err(DdfError::Internal(format!(
                "Image of {} bytes is smaller than '{}' ({} bytes)",
                bytes.len(),
                descriptor.name,
                descriptor.size
            )));
        }
        Ok(Self::from_parts(
            registry,
            descriptor,
            AlignedBuffer::from_bytes(bytes),
            Addressing::Relative,
            DEFAULT_MAX_DEPTH,
        ))
    }

    /// Set the nesting limit used when saving, copying or fixing up
    /// pointers.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[inline]
    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    #[inline]
    pub fn descriptor(&self) -> &'r Descriptor {
        self.descriptor
    }

    /// Arena size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Address of the arena's first byte.
    #[inline]
    pub fn base_address(&self) -> usize {
        self.storage.address()
    }

    #[inline]
    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Raw arena contents.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_bytes()
    }

    /// View of the root struct.
    pub fn root(&self) -> MessageRef<'_> {
        let view = BufferView::new(
            self.storage.as_bytes(),
            self.storage.address(),
            self.addressing,
            self.descriptor.size,
            self.max_depth,
        );
        MessageRef::new(self.registry, self.descriptor, view, 0)
    }

    /// Turn relative offsets into absolute pointers in place.
    pub fn resolve_pointers(&mut self) -> Result<()> {
        pointers::resolve_pointers(self)
    }

    /// Copy the arena byte for byte and fix up the copy's pointers.
    pub fn try_clone(&self) -> Result<Message<'r>> {
        let mut storage = self.storage.clone();
        if self.addressing == Addressing::Absolute {
            let new_base = storage.address();
            pointers::rebase(
                self.registry,
                self.descriptor,
                storage.as_bytes_mut(),
                self.storage.address(),
                new_base,
                self.max_depth,
            )?;
        }
        Ok(Self::from_parts(
            self.registry,
            self.descriptor,
            storage,
            self.addressing,
            self.max_depth,
        ))
    }

    pub(crate) fn storage_mut(&mut self) -> &mut AlignedBuffer {
        &mut self.storage
    }

    pub(crate) fn set_addressing(&mut self, addressing: Addressing) {
        self.addressing = addressing;
    }
}

impl std::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.descriptor.name)
            .field("size", &self.storage.len())
            .field("addressing", &self.addressing)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

/// Deep-copy a message by saving it and loading the result.
///
/// The copy uses the same addressing mode and nesting limit and shares no
/// memory with the original.
pub fn copy_message<'r>(message: &Message<'r>) -> Result<Message<'r>> {
    let mut buf = BytesMut::new();
    save_message(&message.root(), &mut buf)?;
    load_message(
        message.registry(),
        message.descriptor(),
        &buf,
        LoadOptions::new()
            .with_addressing(message.addressing())
            .max_depth(message.max_depth()),
    )
}

/// Release a message and its arena.
pub fn free_message(message: Message<'_>) {
    drop(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, MessageSpec, SchemaSpec, Type};

    fn registry() -> Registry {
        SchemaSpec::new()
            .message(
                MessageSpec::new("pair")
                    .field(FieldSpec::optional("key", 1, Type::String))
                    .field(FieldSpec::repeated("values", 2, Type::Int32))
                    .field(FieldSpec::optional("count", 3, Type::Int32)),
            )
            .build()
            .unwrap()
    }

    const PAIR: [u8; 9] = [0x0A, 0x01, b'k', 0x10, 0x04, 0x10, 0x05, 0x18, 0x02];

    #[test]
    fn test_accessor_errors() {
        let registry = registry();
        let desc = registry.get_descriptor("pair").unwrap();
        let message = load_message(&registry, desc, &PAIR, LoadOptions::new()).unwrap();
        let root = message.root();

        let err = root.get::<i32>("missing").unwrap_err();
        assert!(err.to_string().contains("no such field"));

        // Wrong scalar type
        assert!(root.get::<u32>("count").is_err());
        // Repeated field through a singular accessor
        assert!(root.get::<i32>("values").is_err());
        // Out of range element
        assert!(root.get_repeated("values").unwrap().get::<i32>(2).is_err());
        // Wrong element type
        assert!(root.get_repeated("values").unwrap().string(0).is_err());
    }

    #[test]
    fn test_try_clone_rebases() {
        let registry = registry();
        let desc = registry.get_descriptor("pair").unwrap();
        let message = load_message(&registry, desc, &PAIR, LoadOptions::new()).unwrap();

        let copy = message.try_clone().unwrap();
        assert_ne!(copy.base_address(), message.base_address());

        let key = copy.root().get_string("key").unwrap().unwrap();
        assert_eq!(key, "k");
        let copy_start = copy.base_address();
        let key_address = key.as_ptr() as usize;
        assert!(key_address >= copy_start && key_address < copy_start + copy.size());

        assert_eq!(copy.root().get_repeated("values").unwrap().to_vec::<i32>().unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_copy_message() {
        let registry = registry();
        let desc = registry.get_descriptor("pair").unwrap();
        let message = load_message(&registry, desc, &PAIR, LoadOptions::new()).unwrap();

        let copy = copy_message(&message).unwrap();
        assert_eq!(copy.size(), message.size());
        assert_eq!(copy.root().get::<i32>("count").unwrap(), 2);
        assert_ne!(
            copy.root().get_string("key").unwrap().unwrap().as_ptr(),
            message.root().get_string("key").unwrap().unwrap().as_ptr()
        );

        free_message(copy);
    }

    #[test]
    fn test_relocatable_image() {
        let registry = registry();
        let desc = registry.get_descriptor("pair").unwrap();
        let message =
            load_message(&registry, desc, &PAIR, LoadOptions::new().offset_pointers()).unwrap();

        let image = message.as_bytes().to_vec();
        let restored = Message::from_relocatable_bytes(&registry, desc, &image).unwrap();
        assert_eq!(restored.root().get_string("key").unwrap(), Some("k"));

        assert!(Message::from_relocatable_bytes(&registry, desc, &image[..4]).is_err());
    }
}
