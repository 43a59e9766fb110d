//! # ddf
//!
//! Reflection-driven codec for a subset of the protobuf wire format.
//!
//! Messages are decoded into flat native struct layouts described by
//! runtime descriptors. A whole message tree lives in one 16-byte aligned
//! arena, so it is freed in one step and can be copied or relocated as a
//! single block.
//!
//! ## Architecture
//!
//! - **Schema**: descriptors with precomputed field offsets, built from a
//!   [`SchemaSpec`] or JSON and owned by a [`Registry`]
//! - **Load**: measures the wire bytes in dry passes, allocates the arena
//!   once, then decodes into it
//! - **Save**: walks the native layout and writes wire bytes to any
//!   [`wire::SaveSink`]
//! - **Pointers**: converts relative offsets to absolute pointers, and
//!   rebases absolute pointers after a move
//!
//! ## Example
//!
//! ```
//! use ddf::schema::{FieldSpec, MessageSpec, SchemaSpec, Type};
//! use ddf::{load_message, save_message_to_bytes, LoadOptions};
//!
//! let registry = SchemaSpec::new()
//!     .message(
//!         MessageSpec::new("greeting")
//!             .field(FieldSpec::optional("text", 1, Type::String))
//!             .field(FieldSpec::optional("count", 2, Type::Uint32)),
//!     )
//!     .build()
//!     .unwrap();
//! let desc = registry.get_descriptor("greeting").unwrap();
//!
//! let wire = [0x0A, 0x02, b'h', b'i', 0x10, 0x03];
//! let message = load_message(&registry, desc, &wire, LoadOptions::default()).unwrap();
//! let root = message.root();
//!
//! assert_eq!(root.get_string("text").unwrap(), Some("hi"));
//! assert_eq!(root.get::<u32>("count").unwrap(), 3);
//! assert_eq!(save_message_to_bytes(&root).unwrap().as_ref(), &wire);
//! ```

pub mod arena;
pub mod error;
pub mod load;
pub mod message;
pub mod pointers;
pub mod save;
pub mod schema;
pub mod wire;

pub use arena::Addressing;
pub use error::{DdfError, Result};
pub use load::{load_message, LoadOptions, DEFAULT_MAX_DEPTH};
pub use message::{copy_message, free_message, Message, MessageRef, RepeatedRef, ScalarValue};
pub use pointers::{rebase_message_pointers, resolve_pointers};
pub use save::{save_message, save_message_size, save_message_to_bytes};
pub use schema::{
    Descriptor, EnumDescriptor, FieldDescriptor, Label, OneofDescriptor, Registry, SchemaSpec, Type,
};
