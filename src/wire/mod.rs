//! Wire module - protobuf-subset primitives.
//!
//! This module implements the byte-level encoding shared by load and save:
//! - Field keys (field number + wire type)
//! - Bounds-checked input cursor with sub-span support
//! - Output stream over pluggable save sinks

mod input;
mod output;
mod wire_type;

pub use input::InputBuffer;
pub use output::{CountingSink, OutputStream, SaveSink, WriterSink};
pub use wire_type::{
    decode_tag, encode_tag, Tag, WireType, MAX_FIELD_NUMBER, MAX_VARINT_LEN, TAG_TYPE_BITS,
    TAG_TYPE_MASK,
};
