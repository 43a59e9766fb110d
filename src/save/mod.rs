//! Save module - encode a decoded message back to wire bytes.
//!
//! Fields are written in descriptor order. Repeated scalars are always
//! written unpacked, one tag per element. Submessage lengths come from a
//! counting pre-pass, so any [`SaveSink`] works, including ones that
//! cannot seek.
//!
//! A failed save leaves whatever was already written in the sink.

mod encode;

use bytes::{Bytes, BytesMut};

use crate::error::{DdfError, Result};
use crate::message::MessageRef;
use crate::wire::{CountingSink, OutputStream, SaveSink};

/// Encode `message` into `sink`.
pub fn save_message<S: SaveSink + ?Sized>(message: &MessageRef<'_>, sink: &mut S) -> Result<()> {
    let mut out = OutputStream::new(sink);
    encode::encode_message(&mut out, message, 0)?;
    tracing::trace!(
        "Saved '{}' as {} bytes",
        message.descriptor().name,
        out.bytes_written()
    );
    Ok(())
}

/// Exact number of bytes [`save_message`] would write.
pub fn save_message_size(message: &MessageRef<'_>) -> Result<u32> {
    let mut counter = CountingSink::new();
    save_message(message, &mut counter)?;
    u32::try_from(counter.count()).map_err(|_| {
        DdfError::Internal(format!(
            "Message '{}' encodes to {} bytes",
            message.descriptor().name,
            counter.count()
        ))
    })
}

/// Encode `message` into a new buffer.
pub fn save_message_to_bytes(message: &MessageRef<'_>) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    save_message(message, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::{load_message, LoadOptions};
    use crate::message::Message;
    use crate::schema::{FieldSpec, MessageSpec, Registry, SchemaSpec, Type, POINTER_SIZE};
    use crate::wire::WriterSink;

    fn registry() -> Registry {
        SchemaSpec::new()
            .message(
                MessageSpec::new("point")
                    .field(FieldSpec::optional("x", 1, Type::Int32))
                    .field(FieldSpec::optional("y", 2, Type::Float)),
            )
            .message(
                MessageSpec::new("shape")
                    .field(FieldSpec::optional("name", 1, Type::String))
                    .field(FieldSpec::repeated("points", 2, Type::Message).type_name("point"))
                    .field(FieldSpec::repeated("ids", 3, Type::Uint32))
                    .field(FieldSpec::optional("visible", 4, Type::Bool)),
            )
            .message(MessageSpec::new("legacy").field(FieldSpec::optional("z", 1, Type::Sint32)))
            .message(
                MessageSpec::new("choice")
                    .field(FieldSpec::optional("id", 1, Type::Uint32))
                    .field(FieldSpec::optional("count", 2, Type::Uint32).oneof("pick"))
                    .field(FieldSpec::optional("label", 3, Type::String).oneof("pick")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_negative_int32_takes_ten_bytes() {
        let registry = registry();
        let desc = registry.get_descriptor("point").unwrap();
        let input = [
            0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01,
        ];
        let message = load_message(&registry, desc, &input, LoadOptions::new()).unwrap();
        assert_eq!(message.root().get::<i32>("x").unwrap(), -1);

        let bytes = save_message_to_bytes(&message.root()).unwrap();
        // x followed by the default y
        assert_eq!(&bytes[..11], &input);
        assert_eq!(&bytes[11..], &[0x15, 0, 0, 0, 0]);
    }

    #[test]
    fn test_absent_string_saves_empty() {
        let registry = registry();
        let desc = registry.get_descriptor("shape").unwrap();

        let unset = load_message(&registry, desc, &[], LoadOptions::new()).unwrap();
        assert_eq!(unset.root().get_string("name").unwrap(), Some(""));
        assert_eq!(
            save_message_to_bytes(&unset.root()).unwrap().as_ref(),
            &[0x0A, 0x00, 0x20, 0x00]
        );
    }

    #[test]
    fn test_null_string_is_skipped() {
        let registry = registry();
        let desc = registry.get_descriptor("shape").unwrap();
        let loaded =
            load_message(&registry, desc, &[0x0A, 0x01, b'n'], LoadOptions::new().offset_pointers())
                .unwrap();

        let mut image = loaded.as_bytes().to_vec();
        let slot = desc.field_by_name("name").unwrap().offset;
        image[slot..slot + POINTER_SIZE].fill(0);
        let nulled = Message::from_relocatable_bytes(&registry, desc, &image).unwrap();

        assert_eq!(nulled.root().get_string("name").unwrap(), None);
        assert_eq!(save_message_to_bytes(&nulled.root()).unwrap().as_ref(), &[0x20, 0x00]);
    }

    #[test]
    fn test_only_set_oneof_member_saved() {
        let registry = registry();
        let desc = registry.get_descriptor("choice").unwrap();
        let save = |wire: &[u8]| {
            let message = load_message(&registry, desc, wire, LoadOptions::new()).unwrap();
            save_message_to_bytes(&message.root()).unwrap().to_vec()
        };

        assert_eq!(save(&[]), vec![0x08, 0x00]);
        assert_eq!(save(&[0x10, 0x05]), vec![0x08, 0x00, 0x10, 0x05]);
        // The last member on the wire wins
        assert_eq!(save(&[0x1A, 0x01, b'x', 0x10, 0x05]), vec![0x08, 0x00, 0x10, 0x05]);
        assert_eq!(
            save(&[0x10, 0x05, 0x1A, 0x01, b'x']),
            vec![0x08, 0x00, 0x1A, 0x01, b'x']
        );
    }

    #[test]
    fn test_packed_input_saves_unpacked() {
        let registry = registry();
        let desc = registry.get_descriptor("shape").unwrap();
        let packed = [0x1A, 0x03, 0x01, 0x02, 0x03];
        let message = load_message(&registry, desc, &packed, LoadOptions::new()).unwrap();

        let bytes = save_message_to_bytes(&message.root()).unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0x0A, 0x00, 0x18, 0x01, 0x18, 0x02, 0x18, 0x03, 0x20, 0x00]
        );
    }

    #[test]
    fn test_submessage_length_prefix() {
        let registry = registry();
        let desc = registry.get_descriptor("shape").unwrap();
        // name: "" points { x: 1 y: 0 }
        let input = [
            0x0A, 0x00, 0x12, 0x07, 0x08, 0x01, 0x15, 0x00, 0x00, 0x00, 0x00, 0x20, 0x01,
        ];
        let message = load_message(&registry, desc, &input, LoadOptions::new()).unwrap();

        let bytes = save_message_to_bytes(&message.root()).unwrap();
        assert_eq!(bytes.as_ref(), &input);
        assert_eq!(save_message_size(&message.root()).unwrap(), input.len() as u32);
    }

    #[test]
    fn test_writer_sink() {
        let registry = registry();
        let desc = registry.get_descriptor("point").unwrap();
        let message = load_message(&registry, desc, &[0x08, 0x05], LoadOptions::new()).unwrap();

        let mut sink = WriterSink::new(Vec::new());
        save_message(&message.root(), &mut sink).unwrap();
        assert_eq!(sink.into_inner(), vec![0x08, 0x05, 0x15, 0, 0, 0, 0]);
    }

    #[test]
    fn test_reserved_type_fails() {
        let registry = registry();
        let desc = registry.get_descriptor("legacy").unwrap();
        let message = load_message(&registry, desc, &[], LoadOptions::new()).unwrap();

        let mut buf = Vec::new();
        let result = save_message(&message.root(), &mut buf);
        assert!(matches!(result, Err(DdfError::Internal(_))));
        assert!(buf.is_empty());
    }
}
