//! Wire types and field tags.
//!
//! Every field on the wire starts with a varint key:
//! ```text
//! ┌──────────────────────────────┬───────────┐
//! │ field number                 │ wire type │
//! │ bits 3..                     │ bits 0..2 │
//! └──────────────────────────────┴───────────┘
//! ```
//!
//! Only varint, fixed64, length-delimited and fixed32 payloads are
//! supported. Group markers are recognised so they can be rejected.

use crate::error::{DdfError, Result};

/// Number of bits the wire type occupies in a key.
pub const TAG_TYPE_BITS: u32 = 3;

/// Mask extracting the wire type from a key.
pub const TAG_TYPE_MASK: u32 = (1 << TAG_TYPE_BITS) - 1;

/// Largest field number representable in a key.
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Longest encoding of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Payload encoding announced by a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    /// Base-128 varint.
    Varint = 0,
    /// Eight little-endian bytes.
    Fixed64 = 1,
    /// Varint length followed by that many bytes.
    LengthDelimited = 2,
    /// Deprecated group start marker.
    StartGroup = 3,
    /// Deprecated group end marker.
    EndGroup = 4,
    /// Four little-endian bytes.
    Fixed32 = 5,
}

impl WireType {
    /// Convert the low three bits of a key into a wire type.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            3 => Ok(WireType::StartGroup),
            4 => Ok(WireType::EndGroup),
            5 => Ok(WireType::Fixed32),
            other => Err(DdfError::WireFormat(format!("Invalid wire type {}", other))),
        }
    }

    /// Check if this is a group marker.
    #[inline]
    pub fn is_group(self) -> bool {
        matches!(self, WireType::StartGroup | WireType::EndGroup)
    }
}

/// Decoded field key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Field number (1..=2^29-1).
    pub field_number: u32,
    /// Payload encoding.
    pub wire_type: WireType,
}

impl Tag {
    /// Create a new tag.
    pub fn new(field_number: u32, wire_type: WireType) -> Self {
        Self {
            field_number,
            wire_type,
        }
    }

    /// Encode the tag into its key value.
    ///
    /// # Example
    ///
    /// ```
    /// use ddf::wire::{Tag, WireType};
    ///
    /// let tag = Tag::new(2, WireType::LengthDelimited);
    /// assert_eq!(tag.encode(), 0x12);
    /// ```
    #[inline]
    pub fn encode(&self) -> u32 {
        (self.field_number << TAG_TYPE_BITS) | self.wire_type as u32
    }

    /// Decode a key read from the wire.
    ///
    /// A zero key or a zero field number is rejected, as is an unknown
    /// wire type.
    pub fn decode(key: u32) -> Result<Self> {
        if key == 0 {
            return Err(DdfError::WireFormat("Zero field key".to_string()));
        }

        let field_number = key >> TAG_TYPE_BITS;
        if field_number == 0 {
            return Err(DdfError::WireFormat("Field number 0 is invalid".to_string()));
        }

        Ok(Self {
            field_number,
            wire_type: WireType::from_bits(key & TAG_TYPE_MASK)?,
        })
    }
}

/// Encode a tag (standalone function).
#[inline]
pub fn encode_tag(field_number: u32, wire_type: WireType) -> u32 {
    Tag::new(field_number, wire_type).encode()
}

/// Decode a tag (standalone function).
#[inline]
pub fn decode_tag(key: u32) -> Result<Tag> {
    Tag::decode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_encode() {
        assert_eq!(encode_tag(1, WireType::Varint), 0x08);
        assert_eq!(encode_tag(2, WireType::Varint), 0x10);
        assert_eq!(encode_tag(3, WireType::Fixed32), 0x1D);
        assert_eq!(encode_tag(4, WireType::Fixed64), 0x21);
    }

    #[test]
    fn test_tag_decode() {
        let tag = decode_tag(0x1A).unwrap();
        assert_eq!(tag.field_number, 3);
        assert_eq!(tag.wire_type, WireType::LengthDelimited);
    }

    #[test]
    fn test_tag_decode_rejects_zero() {
        let result = decode_tag(0);
        assert!(result.unwrap_err().to_string().contains("Zero field key"));

        // Field number 0 with a valid wire type
        assert!(decode_tag(0x02).is_err());
    }

    #[test]
    fn test_invalid_wire_type() {
        assert!(decode_tag((1 << 3) | 6).is_err());
        assert!(decode_tag((1 << 3) | 7).is_err());
    }

    #[test]
    fn test_group_markers() {
        let tag = decode_tag((5 << 3) | 3).unwrap();
        assert!(tag.wire_type.is_group());
        assert!(!WireType::Fixed32.is_group());
    }
}
