use crate::protocol::error::{Result, RpcError};

/// Type tags of the wire format.
///
/// The declaration order is part of the wire contract: each tag is written as
/// the one's complement of its ordinal, which keeps every tag byte in the
/// negative range and leaves `0..=127` free for literal small integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Null = 0,
    True,
    False,
    Signed1,
    Signed2,
    Signed4,
    Signed8,
    Float4,
    Float8,
    Char,
    Array,
    String,
    Tag,
    List,
    Map,
    Entry,
    Enum,
    Set,
    Pojo,
    Bytes,
    Class,
    MetaClass,
    Serializable,
}

const TAGS: [Tag; 23] = [
    Tag::Null,
    Tag::True,
    Tag::False,
    Tag::Signed1,
    Tag::Signed2,
    Tag::Signed4,
    Tag::Signed8,
    Tag::Float4,
    Tag::Float8,
    Tag::Char,
    Tag::Array,
    Tag::String,
    Tag::Tag,
    Tag::List,
    Tag::Map,
    Tag::Entry,
    Tag::Enum,
    Tag::Set,
    Tag::Pojo,
    Tag::Bytes,
    Tag::Class,
    Tag::MetaClass,
    Tag::Serializable,
];

/// Largest lead byte that is a literal integer rather than a tag.
pub const MAX_LITERAL: u8 = 0x7F;

impl Tag {
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// The byte written for this tag.
    pub const fn byte(self) -> u8 {
        !(self as u8)
    }

    /// Decodes a tag byte.
    ///
    /// # Errors
    ///
    /// Returns `StreamCorrupted` for literal bytes and unknown ordinals.
    pub fn from_byte(byte: u8) -> Result<Tag> {
        if byte <= MAX_LITERAL {
            return Err(RpcError::StreamCorrupted(format!(
                "expected a tag, got literal {byte}"
            )));
        }
        TAGS.get(usize::from(!byte)).copied().ok_or_else(|| {
            RpcError::StreamCorrupted(format!("unknown tag byte 0x{byte:02x}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_bytes_are_ones_complement() {
        assert_eq!(Tag::Null.byte(), 0xFF);
        assert_eq!(Tag::True.byte(), 0xFE);
        assert_eq!(Tag::Serializable.byte(), !22u8);
        for (ordinal, tag) in TAGS.iter().enumerate() {
            assert_eq!(tag.ordinal() as usize, ordinal);
            assert_eq!(Tag::from_byte(tag.byte()).unwrap(), *tag);
        }
    }

    #[test]
    fn test_literals_and_unknown_bytes_rejected() {
        assert!(Tag::from_byte(0).is_err());
        assert!(Tag::from_byte(127).is_err());
        // ordinal 23 is past the last tag
        assert!(Tag::from_byte(!23u8).is_err());
    }
}
