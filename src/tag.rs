//! 32-bit metadata tags.
//!
//! A tag packs `(valid, abstract type, chunk, id, length)` into one word:
//!
//! ```text
//! [31] valid   [30:28] type   [27:20] chunk   [19:10] id   [9:0] length
//! ```
//!
//! Bit 31 is set on absent/terminator tags, so erased flash (`0xff` fill)
//! never decodes as a live tag. On the wire the word is stored big-endian,
//! XORed against the previous tag's raw value; the chain starts at
//! `0xffffffff`.

/// Id value meaning "no id" (tails, CRC tags).
pub const NO_ID: u16 = 0x3ff;

pub const CHUNK_FILE: u8 = 0x01;
pub const CHUNK_DIR: u8 = 0x02;
pub const CHUNK_SUPERBLOCK: u8 = 0xff;

pub const CHUNK_DIR_STRUCT: u8 = 0x00;
pub const CHUNK_INLINE_STRUCT: u8 = 0x01;
pub const CHUNK_CTZ_STRUCT: u8 = 0x02;

#[allow(dead_code)]
pub const CHUNK_SOFT_TAIL: u8 = 0x00;
pub const CHUNK_HARD_TAIL: u8 = 0x01;

pub const CHUNK_DELETE: u8 = 0xff;

/// Initial XOR mask for the first tag of a block.
pub const XOR_SEED: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractType {
    Name = 0x0,
    Struct = 0x2,
    UserAttr = 0x3,
    Splice = 0x4,
    Crc = 0x5,
    Tail = 0x6,
}

impl AbstractType {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0x0 => Some(AbstractType::Name),
            0x2 => Some(AbstractType::Struct),
            0x3 => Some(AbstractType::UserAttr),
            0x4 => Some(AbstractType::Splice),
            0x5 => Some(AbstractType::Crc),
            0x6 => Some(AbstractType::Tail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub abstract_type: AbstractType,
    pub chunk: u8,
    pub id: u16,
    pub length: u16,
}

impl Tag {
    pub fn new(abstract_type: AbstractType, chunk: u8, id: u16, length: u16) -> Self {
        debug_assert!(id <= NO_ID);
        debug_assert!(length < 0x3ff);
        Tag {
            abstract_type,
            chunk,
            id,
            length,
        }
    }

    /// Splice tag that removes `id` and renumbers every higher id down by one.
    pub fn delete(id: u16) -> Self {
        Tag::new(AbstractType::Splice, CHUNK_DELETE, id, 0)
    }

    pub fn crc(length: u16) -> Self {
        Tag::new(AbstractType::Crc, 0x00, NO_ID, length)
    }

    /// Raw (un-XORed) encoding. Bit 31 stays clear: only live tags are encoded.
    pub fn encode(&self) -> u32 {
        ((self.abstract_type as u32) << 28)
            | ((self.chunk as u32) << 20)
            | (((self.id & 0x3ff) as u32) << 10)
            | ((self.length & 0x3ff) as u32)
    }

    /// Decode a raw (already un-XORed) word. `None` for terminator words
    /// (bit 31 set) and for type bits no live tag uses.
    pub fn decode(raw: u32) -> Option<Tag> {
        if raw & 0x8000_0000 != 0 {
            return None;
        }
        let abstract_type = AbstractType::from_bits((raw >> 28) & 0x7)?;
        Some(Tag {
            abstract_type,
            chunk: ((raw >> 20) & 0xff) as u8,
            id: ((raw >> 10) & 0x3ff) as u16,
            length: (raw & 0x3ff) as u16,
        })
    }

    pub fn is_name(&self) -> bool {
        self.abstract_type == AbstractType::Name
    }

    pub fn is_struct(&self) -> bool {
        self.abstract_type == AbstractType::Struct
    }

    pub fn is_crc(&self) -> bool {
        self.abstract_type == AbstractType::Crc
    }

    pub fn is_delete(&self) -> bool {
        self.abstract_type == AbstractType::Splice && self.chunk == CHUNK_DELETE
    }

    pub fn is_tail(&self) -> bool {
        self.abstract_type == AbstractType::Tail
    }

    pub fn is_hardtail(&self) -> bool {
        self.is_tail() && self.chunk == CHUNK_HARD_TAIL
    }

    pub fn has_id(&self) -> bool {
        self.id != NO_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let tag = Tag::new(AbstractType::Name, CHUNK_FILE, 3, 11);
        let raw = tag.encode();
        assert_eq!(Tag::decode(raw), Some(tag));
    }

    #[test]
    fn test_field_packing() {
        let tag = Tag::new(AbstractType::Struct, CHUNK_CTZ_STRUCT, 0x155, 0x2aa);
        let raw = tag.encode();
        assert_eq!((raw >> 31) & 1, 0);
        assert_eq!((raw >> 28) & 0x7, 0x2);
        assert_eq!((raw >> 20) & 0xff, 0x02);
        assert_eq!((raw >> 10) & 0x3ff, 0x155);
        assert_eq!(raw & 0x3ff, 0x2aa);
    }

    #[test]
    fn test_terminator_is_rejected() {
        assert_eq!(Tag::decode(0xffff_ffff), None);
        assert_eq!(Tag::decode(0x8000_0000), None);
    }

    #[test]
    fn test_unused_type_bits_are_rejected() {
        // type 0x1 and 0x7 carry no live tags
        assert_eq!(Tag::decode(0x1000_0000), None);
        assert_eq!(Tag::decode(0x7000_0000), None);
    }

    #[test]
    fn test_delete_constructor() {
        let tag = Tag::delete(7);
        assert!(tag.is_delete());
        assert_eq!(tag.id, 7);
        assert_eq!(tag.length, 0);
        assert!(!tag.is_crc());
    }

    #[test]
    fn test_erased_fill_after_a_live_tag_terminates() {
        // every live tag keeps bit 31 clear, so an erased 0xff word XORed
        // against it always lands on the terminator bit
        let live = Tag::crc(4).encode();
        assert_eq!(Tag::decode(0xffff_ffff ^ live), None);
        assert_eq!(Tag::decode(0xffff_ffff), None);
    }

    #[test]
    fn test_predicates() {
        let tail = Tag::new(AbstractType::Tail, CHUNK_HARD_TAIL, NO_ID, 8);
        assert!(tail.is_hardtail());
        assert!(!tail.has_id());
        let soft = Tag::new(AbstractType::Tail, CHUNK_SOFT_TAIL, NO_ID, 8);
        assert!(soft.is_tail());
        assert!(!soft.is_hardtail());
    }
}
