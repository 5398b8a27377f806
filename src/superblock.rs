use binrw::{binrw, BinRead};
use std::io::Cursor;

use crate::entry::Entry;
use crate::serialization::binwrite_as_buf;
use crate::tag::{self, AbstractType, Tag};

pub const MAGIC: &[u8; 8] = b"littlefs";
/// On-disk format version, major.minor in the two u16 halves.
pub const VERSION: u32 = 0x0002_0000;

pub const NAME_LENGTH_MAX: u32 = 255;
pub const FILE_SIZE_MAX: u32 = 0x7fff_ffff;
pub const FILE_ATTRIBUTE_SIZE_MAX: u32 = 1022;

/// Superblock payload: six u32 fields, big-endian (unlike everything else
/// on disk except the tags).
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub name_length_max: u32,
    pub file_size_max: u32,
    pub file_attribute_size_max: u32,
}

impl Superblock {
    pub fn new(block_size: u32, block_count: u32) -> Self {
        Superblock {
            version: VERSION,
            block_size,
            block_count,
            name_length_max: NAME_LENGTH_MAX,
            file_size_max: FILE_SIZE_MAX,
            file_attribute_size_max: FILE_ATTRIBUTE_SIZE_MAX,
        }
    }

    pub fn version_major(&self) -> u16 {
        (self.version >> 16) as u16
    }

    /// The two entries anchoring the filesystem at id 0 of the root pair:
    /// the magic name and the inline struct carrying the geometry.
    pub fn entries(&self) -> Vec<Entry> {
        let name = Entry::new(
            Tag::new(
                AbstractType::Name,
                tag::CHUNK_SUPERBLOCK,
                0,
                MAGIC.len() as u16,
            ),
            MAGIC.to_vec(),
        );
        let payload = binwrite_as_buf(self).unwrap();
        let structure = Entry::new(
            Tag::new(
                AbstractType::Struct,
                tag::CHUNK_INLINE_STRUCT,
                0,
                payload.len() as u16,
            ),
            payload,
        );
        vec![name, structure]
    }

    /// Recover the superblock from a root pair's compacted entries: the
    /// magic name at id 0 plus its inline struct.
    pub fn from_entries(entries: &[Entry]) -> Option<Superblock> {
        entries
            .iter()
            .find(|e| e.tag.is_name() && e.tag.chunk == tag::CHUNK_SUPERBLOCK && e.tag.id == 0)
            .filter(|e| e.data == MAGIC)?;
        let structure = entries.iter().find(|e| {
            e.tag.is_struct() && e.tag.chunk == tag::CHUNK_INLINE_STRUCT && e.tag.id == 0
        })?;
        Superblock::read_be(&mut Cursor::new(&structure.data)).ok()
    }
}
