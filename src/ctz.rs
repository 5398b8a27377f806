//! Skip-list storage for large file contents.
//!
//! A file's blocks are indexed 0..=last; block `i` starts with
//! `pointer_count(i)` little-endian back-pointers (pointer `k` addresses
//! block `i - 2^k`), followed by data. The metadata entry records only the
//! last block's address and the total size; everything else is derivable.

use binrw::{binrw, BinRead};
use std::io::Cursor;

use crate::entry::Entry;
use crate::serialization::binwrite_as_buf;
use crate::tag::{self, AbstractType, Tag};
use crate::{BlockDevice, Error, Geometry};

/// Payload of a CTZ struct entry: the head (last) block and the file size.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtzStruct {
    pub head: u32,
    pub size: u32,
}

impl CtzStruct {
    pub fn entry(&self, id: u16) -> Entry {
        let payload = binwrite_as_buf(self).unwrap();
        Entry::new(
            Tag::new(
                AbstractType::Struct,
                tag::CHUNK_CTZ_STRUCT,
                id,
                payload.len() as u16,
            ),
            payload,
        )
    }

    pub fn from_payload(buf: &[u8]) -> Result<CtzStruct, Error> {
        if buf.len() != 8 {
            return Err(Error::Corrupt);
        }
        CtzStruct::read_le(&mut Cursor::new(buf)).map_err(|_| Error::Corrupt)
    }
}

pub fn pointer_count(index: u32) -> u32 {
    if index == 0 {
        0
    } else {
        index.trailing_zeros() + 1
    }
}

/// Data bytes block `index` can hold after its pointer header.
pub fn capacity(index: u32, block_size: u32) -> u32 {
    block_size.saturating_sub(4 * pointer_count(index))
}

/// Smallest block index whose cumulative data capacity reaches `size`.
pub fn last_block_index(size: u32, block_size: u32) -> u32 {
    debug_assert!(size > 0);
    let mut index = 0;
    let mut cumulative = 0u64;
    loop {
        cumulative += capacity(index, block_size) as u64;
        if cumulative >= size as u64 {
            return index;
        }
        index += 1;
    }
}

/// Assemble the image of chain block `index`: back-pointers, data, zero fill.
pub fn block_image(index: u32, pointers: &[u32], chunk: &[u8], block_size: u32) -> Vec<u8> {
    debug_assert_eq!(pointers.len(), pointer_count(index) as usize);
    debug_assert!(4 * pointers.len() + chunk.len() <= block_size as usize);
    let mut image = Vec::with_capacity(block_size as usize);
    for pointer in pointers {
        image.extend_from_slice(&pointer.to_le_bytes());
    }
    image.extend_from_slice(chunk);
    image.resize(block_size as usize, 0);
    image
}

/// Read a whole chain back from its head, following pointer 0 down to block
/// 0, and trim the concatenation to the recorded size.
pub fn read<D: BlockDevice>(
    device: &mut D,
    geometry: Geometry,
    ctz: CtzStruct,
) -> Result<Vec<u8>, Error> {
    if ctz.size == 0 {
        return Ok(Vec::new());
    }
    let mut index = last_block_index(ctz.size, geometry.block_size);
    let mut address = ctz.head;
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    loop {
        let mut buf = vec![0u8; geometry.block_size as usize];
        device.read_block(address, &mut buf)?;
        let header = 4 * pointer_count(index) as usize;
        chunks.push(buf[header..].to_vec());
        if index == 0 {
            break;
        }
        address = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        index -= 1;
    }
    chunks.reverse();
    let mut data = chunks.concat();
    data.truncate(ctz.size as usize);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageDevice;
    use std::io::Cursor;

    const GEOMETRY: Geometry = Geometry {
        block_size: 512,
        program_size: 32,
    };

    #[test]
    fn test_pointer_count() {
        assert_eq!(pointer_count(0), 0);
        assert_eq!(pointer_count(1), 1);
        assert_eq!(pointer_count(2), 2);
        assert_eq!(pointer_count(3), 1);
        assert_eq!(pointer_count(4), 3);
        assert_eq!(pointer_count(6), 2);
        assert_eq!(pointer_count(8), 4);
    }

    #[test]
    fn test_capacity() {
        assert_eq!(capacity(0, 512), 512);
        assert_eq!(capacity(1, 512), 508);
        assert_eq!(capacity(4, 512), 500);
    }

    #[test]
    fn test_last_block_index_boundaries() {
        assert_eq!(last_block_index(1, 512), 0);
        assert_eq!(last_block_index(512, 512), 0);
        assert_eq!(last_block_index(513, 512), 1);
        // capacities 512, 508 -> 1020 total through block 1
        assert_eq!(last_block_index(1020, 512), 1);
        assert_eq!(last_block_index(1021, 512), 2);
        // 512 + 508 + 504 + 508 = 2032 through block 3
        assert_eq!(last_block_index(2032, 512), 3);
        assert_eq!(last_block_index(2048, 512), 4);
    }

    #[test]
    fn test_block_image_layout() {
        let image = block_image(2, &[7, 3], b"abc", 512);
        assert_eq!(image.len(), 512);
        assert_eq!(&image[0..4], &7u32.to_le_bytes());
        assert_eq!(&image[4..8], &3u32.to_le_bytes());
        assert_eq!(&image[8..11], b"abc");
        assert!(image[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_walks_chain() {
        // hand-build a three-block chain at addresses 2, 3, 4
        let mut dev = ImageDevice::new(Cursor::new(vec![0u8; 512 * 8]), 512, 8);
        let data: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
        dev.write_block(2, &block_image(0, &[], &data[..512], 512))
            .unwrap();
        dev.write_block(3, &block_image(1, &[2], &data[512..1020], 512))
            .unwrap();
        dev.write_block(4, &block_image(2, &[3, 2], &data[1020..], 512))
            .unwrap();
        let ctz = CtzStruct {
            head: 4,
            size: 1200,
        };
        assert_eq!(read(&mut dev, GEOMETRY, ctz).unwrap(), data);
    }

    #[test]
    fn test_payload_roundtrip() {
        let ctz = CtzStruct {
            head: 0x0a0b_0c0d,
            size: 4096,
        };
        let entry = ctz.entry(3);
        assert_eq!(entry.tag.chunk, tag::CHUNK_CTZ_STRUCT);
        assert_eq!(entry.tag.id, 3);
        assert_eq!(CtzStruct::from_payload(&entry.data).unwrap(), ctz);
        assert!(CtzStruct::from_payload(&[1, 2, 3]).is_err());
    }
}
