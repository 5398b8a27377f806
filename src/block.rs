//! One metadata block: a little-endian revision count followed by an append
//! log of commits. Every commit is a run of XOR-chained tags and payloads,
//! terminated by a CRC tag whose word covers all bytes of the block so far,
//! and padded with zeros to the next program-size boundary so each commit
//! lands on an atomic program unit.

use std::io::{self, Cursor, Read, Seek, Write};

use log::trace;

use crate::ctz::CtzStruct;
use crate::entry::{self, Entry};
use crate::pair::Pair;
use crate::serialization::{Crc32Reader, Crc32Writer};
use crate::tag::{self, Tag, XOR_SEED};
use crate::{Error, Geometry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub revision_count: u32,
    pub commits: Vec<Commit>,
}

/// Outcome of serializing a block image.
#[derive(Debug)]
pub enum Serialized {
    /// The image fits with spare room for future appends.
    Fits(Vec<u8>),
    /// The image fits to the last byte; a pair split is advisable.
    SplitAdvised(Vec<u8>),
    /// The commits do not fit in one block; the caller must split.
    SplitRequired,
}

/// An outbound reference held by a block's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Pair(Pair),
    Ctz { head: u32, size: u32 },
}

impl Block {
    #[allow(dead_code)]
    pub fn empty(revision_count: u32) -> Block {
        Block {
            revision_count,
            commits: Vec::new(),
        }
    }

    /// Parse a block image. Stops quietly at the first commit whose CRC does
    /// not check out (that is the end of the live log, or the remnant of an
    /// interrupted program); only an unreadable revision-count region is an
    /// error.
    pub fn parse(program_size: u32, buffer: &[u8]) -> Result<Block, Error> {
        if buffer.len() < 4 {
            return Err(Error::Corrupt);
        }
        let mut reader = Crc32Reader::new(Cursor::new(buffer));
        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        let revision_count = u32::from_le_bytes(word);

        let mut xor = XOR_SEED;
        let mut commits = Vec::new();
        let mut pending: Vec<Entry> = Vec::new();
        loop {
            let mut wire = [0u8; 4];
            if reader.read_exact(&mut wire).is_err() {
                break;
            }
            let raw = u32::from_be_bytes(wire) ^ xor;
            let Some(tag) = Tag::decode(raw) else {
                break;
            };
            xor = raw;
            if tag.is_crc() {
                if tag.length != 4 {
                    break;
                }
                let expected = reader.crc();
                let mut stored = [0u8; 4];
                if reader.read_exact(&mut stored).is_err() {
                    break;
                }
                if u32::from_le_bytes(stored) != expected {
                    break;
                }
                commits.push(Commit {
                    entries: std::mem::take(&mut pending),
                });
                // the commit is padded to the next program boundary
                let position = reader.stream_position()? as u32;
                let padding = (program_size - position % program_size) % program_size;
                let mut zeros = vec![0u8; padding as usize];
                if reader.read_exact(&mut zeros).is_err() {
                    break;
                }
            } else {
                let mut data = vec![0u8; tag.length as usize];
                if reader.read_exact(&mut data).is_err() {
                    break;
                }
                pending.push(Entry::new(tag, data));
            }
        }
        Ok(Block {
            revision_count,
            commits,
        })
    }

    /// Serialize to a full block image. Space past the last commit is filled
    /// with `0xff` (the erased-flash pattern), which XORs into a terminator
    /// tag on the next parse.
    pub fn serialize(&self, geometry: Geometry) -> io::Result<Serialized> {
        let mut writer = Crc32Writer::new(Cursor::new(Vec::new()));
        writer.write_all(&self.revision_count.to_le_bytes())?;
        let mut xor = XOR_SEED;
        for commit in &self.commits {
            for entry in &commit.entries {
                let raw = entry.tag.encode();
                writer.write_all(&(raw ^ xor).to_be_bytes())?;
                xor = raw;
                writer.write_all(&entry.data)?;
            }
            let raw = Tag::crc(4).encode();
            writer.write_all(&(raw ^ xor).to_be_bytes())?;
            xor = raw;
            let crc = writer.crc();
            writer.write_all(&crc.to_le_bytes())?;
            let position = writer.stream_position()? as u32;
            let padding = (geometry.program_size - position % geometry.program_size)
                % geometry.program_size;
            writer.write_all(&vec![0u8; padding as usize])?;
        }
        let mut image = writer.into_inner().into_inner();
        let block_size = geometry.block_size as usize;
        if image.len() > block_size {
            return Ok(Serialized::SplitRequired);
        }
        let spare = block_size - image.len();
        image.resize(block_size, 0xff);
        if spare > 0 {
            Ok(Serialized::Fits(image))
        } else {
            Ok(Serialized::SplitAdvised(image))
        }
    }

    /// New logical block with the entries appended as one more commit.
    pub fn add_commit(&self, entries: Vec<Entry>) -> Block {
        let mut commits = self.commits.clone();
        commits.push(Commit { entries });
        Block {
            revision_count: self.revision_count.wrapping_add(1),
            commits,
        }
    }

    pub fn with_revision(&self, revision_count: u32) -> Block {
        Block {
            revision_count,
            commits: self.commits.clone(),
        }
    }

    /// All entries in log order, across commits.
    pub fn entries(&self) -> Vec<Entry> {
        self.commits
            .iter()
            .flat_map(|c| c.entries.iter().cloned())
            .collect()
    }

    pub fn compacted_entries(&self) -> Vec<Entry> {
        entry::compact(&self.entries())
    }

    /// Collapse the whole log into one equivalent commit.
    pub fn compact(&self) -> Block {
        trace!("compacting block with {} commits", self.commits.len());
        Block {
            revision_count: self.revision_count,
            commits: vec![Commit {
                entries: self.compacted_entries(),
            }],
        }
    }

    /// Distinct ids present, ascending.
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .compacted_entries()
            .iter()
            .filter(|e| e.tag.has_id())
            .map(|e| e.tag.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Partition the compacted entries into two halves by id. The lower
    /// (majority) half stays under its own ids, now ending in a hard tail to
    /// `new_pair`; the upper half is returned renumbered from 1, with any
    /// pre-existing tail migrated to it so the chain stays linked.
    pub fn split(&self, new_pair: Pair) -> (Block, Vec<Entry>) {
        let compacted = self.compacted_entries();
        let old_tail = compacted.iter().find(|e| e.tag.is_tail()).cloned();
        let ids = self.ids();
        let mid = ids.len().div_ceil(2);
        let keep_ids = &ids[..mid];

        let mut keep: Vec<Entry> = compacted
            .iter()
            .filter(|e| !e.tag.is_tail())
            .filter(|e| !e.tag.has_id() || keep_ids.contains(&e.tag.id))
            .cloned()
            .collect();
        let mut moved: Vec<Entry> = Vec::new();
        for (index, &id) in ids[mid..].iter().enumerate() {
            for e in compacted.iter().filter(|e| e.tag.has_id() && e.tag.id == id) {
                let mut e = e.clone();
                e.tag.id = (index + 1) as u16;
                moved.push(e);
            }
        }
        if let Some(tail) = old_tail {
            moved.push(tail);
        }
        keep.push(Entry::hardtail(new_pair));

        let head = Block {
            revision_count: self.revision_count,
            commits: vec![Commit { entries: keep }],
        };
        (head, moved)
    }

    /// Every outbound block reference: tail pairs, child directory pairs,
    /// CTZ heads. Malformed struct payloads are skipped.
    pub fn links(&self) -> Vec<Link> {
        let mut links = Vec::new();
        for e in self.compacted_entries() {
            if e.tag.is_tail() {
                if let Ok(pair) = Pair::from_payload(&e.data) {
                    links.push(Link::Pair(pair));
                }
            } else if e.tag.is_struct() && e.tag.chunk == tag::CHUNK_DIR_STRUCT {
                if let Ok(pair) = Pair::from_payload(&e.data) {
                    links.push(Link::Pair(pair));
                }
            } else if e.tag.is_struct() && e.tag.chunk == tag::CHUNK_CTZ_STRUCT {
                if let Ok(ctz) = CtzStruct::from_payload(&e.data) {
                    links.push(Link::Ctz {
                        head: ctz.head,
                        size: ctz.size,
                    });
                }
            }
        }
        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOMETRY: Geometry = Geometry {
        block_size: 512,
        program_size: 32,
    };

    fn sample_block() -> Block {
        Block::empty(7)
            .add_commit(vec![
                Entry::file_name(1, "a"),
                Entry::inline_struct(1, b"hello"),
            ])
            .add_commit(vec![
                Entry::file_name(2, "b"),
                Entry::inline_struct(2, b"world"),
            ])
    }

    fn image_of(block: &Block) -> Vec<u8> {
        match block.serialize(GEOMETRY).unwrap() {
            Serialized::Fits(image) => image,
            other => panic!("expected a fitting image, got {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip() {
        let block = sample_block();
        let image = image_of(&block);
        assert_eq!(image.len(), 512);
        let parsed = Block::parse(GEOMETRY.program_size, &image).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn test_serialize_parse_serialize_is_byte_exact() {
        let image = image_of(&sample_block());
        let parsed = Block::parse(GEOMETRY.program_size, &image).unwrap();
        assert_eq!(image_of(&parsed), image);
    }

    #[test]
    fn test_commits_end_on_program_boundaries() {
        let image = image_of(&sample_block());
        // the first commit is 26 bytes of content padded out to offset 32
        let parsed_one = Block::parse(GEOMETRY.program_size, &image[..32]).unwrap();
        assert_eq!(parsed_one.commits.len(), 1);
    }

    #[test]
    fn test_truncated_program_drops_only_last_commit() {
        let image = image_of(&sample_block());
        // chop inside the second commit's bytes
        let truncated = &image[..40];
        let parsed = Block::parse(GEOMETRY.program_size, truncated).unwrap();
        assert_eq!(parsed.revision_count, 9);
        assert_eq!(parsed.commits.len(), 1);
        assert_eq!(parsed.commits[0].entries[0].data, b"a");
    }

    #[test]
    fn test_flipped_byte_fails_crc() {
        let mut image = image_of(&sample_block());
        image[9] ^= 0x40; // inside the first commit's first entry
        let parsed = Block::parse(GEOMETRY.program_size, &image).unwrap();
        assert_eq!(parsed.commits.len(), 0);
    }

    #[test]
    fn test_short_buffer_is_corrupt() {
        assert!(matches!(
            Block::parse(GEOMETRY.program_size, &[0, 1]),
            Err(Error::Corrupt)
        ));
    }

    #[test]
    fn test_erased_and_blank_blocks_parse_empty() {
        let erased = vec![0xffu8; 512];
        let parsed = Block::parse(GEOMETRY.program_size, &erased).unwrap();
        assert_eq!(parsed.commits.len(), 0);
        let blank = vec![0u8; 512];
        let parsed = Block::parse(GEOMETRY.program_size, &blank).unwrap();
        assert_eq!(parsed.revision_count, 0);
        assert_eq!(parsed.commits.len(), 0);
    }

    #[test]
    fn test_empty_commit_roundtrips() {
        let block = Block::empty(0).add_commit(Vec::new());
        let image = image_of(&block);
        let parsed = Block::parse(GEOMETRY.program_size, &image).unwrap();
        assert_eq!(parsed.commits.len(), 1);
        assert!(parsed.commits[0].entries.is_empty());
    }

    #[test]
    fn test_add_commit_bumps_revision() {
        let block = sample_block();
        assert_eq!(block.revision_count, 9);
        assert_eq!(block.commits.len(), 2);
    }

    #[test]
    fn test_compact_collapses_log() {
        let block = sample_block().add_commit(vec![Entry::delete(1)]);
        let compacted = block.compact();
        assert_eq!(compacted.commits.len(), 1);
        assert_eq!(compacted.ids(), vec![1]);
        let names: Vec<_> = compacted.commits[0]
            .entries
            .iter()
            .filter(|e| e.tag.is_name())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].data, b"b");
    }

    #[test]
    fn test_overflow_requires_split() {
        let mut block = Block::empty(0);
        for i in 0..20 {
            block = block.add_commit(vec![
                Entry::file_name(i + 1, &format!("file-{i}")),
                Entry::inline_struct(i + 1, &[0xaa; 16]),
            ]);
        }
        assert!(matches!(
            block.serialize(GEOMETRY).unwrap(),
            Serialized::SplitRequired
        ));
        // 20 live files are too much for one 512-byte block even compacted
        assert!(matches!(
            block.compact().serialize(GEOMETRY).unwrap(),
            Serialized::SplitRequired
        ));
    }

    #[test]
    fn test_split_partitions_by_id() {
        let mut block = Block::empty(3);
        for i in 0..4u16 {
            block = block.add_commit(vec![
                Entry::file_name(i + 1, &format!("f{i}")),
                Entry::inline_struct(i + 1, b"x"),
            ]);
        }
        let new_pair = Pair::new(8, 9);
        let (head, moved) = block.split(new_pair);
        assert_eq!(head.ids(), vec![1, 2]);
        let tail_entry = head.compacted_entries().into_iter().last().unwrap();
        assert!(tail_entry.tag.is_hardtail());
        assert_eq!(Pair::from_payload(&tail_entry.data).unwrap(), new_pair);
        // moved half renumbered from 1
        let moved_ids: Vec<u16> = moved.iter().map(|e| e.tag.id).collect();
        assert_eq!(moved_ids, vec![1, 1, 2, 2]);
        let moved_names: Vec<_> = moved.iter().filter(|e| e.tag.is_name()).collect();
        assert_eq!(moved_names[0].data, b"f2");
        assert_eq!(moved_names[1].data, b"f3");
    }

    #[test]
    fn test_split_migrates_existing_tail() {
        let next = Pair::new(20, 21);
        let mut block = Block::empty(0).add_commit(vec![Entry::hardtail(next)]);
        for i in 0..2u16 {
            block = block.add_commit(vec![
                Entry::file_name(i + 1, &format!("f{i}")),
                Entry::inline_struct(i + 1, b"x"),
            ]);
        }
        let new_pair = Pair::new(8, 9);
        let (head, moved) = block.split(new_pair);
        let head_tails: Vec<_> = head
            .compacted_entries()
            .into_iter()
            .filter(|e| e.tag.is_tail())
            .collect();
        assert_eq!(head_tails.len(), 1);
        assert_eq!(Pair::from_payload(&head_tails[0].data).unwrap(), new_pair);
        let moved_tail = moved.iter().find(|e| e.tag.is_tail()).unwrap();
        assert_eq!(Pair::from_payload(&moved_tail.data).unwrap(), next);
    }

    #[test]
    fn test_links_enumerates_references() {
        let child = Pair::new(10, 11);
        let tail = Pair::new(12, 13);
        let ctz = CtzStruct {
            head: 42,
            size: 1000,
        };
        let block = Block::empty(0).add_commit(vec![
            Entry::dir_name(1, "d"),
            Entry::dir_struct(1, child),
            Entry::file_name(2, "f"),
            ctz.entry(2),
            Entry::hardtail(tail),
        ]);
        let links = block.links();
        assert!(links.contains(&Link::Pair(child)));
        assert!(links.contains(&Link::Pair(tail)));
        assert!(links.contains(&Link::Ctz {
            head: 42,
            size: 1000
        }));
        assert_eq!(links.len(), 3);
    }
}
