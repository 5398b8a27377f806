#![doc = include_str!("../README.md")]

use std::io::{self, Read, Seek, Write};

use log::{debug, trace};

mod alloc;
mod block;
mod ctz;
mod dir;
mod entry;
mod pair;
mod serialization;
mod superblock;
mod tag;

use crate::block::{Block, Commit};
use crate::ctz::CtzStruct;
use crate::entry::Entry;
use crate::pair::{Pair, WriteOutcome};
use crate::superblock::Superblock;

pub use crate::dir::Kind;

/// Smallest unit the device can program atomically; commits are padded to it.
pub const DEFAULT_PROGRAM_BLOCK_SIZE: u32 = 32;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path component does not exist.
    NotFound(String),
    /// A path component names a value where a directory is needed.
    DictionaryExpected(String),
    /// The path names a directory where a value is needed.
    ValueExpected(String),
    /// The name exceeds the superblock's name length limit.
    NameTooLong(String),
    /// The allocator is exhausted, or a metadata split could not be resolved.
    NoSpace,
    /// Neither member of a metadata pair could be read.
    Corrupt,
    /// Surfaced from the block device, unchanged.
    Device(#[from] io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Runtime geometry of the mounted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub program_size: u32,
}

/// The only primitives the filesystem needs from the hardware. Blocks are
/// assumed pre-erased by the layer below before they are written again.
pub trait BlockDevice {
    fn read_block(&mut self, block: u32, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&mut self, block: u32, buf: &[u8]) -> io::Result<()>;
    fn block_count(&self) -> u32;
}

/// Block device over any seekable byte image (a file, a `Cursor<Vec<u8>>`).
pub struct ImageDevice<T: Read + Write + Seek> {
    inner: T,
    block_size: u32,
    block_count: u32,
}

impl<T: Read + Write + Seek> ImageDevice<T> {
    pub fn new(inner: T, block_size: u32, block_count: u32) -> Self {
        ImageDevice {
            inner,
            block_size,
            block_count,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Write + Seek> BlockDevice for ImageDevice<T> {
    fn read_block(&mut self, block: u32, buf: &mut [u8]) -> io::Result<()> {
        // addresses come from on-disk pointers, so out of range is data
        // corruption, not a caller bug
        if block >= self.block_count {
            return Err(io::Error::other(format!("block {block} out of range")));
        }
        assert_eq!(buf.len(), self.block_size as usize);
        self.inner
            .seek(io::SeekFrom::Start(block as u64 * self.block_size as u64))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        // a short image reads as unwritten space
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_block(&mut self, block: u32, buf: &[u8]) -> io::Result<()> {
        if block >= self.block_count {
            return Err(io::Error::other(format!("block {block} out of range")));
        }
        assert!(buf.len() <= self.block_size as usize);
        self.inner
            .seek(io::SeekFrom::Start(block as u64 * self.block_size as u64))?;
        self.inner.write_all(buf)?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }
}

/// A mounted filesystem handle. All state lives here; operations on one
/// handle must be externally serialized, and independent handles on
/// disjoint devices do not interact.
pub struct Filesystem<D: BlockDevice> {
    pub(crate) device: D,
    pub(crate) geometry: Geometry,
    lookahead: alloc::Lookahead,
    name_length_max: u32,
    file_size_max: u32,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Attach to a device. When a superblock is present its limits are
    /// adopted and its geometry validated; an unformatted device still
    /// yields a usable handle so that [`Filesystem::format`] can run.
    pub fn connect(device: D, program_block_size: u32, block_size: u32) -> Result<Self, Error> {
        // the program size must divide the block size, the block size must
        // leave room for a commit, and the device must fit a root pair
        if program_block_size == 0
            || block_size % program_block_size != 0
            || block_size < 128
            || device.block_count() < 2
        {
            return Err(Error::Corrupt);
        }
        let geometry = Geometry {
            block_size,
            program_size: program_block_size,
        };
        let mut fs = Filesystem {
            device,
            geometry,
            lookahead: alloc::Lookahead::new(),
            name_length_max: superblock::NAME_LENGTH_MAX,
            file_size_max: superblock::FILE_SIZE_MAX,
        };
        match pair::ROOT.read(&mut fs.device, fs.geometry) {
            Ok(root) => {
                if let Some(found) = Superblock::from_entries(&root.compacted_entries()) {
                    if found.version_major() != 2
                        || found.block_size != block_size
                        || found.block_count > fs.device.block_count()
                    {
                        return Err(Error::Corrupt);
                    }
                    fs.name_length_max = found.name_length_max;
                    fs.file_size_max = found.file_size_max;
                    debug!(
                        "mounted: block_size={} block_count={} version={:#010x}",
                        found.block_size, found.block_count, found.version
                    );
                } else {
                    debug!("no superblock found; the device needs a format");
                }
            }
            Err(Error::Corrupt) => debug!("root pair unreadable; the device needs a format"),
            Err(e) => return Err(e),
        }
        Ok(fs)
    }

    /// Write a fresh filesystem: a root pair holding only the superblock.
    /// Everything previously on the device becomes unreachable.
    pub fn format(&mut self) -> Result<(), Error> {
        let superblock = Superblock::new(self.geometry.block_size, self.device.block_count());
        let (ra, rb) = pair::ROOT.revisions(&mut self.device, self.geometry);
        let base = if pair::newer(ra, rb) { ra } else { rb };
        let root = Block {
            revision_count: base.wrapping_add(1),
            commits: vec![Commit {
                entries: superblock.entries(),
            }],
        };
        match pair::ROOT.write(&mut self.device, self.geometry, &root)? {
            WriteOutcome::Done => {
                self.lookahead = alloc::Lookahead::new();
                self.name_length_max = superblock.name_length_max;
                self.file_size_max = superblock.file_size_max;
                debug!(
                    "formatted: block_size={} block_count={}",
                    superblock.block_size, superblock.block_count
                );
                Ok(())
            }
            _ => Err(Error::NoSpace),
        }
    }

    /// Read the value at `path`: inline payloads straight from the
    /// metadata, chained contents via their skip list.
    pub fn get(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let segments = Self::segments(path);
        let Some((&name, parents)) = segments.split_last() else {
            return Err(Error::ValueExpected(path.to_string()));
        };
        let parent = self.resolve_dir(parents)?;
        let Some((_, entries)) =
            dir::entries_of_name(&mut self.device, self.geometry, parent, name)?
        else {
            return Err(Error::NotFound(path.to_string()));
        };
        for e in &entries {
            if !e.tag.is_struct() {
                continue;
            }
            match e.tag.chunk {
                tag::CHUNK_INLINE_STRUCT => return Ok(e.data.clone()),
                tag::CHUNK_CTZ_STRUCT => {
                    let ctz = CtzStruct::from_payload(&e.data)?;
                    return ctz::read(&mut self.device, self.geometry, ctz);
                }
                tag::CHUNK_DIR_STRUCT => return Err(Error::ValueExpected(path.to_string())),
                _ => {}
            }
        }
        Err(Error::NotFound(path.to_string()))
    }

    /// Write `data` under `path`, replacing any existing value of that
    /// name. Contents up to a quarter of the block size are stored inline
    /// in the parent's metadata; anything larger goes to a chain of data
    /// blocks written before the metadata that references them.
    pub fn set(&mut self, path: &str, data: &[u8]) -> Result<(), Error> {
        let result = self.set_inner(path, data);
        self.lookahead.finish_operation();
        result
    }

    /// Remove the value or directory entry at `path`. Removing something
    /// that is not there is fine; the blocks of whatever became unreachable
    /// are recovered by the next allocator refill.
    pub fn delete(&mut self, path: &str) -> Result<(), Error> {
        let result = self.delete_inner(path);
        self.lookahead.finish_operation();
        result
    }

    /// Create the directory at `path`, including missing intermediates.
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        let result = self.mkdir_inner(path);
        self.lookahead.finish_operation();
        result
    }

    /// Names and kinds in the directory at `path`, across its whole chain.
    pub fn list(&mut self, path: &str) -> Result<Vec<(String, Kind)>, Error> {
        let segments = Self::segments(path);
        let directory = self.resolve_dir(&segments)?;
        dir::list(&mut self.device, self.geometry, directory)
    }

    fn set_inner(&mut self, path: &str, data: &[u8]) -> Result<(), Error> {
        let segments = Self::segments(path);
        let Some((&name, parents)) = segments.split_last() else {
            return Err(Error::ValueExpected(path.to_string()));
        };
        if name.len() > self.name_length_max as usize {
            return Err(Error::NameTooLong(name.to_string()));
        }
        if data.len() as u64 > self.file_size_max as u64 {
            debug!("{} bytes exceed the file size limit", data.len());
            return Err(Error::NoSpace);
        }
        let parent = self.resolve_dir(parents)?;
        let links = dir::chain(&mut self.device, self.geometry, parent)?;
        let existing = dir::entries_of_name(&mut self.device, self.geometry, parent, name)?;
        // a replaced name frees its id; new names go to the end of the chain
        let (target, deleted) = match &existing {
            Some((holder, entries)) => (*holder, Some(entries[0].tag.id)),
            None => (links.last().unwrap().0, None),
        };
        let target_block = &links.iter().find(|(p, _)| *p == target).unwrap().1;
        let id = Self::next_free_id(target_block, deleted);
        let mut batch = Vec::new();
        if let Some(d) = deleted {
            batch.push(Entry::delete(d));
        }
        // inline payloads are also bounded by the tag's 10-bit length field
        let inline_max = (self.geometry.block_size / 4).min(0x3fe);
        if data.len() <= inline_max as usize {
            batch.push(Entry::file_name(id, name));
            batch.push(Entry::inline_struct(id, data));
        } else {
            let ctz = self.write_ctz(data)?;
            batch.push(Entry::file_name(id, name));
            batch.push(ctz.entry(id));
        }
        self.commit_to_pair(target, batch)
    }

    fn delete_inner(&mut self, path: &str) -> Result<(), Error> {
        let segments = Self::segments(path);
        let Some((&name, parents)) = segments.split_last() else {
            return Ok(());
        };
        let parent = match self.resolve_dir(parents) {
            Ok(parent) => parent,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match dir::entries_of_name(&mut self.device, self.geometry, parent, name)? {
            None => Ok(()),
            Some((holder, entries)) => {
                self.commit_to_pair(holder, vec![Entry::delete(entries[0].tag.id)])
            }
        }
    }

    fn mkdir_inner(&mut self, path: &str) -> Result<(), Error> {
        let segments = Self::segments(path);
        let mut current = pair::ROOT;
        for &segment in &segments {
            match dir::entries_of_name(&mut self.device, self.geometry, current, segment)? {
                Some((_, entries)) => {
                    let Some(structure) = entries
                        .iter()
                        .find(|e| e.tag.is_struct() && e.tag.chunk == tag::CHUNK_DIR_STRUCT)
                    else {
                        return Err(Error::DictionaryExpected(segment.to_string()));
                    };
                    current = Pair::from_payload(&structure.data)?;
                }
                None => {
                    if segment.len() > self.name_length_max as usize {
                        return Err(Error::NameTooLong(segment.to_string()));
                    }
                    let child = Pair::new(self.allocate()?, self.allocate()?);
                    // the child must be a valid empty directory before the
                    // parent references it
                    self.initialize_pair(child, Vec::new())?;
                    let links = dir::chain(&mut self.device, self.geometry, current)?;
                    let (tail_pair, tail_block) = links.last().unwrap();
                    let id = Self::next_free_id(tail_block, None);
                    self.commit_to_pair(
                        *tail_pair,
                        vec![Entry::dir_name(id, segment), Entry::dir_struct(id, child)],
                    )?;
                    current = child;
                }
            }
        }
        Ok(())
    }

    fn resolve_dir(&mut self, segments: &[&str]) -> Result<Pair, Error> {
        match dir::find(&mut self.device, self.geometry, pair::ROOT, segments)? {
            dir::Walk::Basename(found) => Ok(found),
            dir::Walk::NoId(segment) => Err(Error::NotFound(segment)),
            dir::Walk::NoEntry => Err(Error::NotFound(segments.join("/"))),
            dir::Walk::NoStructs(segment) => Err(Error::DictionaryExpected(segment)),
        }
    }

    fn segments(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Lowest id not in use after an optional pending delete, which shifts
    /// every higher id down by one. Ids in ordinary directories start at 1;
    /// id 0 is only ever the superblock anchor in the root pair.
    fn next_free_id(block: &Block, deleted: Option<u16>) -> u16 {
        let mut ids = block.ids();
        if let Some(d) = deleted {
            ids.retain(|&i| i != d);
            for i in ids.iter_mut() {
                if *i > d {
                    *i -= 1;
                }
            }
        }
        ids.iter().max().map(|m| m + 1).unwrap_or(1)
    }

    fn allocate(&mut self) -> Result<u32, Error> {
        if let Some(block) = self.lookahead.next() {
            trace!("allocated block {block}");
            return Ok(block);
        }
        let live = alloc::live_blocks(&mut self.device, self.geometry);
        self.lookahead.refill(&live, self.device.block_count());
        let block = self.lookahead.next().ok_or(Error::NoSpace)?;
        trace!("allocated block {block}");
        Ok(block)
    }

    /// Append `entries` as a new commit, compacting and finally splitting
    /// the pair when the block runs out of room.
    fn commit_to_pair(&mut self, target: Pair, entries: Vec<Entry>) -> Result<(), Error> {
        let block = target.read(&mut self.device, self.geometry)?;
        let appended = block.add_commit(entries);
        match target.write(&mut self.device, self.geometry, &appended)? {
            WriteOutcome::Done => Ok(()),
            WriteOutcome::SplitAdvised => {
                let compacted = appended.compact();
                match target.write(&mut self.device, self.geometry, &compacted)? {
                    WriteOutcome::Done => Ok(()),
                    _ => self.split_pair(target, &compacted),
                }
            }
            WriteOutcome::SplitRequired => self.split_pair(target, &appended),
        }
    }

    fn split_pair(&mut self, target: Pair, block: &Block) -> Result<(), Error> {
        let new_pair = Pair::new(self.allocate()?, self.allocate()?);
        debug!("splitting metadata pair {target:?}, upper half moves to {new_pair:?}");
        let (head, moved) = block.split(new_pair);
        // tail first: until the head commits its hard tail, the new pair is
        // just an unreachable allocation
        self.initialize_pair(new_pair, moved)?;
        match target.write(&mut self.device, self.geometry, &head)? {
            WriteOutcome::Done => Ok(()),
            _ => Err(Error::NoSpace),
        }
    }

    /// First write of a freshly allocated pair. Reused blocks may carry
    /// stale images with arbitrary revisions, so both members are rewritten
    /// with revisions that dominate whatever is there.
    fn initialize_pair(&mut self, target: Pair, entries: Vec<Entry>) -> Result<(), Error> {
        let (ra, rb) = target.revisions(&mut self.device, self.geometry);
        let base = if pair::newer(ra, rb) { ra } else { rb };
        let block = Block {
            revision_count: base.wrapping_add(1),
            commits: vec![Commit { entries }],
        };
        match target.write(&mut self.device, self.geometry, &block)? {
            WriteOutcome::Done => Ok(()),
            _ => Err(Error::NoSpace),
        }
    }

    fn write_ctz(&mut self, data: &[u8]) -> Result<CtzStruct, Error> {
        let block_size = self.geometry.block_size;
        let mut addresses: Vec<u32> = Vec::new();
        let mut offset = 0usize;
        let mut index: u32 = 0;
        while offset < data.len() {
            let capacity = ctz::capacity(index, block_size) as usize;
            let chunk = &data[offset..data.len().min(offset + capacity)];
            let pointers: Vec<u32> = (0..ctz::pointer_count(index))
                .map(|k| addresses[(index - (1 << k)) as usize])
                .collect();
            let address = self.allocate()?;
            self.device
                .write_block(address, &ctz::block_image(index, &pointers, chunk, block_size))?;
            addresses.push(address);
            offset += capacity;
            index += 1;
        }
        Ok(CtzStruct {
            head: *addresses.last().unwrap(),
            size: data.len() as u32,
        })
    }
}
