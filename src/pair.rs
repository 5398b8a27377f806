use binrw::{binrw, BinRead};
use log::{trace, warn};
use std::io::Cursor;

use crate::block::{Block, Serialized};
use crate::serialization::binwrite_as_buf;
use crate::{BlockDevice, Error, Geometry};

/// The root metadata pair lives at fixed addresses.
pub const ROOT: Pair = Pair { a: 0, b: 1 };

/// Two physical blocks alternately holding revisions of one logical
/// metadata block. On disk (tail and directory struct payloads) a pair is
/// two little-endian words.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pair {
    pub a: u32,
    pub b: u32,
}

/// Revision comparison uses the signed wrapping difference, so the scheme
/// survives the revision counter rolling over.
pub fn newer(r1: u32, r2: u32) -> bool {
    r1.wrapping_sub(r2) as i32 > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Done,
    SplitAdvised,
    SplitRequired,
}

impl Pair {
    pub fn new(a: u32, b: u32) -> Self {
        Pair { a, b }
    }

    pub fn blocks(&self) -> [u32; 2] {
        [self.a, self.b]
    }

    pub fn to_payload(&self) -> Vec<u8> {
        binwrite_as_buf(self).unwrap()
    }

    pub fn from_payload(buf: &[u8]) -> Result<Pair, Error> {
        if buf.len() != 8 {
            return Err(Error::Corrupt);
        }
        Pair::read_le(&mut Cursor::new(buf)).map_err(|_| Error::Corrupt)
    }

    /// Raw revision words of both members (0 where a member is unreadable).
    pub fn revisions<D: BlockDevice>(&self, device: &mut D, geometry: Geometry) -> (u32, u32) {
        let mut revisions = [0u32; 2];
        for (slot, address) in self.blocks().into_iter().enumerate() {
            let mut buf = vec![0u8; geometry.block_size as usize];
            if device.read_block(address, &mut buf).is_ok() {
                revisions[slot] = u32::from_le_bytes(buf[0..4].try_into().unwrap());
            }
        }
        (revisions[0], revisions[1])
    }

    /// Read the current block of the pair: the member with the greater
    /// revision, among members that carry at least one valid commit (a
    /// member whose image has none is blank or a torn program and must lose
    /// to its mate). Ties go to the first member. `Corrupt` only when
    /// neither member yields a parseable image.
    pub fn read<D: BlockDevice>(&self, device: &mut D, geometry: Geometry) -> Result<Block, Error> {
        let mut images: [Option<Block>; 2] = [None, None];
        for (slot, address) in self.blocks().into_iter().enumerate() {
            let mut buf = vec![0u8; geometry.block_size as usize];
            match device.read_block(address, &mut buf) {
                Ok(()) => images[slot] = Block::parse(geometry.program_size, &buf).ok(),
                Err(e) => warn!("unreadable block {address} of pair {self:?}: {e}"),
            }
        }
        let [first, second] = images;
        match (first, second) {
            (None, None) => Err(Error::Corrupt),
            (Some(block), None) | (None, Some(block)) => Ok(block),
            (Some(a), Some(b)) => Ok(match (a.commits.is_empty(), b.commits.is_empty()) {
                (false, true) => a,
                (true, false) => b,
                _ => {
                    if newer(b.revision_count, a.revision_count) {
                        b
                    } else {
                        a
                    }
                }
            }),
        }
    }

    /// Program a new logical block to the pair: the stale member first at
    /// the block's revision, then the other member at revision + 1, so a
    /// crash at any point leaves one complete image readable. A program
    /// failure is reported as requiring a split (relocation is the only
    /// recovery this layer can ask for).
    pub fn write<D: BlockDevice>(
        &self,
        device: &mut D,
        geometry: Geometry,
        block: &Block,
    ) -> Result<WriteOutcome, Error> {
        let image = match block.serialize(geometry)? {
            Serialized::Fits(image) => image,
            Serialized::SplitAdvised(image) => {
                trace!("{} bytes leave no spare room in pair {self:?}", image.len());
                return Ok(WriteOutcome::SplitAdvised);
            }
            Serialized::SplitRequired => return Ok(WriteOutcome::SplitRequired),
        };
        let (ra, rb) = self.revisions(device, geometry);
        let (stale, current) = if newer(ra, rb) {
            (self.b, self.a)
        } else {
            (self.a, self.b)
        };
        if let Err(e) = device.write_block(stale, &image) {
            warn!("program failure on block {stale}: {e}");
            return Ok(WriteOutcome::SplitRequired);
        }
        let mate = block.with_revision(block.revision_count.wrapping_add(1));
        let mate_image = match mate.serialize(geometry)? {
            Serialized::Fits(image) | Serialized::SplitAdvised(image) => image,
            Serialized::SplitRequired => return Ok(WriteOutcome::SplitRequired),
        };
        if let Err(e) = device.write_block(current, &mate_image) {
            warn!("program failure on block {current}: {e}");
            return Ok(WriteOutcome::SplitRequired);
        }
        Ok(WriteOutcome::Done)
    }
}
