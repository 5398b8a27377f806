//! Block allocation. There is no persistent free list: the lookahead buffer
//! is reseeded on demand by walking everything reachable from the root pair
//! and offering the complement, one half of the address space at a time.

use std::collections::{BTreeSet, VecDeque};

use log::{debug, warn};

use crate::block::Link;
use crate::{ctz, pair, BlockDevice, Geometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Before,
    After,
}

#[derive(Debug)]
pub struct Lookahead {
    bias: Bias,
    free: VecDeque<u32>,
    /// Blocks handed out during the current operation. They are not yet
    /// reachable, so a refill mid-operation must not offer them again.
    pending: BTreeSet<u32>,
}

impl Lookahead {
    pub fn new() -> Self {
        Lookahead {
            bias: Bias::Before,
            free: VecDeque::new(),
            pending: BTreeSet::new(),
        }
    }

    pub fn next(&mut self) -> Option<u32> {
        let block = self.free.pop_front()?;
        self.pending.insert(block);
        Some(block)
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    #[allow(dead_code)]
    pub fn free_blocks(&self) -> Vec<u32> {
        self.free.iter().copied().collect()
    }

    #[allow(dead_code)]
    pub fn bias(&self) -> Bias {
        self.bias
    }

    /// The operation is over; anything it allocated is either reachable now
    /// or abandoned, and the next refill sorts out which.
    pub fn finish_operation(&mut self) {
        self.pending.clear();
    }

    /// Reseed from a fresh reachability scan: candidates are all blocks
    /// that are neither live nor handed out, split at the midpoint of the
    /// address space; the bias picks the half (falling back to the other
    /// when that half is exhausted) and flips for next time.
    pub fn refill(&mut self, live: &BTreeSet<u32>, block_count: u32) {
        let midpoint = block_count / 2;
        let (lower, upper): (Vec<u32>, Vec<u32>) = (0..block_count)
            .filter(|b| !live.contains(b) && !self.pending.contains(b))
            .partition(|&b| b < midpoint);
        let chosen = match self.bias {
            Bias::Before if !lower.is_empty() => lower,
            Bias::Before => upper,
            Bias::After if !upper.is_empty() => upper,
            Bias::After => lower,
        };
        self.bias = match self.bias {
            Bias::Before => Bias::After,
            Bias::After => Bias::Before,
        };
        debug!(
            "allocator refill: {} live, {} free, next bias {:?}",
            live.len(),
            chosen.len(),
            self.bias
        );
        self.free = chosen.into_iter().collect();
    }
}

impl Default for Lookahead {
    fn default() -> Self {
        Lookahead::new()
    }
}

/// Every block reachable from the root pair: metadata pairs along hard
/// tails and directory structs, and all blocks of CTZ chains. Unreadable
/// sub-branches are skipped; leaving their blocks out of the live set is
/// safe for a pair whose mate still reads (the mate keeps both addresses
/// live), and a branch where both members are gone is already lost.
pub fn live_blocks<D: BlockDevice>(device: &mut D, geometry: Geometry) -> BTreeSet<u32> {
    let mut live = BTreeSet::new();
    let mut visited: BTreeSet<(u32, u32)> = BTreeSet::new();
    let mut queue = vec![pair::ROOT];
    while let Some(p) = queue.pop() {
        if !visited.insert((p.a, p.b)) {
            continue;
        }
        live.insert(p.a);
        live.insert(p.b);
        let block = match p.read(device, geometry) {
            Ok(block) => block,
            Err(e) => {
                warn!("skipping unreadable metadata pair {p:?}: {e}");
                continue;
            }
        };
        for link in block.links() {
            match link {
                Link::Pair(child) => queue.push(child),
                Link::Ctz { head, size } => walk_ctz(device, geometry, head, size, &mut live),
            }
        }
    }
    live
}

fn walk_ctz<D: BlockDevice>(
    device: &mut D,
    geometry: Geometry,
    head: u32,
    size: u32,
    live: &mut BTreeSet<u32>,
) {
    if size == 0 {
        return;
    }
    let mut index = ctz::last_block_index(size, geometry.block_size);
    let mut address = head;
    loop {
        live.insert(address);
        if index == 0 {
            return;
        }
        let mut buf = vec![0u8; geometry.block_size as usize];
        if let Err(e) = device.read_block(address, &mut buf) {
            warn!("skipping tail of unreadable chain at block {address}: {e}");
            return;
        }
        address = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        index -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(blocks: &[u32]) -> BTreeSet<u32> {
        blocks.iter().copied().collect()
    }

    #[test]
    fn test_refill_takes_lower_half_first() {
        let mut lookahead = Lookahead::new();
        lookahead.refill(&live(&[0, 1]), 8);
        assert_eq!(lookahead.free_blocks(), vec![2, 3]);
        assert_eq!(lookahead.bias(), Bias::After);
    }

    #[test]
    fn test_consecutive_refills_cover_complement() {
        let mut lookahead = Lookahead::new();
        let live = live(&[0, 1, 5]);
        lookahead.refill(&live, 8);
        let first = lookahead.free_blocks();
        lookahead.refill(&live, 8);
        let second = lookahead.free_blocks();
        assert_eq!(first, vec![2, 3]);
        assert_eq!(second, vec![4, 6, 7]);
        assert!(first.iter().all(|b| !second.contains(b)));
    }

    #[test]
    fn test_refill_identical_modulo_bias() {
        let live = live(&[0, 1, 3]);
        let mut one = Lookahead::new();
        one.refill(&live, 8);
        one.refill(&live, 8);
        let mut two = Lookahead::new();
        two.refill(&live, 8);
        two.refill(&live, 8);
        assert_eq!(one.free_blocks(), two.free_blocks());
        assert_eq!(one.bias(), two.bias());
    }

    #[test]
    fn test_refill_falls_back_to_other_half() {
        let mut lookahead = Lookahead::new();
        // lower half fully live
        lookahead.refill(&live(&[0, 1, 2, 3]), 8);
        assert_eq!(lookahead.free_blocks(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_exhaustion_leaves_nothing() {
        let mut lookahead = Lookahead::new();
        lookahead.refill(&live(&[0, 1, 2, 3, 4, 5, 6, 7]), 8);
        assert!(lookahead.is_empty());
        assert_eq!(lookahead.next(), None);
    }

    #[test]
    fn test_pending_blocks_are_not_reoffered() {
        let mut lookahead = Lookahead::new();
        let live = live(&[0, 1]);
        lookahead.refill(&live, 8);
        let first = lookahead.next().unwrap();
        lookahead.refill(&live, 8);
        lookahead.refill(&live, 8);
        assert!(!lookahead.free_blocks().contains(&first));
        lookahead.finish_operation();
        lookahead.refill(&live, 8);
        lookahead.refill(&live, 8);
        let reoffered: Vec<u32> = lookahead.free_blocks();
        assert!(reoffered.contains(&first));
    }
}
