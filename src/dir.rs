//! Directory traversal. A directory is a chain of metadata pairs joined by
//! hard-tail entries; names resolve to ids within the pair that holds them.

use std::collections::BTreeSet;

use crate::block::Block;
use crate::entry::Entry;
use crate::pair::Pair;
use crate::tag;
use crate::{BlockDevice, Error, Geometry};

/// What a directory entry is, as reported by `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Value,
    Dictionary,
}

/// Outcome of walking a path through the directory tree.
#[derive(Debug)]
pub enum Walk {
    /// Every segment resolved; the path names this directory.
    Basename(Pair),
    /// A segment's name is present but its entries are unusable.
    NoEntry,
    /// A segment's name is absent from its directory.
    NoId(String),
    /// A segment's name is present but names a value, not a directory.
    NoStructs(String),
}

/// All pairs of a directory chain, in order, with their current blocks.
/// A malformed tail that loops back terminates the walk.
pub fn chain<D: BlockDevice>(
    device: &mut D,
    geometry: Geometry,
    start: Pair,
) -> Result<Vec<(Pair, Block)>, Error> {
    let mut result = Vec::new();
    let mut visited: BTreeSet<(u32, u32)> = BTreeSet::new();
    let mut current = Some(start);
    while let Some(p) = current {
        if !visited.insert((p.a, p.b)) {
            break;
        }
        let block = p.read(device, geometry)?;
        current = block
            .compacted_entries()
            .iter()
            .find(|e| e.tag.is_hardtail())
            .and_then(|e| Pair::from_payload(&e.data).ok());
        result.push((p, block));
    }
    Ok(result)
}

/// Find `name` anywhere in the chain of `start`; returns the pair that
/// holds it together with the compacted entries of its id (the name entry
/// first, then its structs). The superblock's anchor name is not a
/// directory entry and never matches.
pub fn entries_of_name<D: BlockDevice>(
    device: &mut D,
    geometry: Geometry,
    start: Pair,
    name: &str,
) -> Result<Option<(Pair, Vec<Entry>)>, Error> {
    for (p, block) in chain(device, geometry, start)? {
        let compacted = block.compacted_entries();
        let found = compacted.iter().find(|e| {
            e.tag.is_name() && e.tag.chunk != tag::CHUNK_SUPERBLOCK && e.data == name.as_bytes()
        });
        if let Some(name_entry) = found {
            let id = name_entry.tag.id;
            let entries: Vec<Entry> = compacted
                .iter()
                .filter(|e| e.tag.has_id() && e.tag.id == id)
                .cloned()
                .collect();
            return Ok(Some((p, entries)));
        }
    }
    Ok(None)
}

/// Walk `segments` down from `root`, descending through directory structs.
pub fn find<D: BlockDevice>(
    device: &mut D,
    geometry: Geometry,
    root: Pair,
    segments: &[&str],
) -> Result<Walk, Error> {
    let mut current = root;
    for &segment in segments {
        let Some((_, entries)) = entries_of_name(device, geometry, current, segment)? else {
            return Ok(Walk::NoId(segment.to_string()));
        };
        let Some(structure) = entries
            .iter()
            .find(|e| e.tag.is_struct() && e.tag.chunk == tag::CHUNK_DIR_STRUCT)
        else {
            return Ok(Walk::NoStructs(segment.to_string()));
        };
        match Pair::from_payload(&structure.data) {
            Ok(child) => current = child,
            Err(_) => return Ok(Walk::NoEntry),
        }
    }
    Ok(Walk::Basename(current))
}

/// Names and kinds across the whole chain of a directory.
pub fn list<D: BlockDevice>(
    device: &mut D,
    geometry: Geometry,
    start: Pair,
) -> Result<Vec<(String, Kind)>, Error> {
    let mut names = Vec::new();
    for (_, block) in chain(device, geometry, start)? {
        for e in block.compacted_entries() {
            if !e.tag.is_name() {
                continue;
            }
            let kind = match e.tag.chunk {
                tag::CHUNK_FILE => Kind::Value,
                tag::CHUNK_DIR => Kind::Dictionary,
                _ => continue,
            };
            names.push((String::from_utf8_lossy(&e.data).into_owned(), kind));
        }
    }
    Ok(names)
}
