use crate::pair::Pair;
use crate::tag::{self, AbstractType, Tag};

/// One unit of metadata: a tag and its payload. The payload length always
/// equals the tag's length field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub tag: Tag,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(tag: Tag, data: Vec<u8>) -> Self {
        debug_assert_eq!(tag.length as usize, data.len());
        Entry { tag, data }
    }

    /// On-disk length: the tag word plus the payload.
    #[allow(dead_code)]
    pub fn disk_len(&self) -> usize {
        4 + self.data.len()
    }

    pub fn file_name(id: u16, name: &str) -> Entry {
        Entry::new(
            Tag::new(AbstractType::Name, tag::CHUNK_FILE, id, name.len() as u16),
            name.as_bytes().to_vec(),
        )
    }

    pub fn dir_name(id: u16, name: &str) -> Entry {
        Entry::new(
            Tag::new(AbstractType::Name, tag::CHUNK_DIR, id, name.len() as u16),
            name.as_bytes().to_vec(),
        )
    }

    pub fn inline_struct(id: u16, data: &[u8]) -> Entry {
        Entry::new(
            Tag::new(
                AbstractType::Struct,
                tag::CHUNK_INLINE_STRUCT,
                id,
                data.len() as u16,
            ),
            data.to_vec(),
        )
    }

    pub fn dir_struct(id: u16, pair: Pair) -> Entry {
        let payload = pair.to_payload();
        Entry::new(
            Tag::new(
                AbstractType::Struct,
                tag::CHUNK_DIR_STRUCT,
                id,
                payload.len() as u16,
            ),
            payload,
        )
    }

    pub fn hardtail(pair: Pair) -> Entry {
        let payload = pair.to_payload();
        Entry::new(
            Tag::new(
                AbstractType::Tail,
                tag::CHUNK_HARD_TAIL,
                tag::NO_ID,
                payload.len() as u16,
            ),
            payload,
        )
    }

    pub fn delete(id: u16) -> Entry {
        Entry::new(Tag::delete(id), Vec::new())
    }
}

/// Replay an entry list into its minimal equivalent form.
///
/// A later entry for the same id and abstract type replaces the earlier one
/// in place; a splice-delete drops every entry of its id and renumbers all
/// higher ids down by one, then vanishes itself. Ordering is stable by
/// first occurrence.
pub fn compact(entries: &[Entry]) -> Vec<Entry> {
    let mut compacted: Vec<Entry> = Vec::new();
    for entry in entries {
        if entry.tag.is_delete() {
            let id = entry.tag.id;
            compacted.retain(|e| !(e.tag.has_id() && e.tag.id == id));
            for e in compacted.iter_mut() {
                if e.tag.has_id() && e.tag.id > id {
                    e.tag.id -= 1;
                }
            }
        } else if let Some(slot) = compacted.iter_mut().find(|e| {
            e.tag.id == entry.tag.id && e.tag.abstract_type == entry.tag.abstract_type
        }) {
            *slot = entry.clone();
        } else {
            compacted.push(entry.clone());
        }
    }
    compacted
}
