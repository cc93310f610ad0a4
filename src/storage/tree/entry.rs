//! Directory entries: the entry table codec, the name hash and the entry
//! search used for directory keys.

use crate::storage::tree::item::ItemHead;
use crate::storage::tree::key::{read_u16, read_u32, Key, DOT_DOT_OFFSET, DOT_OFFSET};
use crate::storage::tree::node::{bin_search_by, SearchPos};
use crate::types::{Result, StreeError};

/// Encoded size of one entry head.
pub const DEH_SIZE: usize = 16;

const DEH_VISIBLE: u16 = 1 << 2;
const HASH_MASK: u32 = 0x7fff_ff80;
/// Hash value reserved for the first entry whose name hashes to zero.
pub const MIN_HASH: u32 = 128;
/// Collision generations available under one hash value.
pub const MAX_GENERATION: u32 = 0x7f;

/// One directory entry: name and the key of the object it names.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Hash of the name plus a collision generation in the low bits.
    pub offset: u32,
    /// Parent directory of the named object.
    pub dir_id: u32,
    /// Named object.
    pub object_id: u32,
    /// Raw name bytes.
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Bytes the entry takes inside a directory item.
    pub fn encoded_len(&self) -> usize {
        DEH_SIZE + self.name.len()
    }
}

/// Decodes every entry of a directory item.
pub fn decode_entries(head: &ItemHead, body: &[u8]) -> Result<Vec<DirEntry>> {
    let count = usize::from(head.entry_count());
    if count * DEH_SIZE > body.len() {
        return Err(StreeError::Corruption("entry table larger than its item"));
    }
    let mut entries = Vec::with_capacity(count);
    let mut name_end = body.len();
    for i in 0..count {
        let at = i * DEH_SIZE;
        let location = usize::from(read_u16(body, at + 12));
        if location < count * DEH_SIZE || location > name_end {
            return Err(StreeError::Corruption("entry name location out of range"));
        }
        entries.push(DirEntry {
            offset: read_u32(body, at),
            dir_id: read_u32(body, at + 4),
            object_id: read_u32(body, at + 8),
            name: body[location..name_end].to_vec(),
        });
        name_end = location;
    }
    Ok(entries)
}

/// Encodes entries into a directory item body; names are packed from the
/// end, entry 0 last.
pub fn encode_entries(entries: &[DirEntry]) -> Result<Vec<u8>> {
    let total: usize = entries.iter().map(DirEntry::encoded_len).sum();
    let mut body = vec![0u8; total];
    let mut name_end = total;
    for (i, entry) in entries.iter().enumerate() {
        let location = name_end - entry.name.len();
        let location_u16 =
            u16::try_from(location).map_err(|_| StreeError::Invalid("directory item too large"))?;
        let at = i * DEH_SIZE;
        body[at..at + 4].copy_from_slice(&entry.offset.to_le_bytes());
        body[at + 4..at + 8].copy_from_slice(&entry.dir_id.to_le_bytes());
        body[at + 8..at + 12].copy_from_slice(&entry.object_id.to_le_bytes());
        body[at + 12..at + 14].copy_from_slice(&location_u16.to_le_bytes());
        body[at + 14..at + 16].copy_from_slice(&DEH_VISIBLE.to_le_bytes());
        body[location..name_end].copy_from_slice(&entry.name);
        name_end = location;
    }
    Ok(body)
}

/// Encoded length of entry `index`, head included.
pub fn entry_len(head: &ItemHead, body: &[u8], index: usize) -> Result<usize> {
    let count = usize::from(head.entry_count());
    if index >= count || count * DEH_SIZE > body.len() {
        return Err(StreeError::Corruption("entry index out of range"));
    }
    let location = usize::from(read_u16(body, index * DEH_SIZE + 12));
    let name_end = if index == 0 {
        body.len()
    } else {
        usize::from(read_u16(body, (index - 1) * DEH_SIZE + 12))
    };
    if location > name_end {
        return Err(StreeError::Corruption("entry names overlap"));
    }
    Ok(DEH_SIZE + name_end - location)
}

/// Hash of a name with the collision bits cleared. `.` and `..` have fixed
/// offsets.
pub fn name_hash(name: &[u8]) -> u32 {
    match name {
        b"." => DOT_OFFSET as u32,
        b".." => DOT_DOT_OFFSET as u32,
        _ => {
            let mut acc: u32 = 0;
            for &byte in name {
                let signed = i32::from(byte as i8);
                acc = acc.wrapping_add((signed << 4) as u32);
                acc = acc.wrapping_add((signed >> 4) as u32);
                acc = acc.wrapping_mul(11);
            }
            match acc & HASH_MASK {
                0 => MIN_HASH,
                hash => hash,
            }
        }
    }
}

/// Locates an entry inside a directory item.
pub trait EntrySearch: Send + Sync {
    /// Finds the entry whose offset equals `key.offset`, or the index of the
    /// first entry past it.
    fn locate(&self, head: &ItemHead, body: &[u8], key: &Key) -> Result<SearchPos>;
}

/// Binary search over the entry offsets.
#[derive(Clone, Copy, Debug, Default)]
pub struct OffsetEntrySearch;

impl EntrySearch for OffsetEntrySearch {
    fn locate(&self, head: &ItemHead, body: &[u8], key: &Key) -> Result<SearchPos> {
        let count = usize::from(head.entry_count());
        if count * DEH_SIZE > body.len() {
            return Err(StreeError::Corruption("entry table larger than its item"));
        }
        bin_search_by(count, |i| {
            let offset = u64::from(read_u32(body, i * DEH_SIZE));
            Ok(offset.cmp(&key.offset))
        })
    }
}
