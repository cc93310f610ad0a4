//! Item heads and the per-kind body helpers the engine needs.

use crate::storage::tree::key::{read_u16, read_u32, Key, KeyType, KeyVersion, KEY_SIZE};
use crate::types::{BlockId, Result, StreeError};

/// Encoded size of an item head.
pub const IH_SIZE: usize = 24;
/// Size of one block pointer inside an indirect item.
pub const UNFM_P_SIZE: usize = 4;

const FREE_OR_COUNT_OFFSET: usize = KEY_SIZE;
const LEN_OFFSET: usize = KEY_SIZE + 2;
const LOCATION_OFFSET: usize = KEY_SIZE + 4;
const VERSION_OFFSET: usize = KEY_SIZE + 6;

/// Head of one item stored in a leaf.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ItemHead {
    /// Item key; its version is the item version.
    pub key: Key,
    /// Body length in bytes.
    pub len: u16,
    /// Offset of the body inside the leaf block.
    pub location: u16,
    /// Entry count for directory items, unused bytes of the last
    /// unformatted block for indirect items, zero otherwise.
    pub free_space_or_entries: u16,
}

impl ItemHead {
    /// Builds a head for a body of `len` bytes; the location is assigned when
    /// the leaf is packed.
    pub fn new(key: Key, len: u16, free_space_or_entries: u16) -> Self {
        Self {
            key,
            len,
            location: 0,
            free_space_or_entries,
        }
    }

    /// Item kind.
    pub fn kind(&self) -> KeyType {
        self.key.kind
    }

    /// Item format version.
    pub fn version(&self) -> KeyVersion {
        self.key.version
    }

    /// Number of directory entries in a directory item.
    pub fn entry_count(&self) -> u16 {
        self.free_space_or_entries
    }

    /// Unused bytes of the last unformatted block of an indirect item.
    pub fn free_space(&self) -> u16 {
        self.free_space_or_entries
    }

    /// Number of block pointers in an indirect item.
    pub fn pointer_count(&self) -> usize {
        usize::from(self.len) / UNFM_P_SIZE
    }

    /// Number of content bytes the item covers: pointers times block size
    /// minus the free space for indirect items, the length for direct items.
    pub fn op_bytes(&self, block_size: usize) -> u64 {
        match self.kind() {
            KeyType::Indirect => {
                (self.pointer_count() * block_size) as u64 - u64::from(self.free_space())
            }
            KeyType::Direct => u64::from(self.len),
            KeyType::StatData | KeyType::DirEntry | KeyType::Any => 0,
        }
    }

    /// Returns `true` if the head still describes the same item as `other`:
    /// same key, same length, same body location.
    pub fn same_item(&self, other: &ItemHead) -> bool {
        self.key == other.key && self.len == other.len && self.location == other.location
    }

    /// Writes the head into `out`.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < IH_SIZE {
            return Err(StreeError::Invalid("item head buffer too small"));
        }
        self.key.encode(&mut out[..KEY_SIZE])?;
        out[FREE_OR_COUNT_OFFSET..FREE_OR_COUNT_OFFSET + 2]
            .copy_from_slice(&self.free_space_or_entries.to_le_bytes());
        out[LEN_OFFSET..LEN_OFFSET + 2].copy_from_slice(&self.len.to_le_bytes());
        out[LOCATION_OFFSET..LOCATION_OFFSET + 2].copy_from_slice(&self.location.to_le_bytes());
        out[VERSION_OFFSET..VERSION_OFFSET + 2]
            .copy_from_slice(&self.key.version.as_u16().to_le_bytes());
        Ok(())
    }

    /// Reads a head from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IH_SIZE {
            return Err(StreeError::Corruption("item head truncated"));
        }
        let version = KeyVersion::from_u16(read_u16(bytes, VERSION_OFFSET))?;
        Ok(Self {
            key: Key::decode(&bytes[..KEY_SIZE], version)?,
            free_space_or_entries: read_u16(bytes, FREE_OR_COUNT_OFFSET),
            len: read_u16(bytes, LEN_OFFSET),
            location: read_u16(bytes, LOCATION_OFFSET),
        })
    }
}

/// An item copied out of a leaf, or about to be written into one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Item {
    /// Head; `len` always equals `body.len()`.
    pub head: ItemHead,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Item {
    /// Builds an item and sizes its head from `body`.
    pub fn new(key: Key, free_space_or_entries: u16, body: Vec<u8>) -> Result<Self> {
        let len = u16::try_from(body.len()).map_err(|_| StreeError::Invalid("item body too large"))?;
        Ok(Self {
            head: ItemHead::new(key, len, free_space_or_entries),
            body,
        })
    }

    /// Bytes the item occupies in a leaf, head included.
    pub fn footprint(&self) -> usize {
        IH_SIZE + self.body.len()
    }

    /// Re-derives `head.len` after the body changed.
    pub fn sync_len(&mut self) -> Result<()> {
        self.head.len =
            u16::try_from(self.body.len()).map_err(|_| StreeError::Invalid("item body too large"))?;
        Ok(())
    }
}

/// Reads pointer `index` of an indirect item body.
pub fn pointer_at(body: &[u8], index: usize) -> Result<BlockId> {
    let at = index * UNFM_P_SIZE;
    if at + UNFM_P_SIZE > body.len() {
        return Err(StreeError::Corruption("indirect pointer out of range"));
    }
    Ok(BlockId(read_u32(body, at)))
}

/// Overwrites pointer `index` of an indirect item body.
pub fn set_pointer(body: &mut [u8], index: usize, block: BlockId) -> Result<()> {
    let at = index * UNFM_P_SIZE;
    if at + UNFM_P_SIZE > body.len() {
        return Err(StreeError::Corruption("indirect pointer out of range"));
    }
    body[at..at + UNFM_P_SIZE].copy_from_slice(&block.0.to_le_bytes());
    Ok(())
}

/// Encodes a pointer array as an indirect item body.
pub fn encode_pointers(pointers: &[BlockId]) -> Vec<u8> {
    let mut body = Vec::with_capacity(pointers.len() * UNFM_P_SIZE);
    for block in pointers {
        body.extend_from_slice(&block.0.to_le_bytes());
    }
    body
}

/// Decodes every pointer of an indirect item body.
pub fn decode_pointers(body: &[u8]) -> Vec<BlockId> {
    body.chunks_exact(UNFM_P_SIZE)
        .map(|chunk| BlockId(read_u32(chunk, 0)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trips_with_version() -> Result<()> {
        for version in [KeyVersion::V1, KeyVersion::V2] {
            let key = Key::new(3, 9, 4097, KeyType::Indirect, version);
            let mut head = ItemHead::new(key, 12, 100);
            head.location = 4000;
            let mut buf = [0u8; IH_SIZE];
            head.encode(&mut buf)?;
            assert_eq!(ItemHead::decode(&buf)?, head);
        }
        Ok(())
    }

    #[test]
    fn indirect_op_bytes_subtracts_free_space() {
        let key = Key::new(1, 2, 1, KeyType::Indirect, KeyVersion::V1);
        let head = ItemHead::new(key, 12, 24);
        assert_eq!(head.pointer_count(), 3);
        assert_eq!(head.op_bytes(1024), 3 * 1024 - 24);
        let direct = ItemHead::new(key.with_kind(KeyType::Direct), 77, 0);
        assert_eq!(direct.op_bytes(1024), 77);
    }

    #[test]
    fn pointer_helpers_respect_bounds() -> Result<()> {
        let mut body = encode_pointers(&[BlockId(7), BlockId::NULL, BlockId(9)]);
        assert_eq!(pointer_at(&body, 2)?, BlockId(9));
        set_pointer(&mut body, 0, BlockId::NULL)?;
        assert_eq!(decode_pointers(&body), vec![BlockId::NULL, BlockId::NULL, BlockId(9)]);
        assert!(pointer_at(&body, 3).is_err());
        Ok(())
    }
}
