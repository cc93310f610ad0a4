//! Node format: block head, leaf item table, internal key/child table.
//!
//! A leaf stores item heads right after the block head and packs bodies
//! downward from the end of the block, item 0 highest. An internal node
//! stores `nr` keys followed by `nr + 1` child records.

use std::cmp::Ordering;

use crate::storage::tree::item::{Item, ItemHead, IH_SIZE};
use crate::storage::tree::key::{read_u16, read_u32, Key, KeyType, KEY_SIZE};
use crate::types::{BlockId, Result, StreeError};

/// Encoded size of the block head.
pub const BLKH_SIZE: usize = 8;
/// Encoded size of one child record.
pub const DC_SIZE: usize = 8;
/// Level of a leaf.
pub const LEAF_LEVEL: u16 = 1;
/// Deepest tree the engine will descend.
pub const MAX_HEIGHT: u16 = 8;

const LEVEL_OFFSET: usize = 0;
const NR_ITEMS_OFFSET: usize = 2;
const FREE_SPACE_OFFSET: usize = 4;

/// Largest item body a leaf of `block_size` bytes can hold.
pub fn max_item_len(block_size: usize) -> usize {
    block_size - BLKH_SIZE - IH_SIZE
}

/// Most keys an internal node of `block_size` bytes can hold.
pub fn max_internal_keys(block_size: usize) -> usize {
    (block_size - BLKH_SIZE - DC_SIZE) / (KEY_SIZE + DC_SIZE)
}

/// Decoded block head.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHead {
    /// `1` for leaves, at least `2` for internal nodes.
    pub level: u16,
    /// Items in a leaf, keys in an internal node.
    pub nr_items: u16,
    /// Unused bytes in the block.
    pub free_space: u16,
}

impl BlockHead {
    /// Reads the head at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLKH_SIZE {
            return Err(StreeError::Corruption("block shorter than its head"));
        }
        Ok(Self {
            level: read_u16(buf, LEVEL_OFFSET),
            nr_items: read_u16(buf, NR_ITEMS_OFFSET),
            free_space: read_u16(buf, FREE_SPACE_OFFSET),
        })
    }

    /// Writes the head at the start of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        buf[LEVEL_OFFSET..LEVEL_OFFSET + 2].copy_from_slice(&self.level.to_le_bytes());
        buf[NR_ITEMS_OFFSET..NR_ITEMS_OFFSET + 2].copy_from_slice(&self.nr_items.to_le_bytes());
        buf[FREE_SPACE_OFFSET..FREE_SPACE_OFFSET + 2]
            .copy_from_slice(&self.free_space.to_le_bytes());
        buf[6..BLKH_SIZE].fill(0);
    }
}

/// Child record of an internal node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskChild {
    /// Child block.
    pub block: BlockId,
    /// Bytes used in the child.
    pub size: u16,
}

/// Outcome of a binary search over a sorted table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchPos {
    /// Exact match at this index.
    Found(usize),
    /// No match; index of the first greater entry (possibly the length).
    NotFound(usize),
}

impl SearchPos {
    /// The index regardless of outcome.
    pub fn index(self) -> usize {
        match self {
            SearchPos::Found(i) | SearchPos::NotFound(i) => i,
        }
    }

    /// Returns `true` on an exact match.
    pub fn is_found(self) -> bool {
        matches!(self, SearchPos::Found(_))
    }
}

/// Binary search over `len` entries; `cmp(i)` orders entry `i` against the
/// target.
pub fn bin_search_by<F>(len: usize, mut cmp: F) -> Result<SearchPos>
where
    F: FnMut(usize) -> Result<Ordering>,
{
    let (mut lo, mut hi) = (0usize, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(mid)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(SearchPos::Found(mid)),
        }
    }
    Ok(SearchPos::NotFound(lo))
}

/// Binary search for `key` in a sorted key slice.
pub fn bin_search(key: &Key, keys: &[Key]) -> SearchPos {
    let mut lo = 0usize;
    let mut hi = keys.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match keys[mid].compare(key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return SearchPos::Found(mid),
        }
    }
    SearchPos::NotFound(lo)
}

/// Read-only view of a node image.
pub struct NodeView<'a> {
    buf: &'a [u8],
    head: BlockHead,
}

impl<'a> NodeView<'a> {
    /// Wraps a node image.
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        Ok(Self {
            head: BlockHead::parse(buf)?,
            buf,
        })
    }

    /// Decoded block head.
    pub fn head(&self) -> BlockHead {
        self.head
    }

    /// Node level.
    pub fn level(&self) -> u16 {
        self.head.level
    }

    /// Whether the node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.head.level == LEAF_LEVEL
    }

    /// Items (leaf) or keys (internal).
    pub fn nr_items(&self) -> usize {
        usize::from(self.head.nr_items)
    }

    /// Head of leaf item `index`.
    pub fn item_head(&self, index: usize) -> Result<ItemHead> {
        if index >= self.nr_items() {
            return Err(StreeError::Corruption("item index past nr_items"));
        }
        let at = BLKH_SIZE + index * IH_SIZE;
        let bytes = self
            .buf
            .get(at..at + IH_SIZE)
            .ok_or(StreeError::Corruption("item head outside block"))?;
        ItemHead::decode(bytes)
    }

    /// Body of an item whose head was read from this node.
    pub fn item_body(&self, head: &ItemHead) -> Result<&'a [u8]> {
        let start = usize::from(head.location);
        self.buf
            .get(start..start + usize::from(head.len))
            .ok_or(StreeError::Corruption("item body outside block"))
    }

    /// Copies leaf item `index` out of the node.
    pub fn item(&self, index: usize) -> Result<Item> {
        let head = self.item_head(index)?;
        Ok(Item {
            head,
            body: self.item_body(&head)?.to_vec(),
        })
    }

    /// Key of leaf item or internal separator `index`.
    pub fn key(&self, index: usize) -> Result<Key> {
        if self.is_leaf() {
            return Ok(self.item_head(index)?.key);
        }
        if index >= self.nr_items() {
            return Err(StreeError::Corruption("key index past nr_items"));
        }
        let at = BLKH_SIZE + index * KEY_SIZE;
        let bytes = self
            .buf
            .get(at..at + KEY_SIZE)
            .ok_or(StreeError::Corruption("internal key outside block"))?;
        Key::decode_detect(bytes)
    }

    /// Child record `index` of an internal node.
    pub fn child(&self, index: usize) -> Result<DiskChild> {
        if self.is_leaf() || index > self.nr_items() {
            return Err(StreeError::Corruption("child index out of range"));
        }
        let at = BLKH_SIZE + self.nr_items() * KEY_SIZE + index * DC_SIZE;
        let bytes = self
            .buf
            .get(at..at + DC_SIZE)
            .ok_or(StreeError::Corruption("child record outside block"))?;
        Ok(DiskChild {
            block: BlockId(read_u32(bytes, 0)),
            size: read_u16(bytes, 4),
        })
    }

    /// Binary search for `key` among this node's keys.
    pub fn search(&self, key: &Key) -> Result<SearchPos> {
        bin_search_by(self.nr_items(), |i| Ok(self.key(i)?.compare(key)))
    }
}

/// Checks that a node is structurally sound for the level the search
/// expects. Any mismatch is [`StreeError::Corruption`].
pub fn validate_node_shape(buf: &[u8], expected_level: u16, is_root: bool) -> Result<()> {
    let view = NodeView::new(buf)?;
    if view.level() != expected_level {
        return Err(StreeError::Corruption("node level differs from the expected level"));
    }
    if view.is_leaf() {
        validate_leaf(&view, buf.len(), is_root)
    } else if view.level() > LEAF_LEVEL && view.level() <= MAX_HEIGHT {
        validate_internal(&view, buf.len())
    } else {
        Err(StreeError::Corruption("node level out of range"))
    }
}

fn validate_leaf(view: &NodeView<'_>, block_size: usize, is_root: bool) -> Result<()> {
    let nr = view.nr_items();
    let free_space = usize::from(view.head().free_space);
    if free_space > block_size - BLKH_SIZE {
        return Err(StreeError::Corruption("leaf free space exceeds block"));
    }
    if nr == 0 {
        if !is_root {
            return Err(StreeError::Corruption("empty leaf below the root"));
        }
        if free_space != block_size - BLKH_SIZE {
            return Err(StreeError::Corruption("empty leaf free space mismatch"));
        }
        return Ok(());
    }
    if nr * (IH_SIZE + 1) > block_size - BLKH_SIZE {
        return Err(StreeError::Corruption("leaf holds too many items"));
    }
    let table_end = BLKH_SIZE + nr * IH_SIZE;
    let max_len = max_item_len(block_size);
    let mut prev_location = block_size;
    for i in 0..nr {
        let head = view.item_head(i)?;
        let location = usize::from(head.location);
        let len = usize::from(head.len);
        if location >= block_size || location < table_end {
            return Err(StreeError::Corruption("item location out of range"));
        }
        if len == 0 || len > max_len {
            return Err(StreeError::Corruption("item length out of range"));
        }
        if prev_location < location || prev_location - location != len {
            return Err(StreeError::Corruption("item bodies are not contiguous"));
        }
        if head.kind() == KeyType::Any {
            return Err(StreeError::Corruption("wildcard key stored in a leaf"));
        }
        prev_location = location;
    }
    let used = table_end + (block_size - prev_location);
    if used != block_size - free_space {
        return Err(StreeError::Corruption("leaf free space does not match its items"));
    }
    Ok(())
}

fn validate_internal(view: &NodeView<'_>, block_size: usize) -> Result<()> {
    let nr = view.nr_items();
    if nr > max_internal_keys(block_size) {
        return Err(StreeError::Corruption("internal node holds too many keys"));
    }
    let used = BLKH_SIZE + nr * KEY_SIZE + (nr + 1) * DC_SIZE;
    if used != block_size - usize::from(view.head().free_space) {
        return Err(StreeError::Corruption("internal free space does not match its keys"));
    }
    Ok(())
}

/// Owned copy of a leaf, edited by the balancer and written back whole.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LeafImage {
    /// Items in key order.
    pub items: Vec<Item>,
}

impl LeafImage {
    /// Copies every item out of a leaf image.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let view = NodeView::new(buf)?;
        if !view.is_leaf() {
            return Err(StreeError::Corruption("expected a leaf"));
        }
        let items = (0..view.nr_items())
            .map(|i| view.item(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { items })
    }

    /// Bytes the items need, block head included.
    pub fn used_bytes(&self) -> usize {
        BLKH_SIZE + self.items.iter().map(Item::footprint).sum::<usize>()
    }

    /// Writes the items into `buf`, assigning body locations.
    pub fn write(&mut self, buf: &mut [u8]) -> Result<()> {
        let block_size = buf.len();
        let used = self.used_bytes();
        if used > block_size {
            return Err(StreeError::Invalid("items do not fit in one leaf"));
        }
        let nr = u16::try_from(self.items.len())
            .map_err(|_| StreeError::Invalid("too many items for one leaf"))?;
        buf.fill(0);
        BlockHead {
            level: LEAF_LEVEL,
            nr_items: nr,
            free_space: (block_size - used) as u16,
        }
        .write(buf);
        let mut location = block_size;
        for (i, item) in self.items.iter_mut().enumerate() {
            item.sync_len()?;
            location -= item.body.len();
            item.head.location = location as u16;
            buf[location..location + item.body.len()].copy_from_slice(&item.body);
            let at = BLKH_SIZE + i * IH_SIZE;
            item.head.encode(&mut buf[at..at + IH_SIZE])?;
        }
        Ok(())
    }
}

/// Owned copy of an internal node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InternalImage {
    /// Node level.
    pub level: u16,
    /// Separator keys.
    pub keys: Vec<Key>,
    /// Child records, one more than keys.
    pub children: Vec<DiskChild>,
}

impl InternalImage {
    /// Copies keys and child records out of an internal node image.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let view = NodeView::new(buf)?;
        if view.is_leaf() {
            return Err(StreeError::Corruption("expected an internal node"));
        }
        let nr = view.nr_items();
        let keys = (0..nr).map(|i| view.key(i)).collect::<Result<Vec<_>>>()?;
        let children = (0..=nr).map(|i| view.child(i)).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            level: view.level(),
            keys,
            children,
        })
    }

    /// Bytes the table needs, block head included.
    pub fn used_bytes(&self) -> usize {
        BLKH_SIZE + self.keys.len() * KEY_SIZE + self.children.len() * DC_SIZE
    }

    /// Writes the table into `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if self.children.len() != self.keys.len() + 1 {
            return Err(StreeError::Invalid("internal node needs one more child than keys"));
        }
        let block_size = buf.len();
        if self.keys.len() > max_internal_keys(block_size) {
            return Err(StreeError::Invalid("keys do not fit in one internal node"));
        }
        buf.fill(0);
        BlockHead {
            level: self.level,
            nr_items: self.keys.len() as u16,
            free_space: (block_size - self.used_bytes()) as u16,
        }
        .write(buf);
        for (i, key) in self.keys.iter().enumerate() {
            let at = BLKH_SIZE + i * KEY_SIZE;
            key.encode(&mut buf[at..at + KEY_SIZE])?;
        }
        let base = BLKH_SIZE + self.keys.len() * KEY_SIZE;
        for (i, child) in self.children.iter().enumerate() {
            let at = base + i * DC_SIZE;
            buf[at..at + 4].copy_from_slice(&child.block.0.to_le_bytes());
            buf[at + 4..at + 6].copy_from_slice(&child.size.to_le_bytes());
        }
        Ok(())
    }
}

/// Writes an empty leaf into `buf`.
pub fn format_empty_leaf(buf: &mut [u8]) -> Result<()> {
    LeafImage::default().write(buf)
}
