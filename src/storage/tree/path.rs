//! Root-to-node chain of pinned blocks and the delimiting-key checks built
//! on it.

use smallvec::SmallVec;

use crate::primitives::concurrency::GenerationSnapshot;
use crate::primitives::pager::BlockRef;
use crate::storage::tree::item::ItemHead;
use crate::storage::tree::key::{Key, MAX_KEY, MIN_KEY};
use crate::storage::tree::node::NodeView;
use crate::types::{BlockId, Result, StreeError};

/// One pinned node and the position the path took through it: the child
/// index in an internal node, the item index in a leaf.
#[derive(Debug)]
pub struct PathElement {
    /// Pinned node.
    pub block: BlockRef,
    /// Position inside the node.
    pub position: usize,
}

/// Ordered chain of pinned nodes from the root to the node being examined.
///
/// Every pin is released exactly once, leaf to root, when the path is
/// released or dropped.
#[derive(Debug, Default)]
pub struct TreePath {
    elements: SmallVec<[PathElement; 8]>,
    pos_in_item: usize,
    snapshot: Option<GenerationSnapshot>,
}

impl TreePath {
    /// Creates an empty path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pinned nodes.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` when nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Appends a node one level below the current top.
    pub fn push(&mut self, block: BlockRef, position: usize) {
        self.elements.push(PathElement { block, position });
    }

    /// Element `index`, counted from the root.
    pub fn element(&self, index: usize) -> Option<&PathElement> {
        self.elements.get(index)
    }

    /// The node currently being examined.
    pub fn top(&self) -> Result<&PathElement> {
        self.elements
            .last()
            .ok_or(StreeError::Invalid("path is empty"))
    }

    /// Mutable access to the top element.
    pub fn top_mut(&mut self) -> Result<&mut PathElement> {
        self.elements
            .last_mut()
            .ok_or(StreeError::Invalid("path is empty"))
    }

    /// Pinned leaf at the end of a completed search.
    pub fn leaf(&self) -> Result<&BlockRef> {
        Ok(&self.top()?.block)
    }

    /// Item position inside the leaf.
    pub fn item_position(&self) -> Result<usize> {
        Ok(self.top()?.position)
    }

    /// Moves the leaf position, used when a search steps back one item.
    pub fn set_item_position(&mut self, position: usize) -> Result<()> {
        self.top_mut()?.position = position;
        Ok(())
    }

    /// Position inside the item: bytes for direct items, pointer slots for
    /// indirect items, entry index for directory items.
    pub fn pos_in_item(&self) -> usize {
        self.pos_in_item
    }

    /// Sets the position inside the item.
    pub fn set_pos_in_item(&mut self, pos: usize) {
        self.pos_in_item = pos;
    }

    /// Generation observed when the search completed.
    pub fn snapshot(&self) -> Option<GenerationSnapshot> {
        self.snapshot
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: GenerationSnapshot) {
        self.snapshot = Some(snapshot);
    }

    /// Head of the item the path points at.
    pub fn item_head(&self) -> Result<ItemHead> {
        let top = self.top()?;
        let data = top.block.data();
        NodeView::new(&data)?.item_head(top.position)
    }

    /// Releases every pin, leaf first.
    pub fn release(&mut self) {
        while let Some(element) = self.elements.pop() {
            drop(element);
        }
        self.pos_in_item = 0;
        self.snapshot = None;
    }
}

impl Drop for TreePath {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Smallest key that may live under the path's current top.
///
/// A bound broken by a concurrent change yields [`MAX_KEY`] so that
/// [`key_in_buffer`] fails and the caller restarts.
pub fn left_delimiting_key(path: &TreePath, root: BlockId) -> Result<Key> {
    delimiting_key(path, root, Side::Left)
}

/// Key bounding the path's current top from above (exclusive).
///
/// A broken bound yields [`MIN_KEY`].
pub fn right_delimiting_key(path: &TreePath, root: BlockId) -> Result<Key> {
    delimiting_key(path, root, Side::Right)
}

fn delimiting_key(path: &TreePath, root: BlockId, side: Side) -> Result<Key> {
    let broken = match side {
        Side::Left => MAX_KEY,
        Side::Right => MIN_KEY,
    };
    if path.is_empty() {
        return Ok(broken);
    }
    for offset in (0..path.len() - 1).rev() {
        let parent = &path.elements[offset];
        let child = &path.elements[offset + 1];
        if !parent.block.is_in_tree() {
            return Ok(broken);
        }
        let data = parent.block.data();
        let view = NodeView::new(&data)?;
        if view.is_leaf() || parent.position > view.nr_items() {
            return Ok(broken);
        }
        if view.child(parent.position)?.block != child.block.id() {
            return Ok(broken);
        }
        match side {
            Side::Left if parent.position > 0 => return view.key(parent.position - 1),
            Side::Right if parent.position < view.nr_items() => {
                return view.key(parent.position)
            }
            _ => {}
        }
    }
    if path.elements[0].block.id() == root {
        Ok(match side {
            Side::Left => MIN_KEY,
            Side::Right => MAX_KEY,
        })
    } else {
        Ok(broken)
    }
}

/// Returns `true` if `key` lies within the delimiting keys of the path's
/// current top: `left <= key < right`.
pub fn key_in_buffer(path: &TreePath, key: &Key, root: BlockId) -> Result<bool> {
    if left_delimiting_key(path, root)?.compare(key).is_gt() {
        return Ok(false);
    }
    Ok(key.compare(&right_delimiting_key(path, root)?).is_lt())
}
