//! Structural rebalancing.
//!
//! The engine plans every change and hands it to a [`Balancer`] together with
//! the path its plan was made on. The balancer either applies the change or
//! reports [`Balanced::Repeat`] when the tree moved since the path was built,
//! in which case the caller re-searches and plans again.
//!
//! [`SimpleBalancer`] is the in-memory implementation: it rebuilds the target
//! leaf, splits it greedily when it overflows, pushes separators up through
//! the internal levels, and unlinks nodes that become empty.

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::entry::{decode_entries, encode_entries};
use super::item::{Item, ItemHead, UNFM_P_SIZE};
use super::key::{Key, KeyType};
use super::node::{
    format_empty_leaf, max_internal_keys, max_item_len, DiskChild, InternalImage, LeafImage,
    NodeView, BLKH_SIZE, LEAF_LEVEL,
};
use super::path::TreePath;
use super::{RootInfo, TreeContext};
use crate::primitives::pager::{BlockRef, FrameUse};
use crate::primitives::wal::Transaction;
use crate::types::{Result, StreeError};

/// One structural change, applied at the item the path points at.
#[derive(Clone, Copy, Debug)]
pub enum BalanceOp<'a> {
    /// Insert a new item before the path's item position.
    Insert(&'a Item),
    /// Grow the item: append to direct and indirect items, or insert one
    /// encoded entry at the path's in-item position for directory items.
    Paste(&'a [u8]),
    /// Remove `delta` bytes starting at the path's in-item position (one
    /// entry for directory items). Only tails of file items can be cut.
    Cut {
        /// Bytes to remove.
        delta: usize,
    },
    /// Remove the whole item.
    Delete,
}

/// Result of a balance attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Balanced {
    /// The change is in the tree.
    Applied,
    /// The tree changed after the path was built; search again and re-plan.
    Repeat,
}

/// Performs structural changes on behalf of the mutation primitives.
///
/// Implementations bracket every change with
/// [`Generation::begin_change`](crate::primitives::concurrency::Generation::begin_change)
/// so readers see it, and fail with `OutOfSpace` or `Io` without leaving a
/// partial change behind.
pub trait Balancer: Send + Sync {
    /// Applies `op` at `path`.
    fn balance(
        &self,
        ctx: &TreeContext,
        txn: &mut Transaction,
        path: &TreePath,
        op: BalanceOp<'_>,
    ) -> Result<Balanced>;
}

/// In-memory balancer; serialises structural changes behind its own lock.
#[derive(Default)]
pub struct SimpleBalancer {
    serial: Mutex<()>,
}

impl SimpleBalancer {
    /// Creates a balancer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for SimpleBalancer {
    fn balance(
        &self,
        ctx: &TreeContext,
        txn: &mut Transaction,
        path: &TreePath,
        op: BalanceOp<'_>,
    ) -> Result<Balanced> {
        let _serial = self.serial.lock();
        let leaf = path.leaf()?.clone();
        let fresh = path
            .snapshot()
            .map_or(false, |snapshot| !ctx.generation().changed_since(snapshot));
        if !fresh || !leaf.is_in_tree() {
            ctx.stats().inc_balance_repeats();
            debug!(target: "stree::balance", leaf = leaf.id().0, "path is stale; asking for a repeat");
            return Ok(Balanced::Repeat);
        }
        let change = ctx.generation().begin_change();
        let position = path.item_position()?;
        let mut image = LeafImage::decode(&leaf.data())?;
        let old_first = image.items.first().map(|item| item.head.key);
        apply_to_leaf(&mut image, position, path.pos_in_item(), op, ctx.block_size())?;

        let mut edit = TreeEdit { ctx, txn, path };
        let leaf_index = path.len() - 1;
        if image.items.is_empty() && leaf_index > 0 {
            edit.unlink(leaf_index)?;
        } else if image.used_bytes() <= ctx.block_size() {
            image.write(&mut leaf.data_mut())?;
            edit.txn.mark_dirty(&leaf);
            if let Some(first) = image.items.first() {
                if Some(first.head.key) != old_first {
                    edit.fix_left_key(leaf_index, first.head.key)?;
                }
            }
        } else {
            edit.split_leaf(&leaf, image, old_first)?;
        }
        let generation = change.finish();
        trace!(target: "stree::balance", ?op, generation = generation.0, "balanced");
        Ok(Balanced::Applied)
    }
}

fn apply_to_leaf(
    image: &mut LeafImage,
    position: usize,
    pos_in_item: usize,
    op: BalanceOp<'_>,
    block_size: usize,
) -> Result<()> {
    let max_len = max_item_len(block_size);
    match op {
        BalanceOp::Insert(item) => {
            if position > image.items.len() {
                return Err(StreeError::Invalid("insert position past the leaf end"));
            }
            if item.body.is_empty() || item.body.len() > max_len {
                return Err(StreeError::Invalid("item length out of range"));
            }
            let mut item = item.clone();
            item.sync_len()?;
            image.items.insert(position, item);
        }
        BalanceOp::Paste(bytes) => {
            let item = image
                .items
                .get_mut(position)
                .ok_or(StreeError::Invalid("paste position past the last item"))?;
            match item.head.kind() {
                KeyType::Direct => item.body.extend_from_slice(bytes),
                KeyType::Indirect => {
                    if bytes.len() % UNFM_P_SIZE != 0 {
                        return Err(StreeError::Invalid("indirect paste is not whole pointers"));
                    }
                    item.body.extend_from_slice(bytes);
                }
                KeyType::DirEntry => {
                    let len = u16::try_from(bytes.len())
                        .map_err(|_| StreeError::Invalid("entry too large"))?;
                    let pasted = decode_entries(&ItemHead::new(item.head.key, len, 1), bytes)?;
                    let mut entries = decode_entries(&item.head, &item.body)?;
                    if pos_in_item > entries.len() {
                        return Err(StreeError::Invalid("entry position past the item end"));
                    }
                    entries.splice(pos_in_item..pos_in_item, pasted);
                    item.body = encode_entries(&entries)?;
                    item.head.free_space_or_entries = entries.len() as u16;
                }
                KeyType::StatData | KeyType::Any => {
                    return Err(StreeError::Invalid("cannot paste into this item kind"))
                }
            }
            if item.body.len() > max_len {
                return Err(StreeError::Invalid("paste would exceed the largest item size"));
            }
            item.sync_len()?;
        }
        BalanceOp::Cut { delta } => {
            let item = image
                .items
                .get_mut(position)
                .ok_or(StreeError::Invalid("cut position past the last item"))?;
            match item.head.kind() {
                KeyType::Direct | KeyType::Indirect => {
                    let start = if item.head.kind() == KeyType::Indirect {
                        pos_in_item * UNFM_P_SIZE
                    } else {
                        pos_in_item
                    };
                    if delta == 0 || start + delta != item.body.len() {
                        return Err(StreeError::Invalid("cut must remove the item tail"));
                    }
                    item.body.truncate(start);
                    if item.head.kind() == KeyType::Indirect {
                        item.head.free_space_or_entries = 0;
                    }
                }
                KeyType::DirEntry => {
                    let mut entries = decode_entries(&item.head, &item.body)?;
                    if pos_in_item >= entries.len() {
                        return Err(StreeError::Invalid("entry position past the item end"));
                    }
                    let removed = entries.remove(pos_in_item);
                    if removed.encoded_len() != delta {
                        return Err(StreeError::Invalid("cut size does not match the entry"));
                    }
                    item.body = encode_entries(&entries)?;
                    item.head.free_space_or_entries = entries.len() as u16;
                }
                KeyType::StatData | KeyType::Any => {
                    return Err(StreeError::Invalid("cannot cut from this item kind"))
                }
            }
            if item.body.is_empty() {
                return Err(StreeError::Invalid("cut would leave an empty item"));
            }
            item.sync_len()?;
        }
        BalanceOp::Delete => {
            if position >= image.items.len() {
                return Err(StreeError::Invalid("delete position past the last item"));
            }
            image.items.remove(position);
        }
    }
    Ok(())
}

/// Splits items into runs that each fit one leaf, filling left to right.
fn pack_leaves(items: Vec<Item>, block_size: usize) -> Vec<Vec<Item>> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    let mut used = BLKH_SIZE;
    for item in items {
        if !current.is_empty() && used + item.footprint() > block_size {
            parts.push(std::mem::take(&mut current));
            used = BLKH_SIZE;
        }
        used += item.footprint();
        current.push(item);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn child_size(used: usize) -> u16 {
    used.min(usize::from(u16::MAX)) as u16
}

struct TreeEdit<'a> {
    ctx: &'a TreeContext,
    txn: &'a mut Transaction,
    path: &'a TreePath,
}

impl TreeEdit<'_> {
    fn element(&self, index: usize) -> Result<&BlockRef> {
        self.path
            .element(index)
            .map(|element| &element.block)
            .ok_or(StreeError::Invalid("path shorter than the balanced level"))
    }

    fn allocate_node(&mut self) -> Result<BlockRef> {
        let block = self.ctx.cache().allocate(FrameUse::Node)?;
        block.set_in_tree(true);
        Ok(block)
    }

    fn free_node(&mut self, block: &BlockRef) -> Result<()> {
        self.ctx.cache().free(block.id())?;
        self.txn.record_free(block.id());
        self.ctx.stats().inc_nodes_removed();
        Ok(())
    }

    fn split_leaf(&mut self, leaf: &BlockRef, image: LeafImage, old_first: Option<Key>) -> Result<()> {
        let block_size = self.ctx.block_size();
        let mut parts = pack_leaves(image.items, block_size).into_iter();
        let first = parts.next().unwrap_or_default();
        let rest: Vec<Vec<Item>> = parts.collect();
        let needed = rest.len() + usize::from(self.ctx.root().height);
        if (self.ctx.cache().free_count() as usize) < needed {
            debug!(target: "stree::balance", needed, "not enough free blocks to split");
            return Err(StreeError::OutOfSpace);
        }

        let mut left = LeafImage { items: first };
        left.write(&mut leaf.data_mut())?;
        self.txn.mark_dirty(leaf);
        let mut siblings = Vec::with_capacity(rest.len());
        for items in rest {
            let block = self.allocate_node()?;
            let mut right = LeafImage { items };
            right.write(&mut block.data_mut())?;
            self.txn.mark_dirty(&block);
            let separator = right
                .items
                .first()
                .map(|item| item.head.key)
                .ok_or(StreeError::Invalid("empty leaf produced by a split"))?;
            siblings.push((
                separator,
                DiskChild {
                    block: block.id(),
                    size: child_size(right.used_bytes()),
                },
            ));
            self.ctx.stats().inc_leaf_splits();
        }
        let leaf_index = self.path.len() - 1;
        if let Some(first) = left.items.first() {
            if Some(first.head.key) != old_first {
                self.fix_left_key(leaf_index, first.head.key)?;
            }
        }
        debug!(
            target: "stree::balance",
            leaf = leaf.id().0,
            parts = siblings.len() + 1,
            "split leaf"
        );
        self.insert_into_parent(leaf_index, child_size(left.used_bytes()), siblings)
    }

    /// Links `siblings` right after the node at `level_index`, splitting
    /// ancestors and growing a new root as needed.
    fn insert_into_parent(
        &mut self,
        level_index: usize,
        left_size: u16,
        siblings: Vec<(Key, DiskChild)>,
    ) -> Result<()> {
        let node = self.element(level_index)?.clone();
        if level_index == 0 {
            let level = NodeView::new(&node.data())?.level();
            let root = self.allocate_node()?;
            let mut image = InternalImage {
                level: level + 1,
                keys: Vec::with_capacity(siblings.len()),
                children: vec![DiskChild {
                    block: node.id(),
                    size: left_size,
                }],
            };
            for (key, child) in siblings {
                image.keys.push(key);
                image.children.push(child);
            }
            image.write(&mut root.data_mut())?;
            self.txn.mark_dirty(&root);
            self.ctx.set_root(RootInfo {
                block: root.id(),
                height: level + 1,
            });
            debug!(target: "stree::balance", root = root.id().0, height = level + 1, "grew a new root");
            return Ok(());
        }

        let parent = self.element(level_index - 1)?.clone();
        let position = self
            .path
            .element(level_index - 1)
            .map(|element| element.position)
            .unwrap_or_default();
        let mut image = InternalImage::decode(&parent.data())?;
        let slot = image
            .children
            .get_mut(position)
            .ok_or(StreeError::Corruption("parent position out of range"))?;
        if slot.block != node.id() {
            return Err(StreeError::Corruption("parent no longer points at the split node"));
        }
        slot.size = left_size;
        for (offset, (key, child)) in siblings.into_iter().enumerate() {
            image.keys.insert(position + offset, key);
            image.children.insert(position + 1 + offset, child);
        }
        let max_keys = max_internal_keys(self.ctx.block_size());
        if image.keys.len() <= max_keys {
            image.write(&mut parent.data_mut())?;
            self.txn.mark_dirty(&parent);
            return Ok(());
        }

        let mid = image.keys.len() / 2;
        let right_keys = image.keys.split_off(mid + 1);
        let promoted = image
            .keys
            .pop()
            .ok_or(StreeError::Invalid("internal split without a middle key"))?;
        let right_children = image.children.split_off(mid + 1);
        let right = InternalImage {
            level: image.level,
            keys: right_keys,
            children: right_children,
        };
        if image.keys.len() > max_keys || right.keys.len() > max_keys {
            return Err(StreeError::Invalid("internal split still overflows"));
        }
        let block = self.allocate_node()?;
        right.write(&mut block.data_mut())?;
        self.txn.mark_dirty(&block);
        image.write(&mut parent.data_mut())?;
        self.txn.mark_dirty(&parent);
        self.ctx.stats().inc_internal_splits();
        debug!(target: "stree::balance", node = parent.id().0, sibling = block.id().0, "split internal node");
        self.insert_into_parent(
            level_index - 1,
            child_size(image.used_bytes()),
            vec![(
                promoted,
                DiskChild {
                    block: block.id(),
                    size: child_size(right.used_bytes()),
                },
            )],
        )
    }

    /// Rewrites the separator that bounds the subtree at `level_index` from
    /// the left, if there is one.
    fn fix_left_key(&mut self, level_index: usize, key: Key) -> Result<()> {
        for index in (0..level_index).rev() {
            let element = self
                .path
                .element(index)
                .ok_or(StreeError::Invalid("path shorter than the balanced level"))?;
            if element.position == 0 {
                continue;
            }
            let mut image = InternalImage::decode(&element.block.data())?;
            let slot = image
                .keys
                .get_mut(element.position - 1)
                .ok_or(StreeError::Corruption("delimiting key position out of range"))?;
            *slot = key;
            image.write(&mut element.block.data_mut())?;
            self.txn.mark_dirty(&element.block);
            return Ok(());
        }
        Ok(())
    }

    /// Removes the empty node at `level_index` from its parent.
    fn unlink(&mut self, level_index: usize) -> Result<()> {
        let node = self.element(level_index)?.clone();
        if level_index == 0 {
            format_empty_leaf(&mut node.data_mut())?;
            self.txn.mark_dirty(&node);
            self.ctx.set_root(RootInfo {
                block: node.id(),
                height: LEAF_LEVEL,
            });
            debug!(target: "stree::balance", root = node.id().0, "tree is empty");
            return Ok(());
        }
        let parent = self.element(level_index - 1)?.clone();
        let position = self
            .path
            .element(level_index - 1)
            .map(|element| element.position)
            .unwrap_or_default();
        let mut image = InternalImage::decode(&parent.data())?;
        if image.children.get(position).map(|child| child.block) != Some(node.id()) {
            return Err(StreeError::Corruption("parent no longer points at the emptied node"));
        }
        image.children.remove(position);
        self.free_node(&node)?;
        trace!(target: "stree::balance", node = node.id().0, "unlinked empty node");
        if image.children.is_empty() {
            return self.unlink(level_index - 1);
        }
        let removed = if position > 0 {
            image.keys.remove(position - 1)
        } else {
            image.keys.remove(0)
        };
        image.write(&mut parent.data_mut())?;
        self.txn.mark_dirty(&parent);
        if position == 0 {
            self.fix_left_key(level_index - 1, removed)?;
        }
        if level_index == 1 {
            self.collapse_root()?;
        }
        Ok(())
    }

    /// Drops internal roots that are left with a single child.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let root = self.ctx.root();
            if root.height == LEAF_LEVEL {
                return Ok(());
            }
            let block = self.ctx.cache().pin(root.block)?;
            let image = InternalImage::decode(&block.data())?;
            if !image.keys.is_empty() {
                return Ok(());
            }
            let child = image.children[0].block;
            self.free_node(&block)?;
            self.ctx.set_root(RootInfo {
                block: child,
                height: root.height - 1,
            });
            debug!(target: "stree::balance", root = child.0, height = root.height - 1, "collapsed root");
        }
    }
}
