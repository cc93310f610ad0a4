use tracing::{debug, trace};

use super::item::{Item, ItemHead};
use super::key::{Key, KeyLen, KeyType, MAX_KEY};
use super::node::{validate_node_shape, NodeView, SearchPos, LEAF_LEVEL};
use super::path::{key_in_buffer, right_delimiting_key, TreePath};
use super::STree;
use crate::types::{BlockId, Result, StreeError};

/// Outcome of [`STree::search_for_position`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PositionResult {
    /// The position lies inside an existing item.
    PositionFound,
    /// The object has an item before the position but it does not cover it;
    /// the path points one past that item's end.
    PositionNotFound,
    /// The object has no item at or before the position.
    FileNotFound,
}

impl STree {
    /// Descends from the root to `stop_level` looking for `key`.
    ///
    /// Every blocking load and every node read is bracketed by a generation
    /// snapshot. If the tree changed meanwhile and the node left the tree,
    /// changed level, or no longer bounds `key`, the whole path is released
    /// and the descent restarts from the root. A node that is still valid is
    /// read again, since the change may have overlapped the first read.
    pub fn search(&self, key: &Key, stop_level: u16) -> Result<(TreePath, SearchPos)> {
        let ctx = &self.ctx;
        let mut restarts = 0u32;
        'restart: loop {
            let mut path = TreePath::new();
            let mut snapshot = ctx.generation().stable_snapshot();
            let root = ctx.root();
            if stop_level < LEAF_LEVEL || stop_level > root.height {
                return Err(StreeError::Invalid("stop level outside the tree"));
            }
            let mut block_id = root.block;
            let mut expected_level = root.height;
            loop {
                let block = match ctx.cache().pin(block_id) {
                    Ok(block) => block,
                    // The child was freed after its parent was read.
                    Err(StreeError::Io(_)) if ctx.generation().changed_since(snapshot) => {
                        path.release();
                        self.note_restart(&mut restarts, block_id, key)?;
                        continue 'restart;
                    }
                    Err(err) => return Err(err),
                };
                path.push(block, 0);
                let (pos, child) = loop {
                    let now = ctx.generation().stable_snapshot();
                    if now != snapshot {
                        snapshot = now;
                        if !self.still_valid(&path, key, expected_level)? {
                            path.release();
                            self.note_restart(&mut restarts, block_id, key)?;
                            continue 'restart;
                        }
                    }
                    let read = read_node(&path, key, expected_level, stop_level);
                    if !ctx.generation().changed_since(snapshot) {
                        break read?;
                    }
                    trace!(target: "stree::search", block = block_id.0, "node changed while read; checking again");
                };
                path.top_mut()?.position = pos.index();
                match child {
                    None => {
                        path.set_snapshot(snapshot);
                        ctx.stats().inc_searches();
                        trace!(target: "stree::search", %key, ?pos, level = stop_level, "search done");
                        return Ok((path, pos));
                    }
                    Some(next) => {
                        block_id = next;
                        expected_level -= 1;
                    }
                }
            }
        }
    }

    /// Counts one restart; fails with `Busy` once the budget is spent.
    fn note_restart(&self, restarts: &mut u32, block: BlockId, key: &Key) -> Result<()> {
        *restarts += 1;
        self.ctx.stats().inc_restarts();
        debug!(
            target: "stree::search",
            block = block.0,
            restarts = *restarts,
            %key,
            "tree changed during load; restarting from the root"
        );
        if *restarts > self.options.max_restarts {
            return Err(StreeError::Busy { block });
        }
        Ok(())
    }

    fn still_valid(&self, path: &TreePath, key: &Key, expected_level: u16) -> Result<bool> {
        let top = path.top()?;
        if !top.block.is_in_tree() {
            return Ok(false);
        }
        let level = NodeView::new(&top.block.data())?.level();
        if level != expected_level {
            return Ok(false);
        }
        key_in_buffer(path, key, self.ctx.root().block)
    }

    /// Leaf-level search for an item key.
    pub fn search_item(&self, key: &Key) -> Result<(TreePath, SearchPos)> {
        self.search(key, LEAF_LEVEL)
    }

    /// Locates the item covering `key.offset` and the position inside it.
    ///
    /// Direct items are measured in bytes, indirect items in pointer slots,
    /// directory items through the entry search.
    pub fn search_for_position(&self, key: &Key) -> Result<(TreePath, PositionResult)> {
        let (mut path, pos) = self.search_item(key)?;
        let index = match pos {
            SearchPos::Found(_) => {
                path.set_pos_in_item(0);
                return Ok((path, PositionResult::PositionFound));
            }
            SearchPos::NotFound(0) => return Ok((path, PositionResult::FileNotFound)),
            SearchPos::NotFound(i) => i - 1,
        };
        path.set_item_position(index)?;
        let block_size = self.ctx.block_size();
        let (result, pos_in_item) = {
            let leaf = path.leaf()?;
            let data = leaf.data();
            let view = NodeView::new(&data)?;
            let head = view.item_head(index)?;
            if !head.key.same_object(key) {
                (PositionResult::FileNotFound, 0)
            } else if head.kind() == KeyType::DirEntry && key.kind == KeyType::DirEntry {
                match self.entries.locate(&head, view.item_body(&head)?, key)? {
                    SearchPos::Found(e) => (PositionResult::PositionFound, e),
                    SearchPos::NotFound(e) => (PositionResult::PositionNotFound, e),
                }
            } else {
                position_in_file_item(&head, key.offset, block_size)
            }
        };
        path.set_pos_in_item(pos_in_item);
        Ok((path, result))
    }

    /// Locates the last item of an object.
    ///
    /// The returned path points at that item. `FileNotFound` means the
    /// object has no items at all; `PositionFound` means an item claims the
    /// largest offset the object's key version can express.
    pub fn search_object_end(&self, object: &Key) -> Result<(TreePath, PositionResult)> {
        let probe = object
            .with_offset(object.version.max_offset())
            .with_kind(KeyType::Direct)
            .with_len(KeyLen::Three);
        self.search_for_position(&probe)
    }

    /// Returns the first item whose key is strictly greater than `key`.
    pub fn next_item(&self, key: &Key) -> Result<Option<Item>> {
        let (path, pos) = self.search_item(key)?;
        let index = match pos {
            SearchPos::Found(i) => i + 1,
            SearchPos::NotFound(i) => i,
        };
        let rkey = {
            let data = path.leaf()?.data();
            let view = NodeView::new(&data)?;
            if index < view.nr_items() {
                return Ok(Some(view.item(index)?));
            }
            right_delimiting_key(&path, self.ctx.root().block)?
        };
        drop(path);
        if rkey == MAX_KEY {
            return Ok(None);
        }
        if rkey.compare(key).is_le() {
            return Err(StreeError::Corruption("right delimiting key does not advance"));
        }
        let (path, pos) = self.search_item(&rkey)?;
        let data = path.leaf()?.data();
        let view = NodeView::new(&data)?;
        if pos.index() < view.nr_items() {
            Ok(Some(view.item(pos.index())?))
        } else {
            Ok(None)
        }
    }
}

fn position_in_file_item(head: &ItemHead, offset: u64, block_size: usize) -> (PositionResult, usize) {
    let start = head.key.offset;
    let covered = head.op_bytes(block_size);
    let indirect = head.kind() == KeyType::Indirect;
    if start <= offset && offset < start + covered {
        let delta = (offset - start) as usize;
        let pos = if indirect { delta / block_size } else { delta };
        (PositionResult::PositionFound, pos)
    } else {
        let end = if indirect {
            head.pointer_count()
        } else {
            usize::from(head.len)
        };
        (PositionResult::PositionNotFound, end)
    }
}

/// Positions `key` in the node at the top of `path`; returns the child to
/// descend into unless the node is at `stop_level`.
fn read_node(
    path: &TreePath,
    key: &Key,
    expected_level: u16,
    stop_level: u16,
) -> Result<(SearchPos, Option<BlockId>)> {
    let top = path.top()?;
    let data = top.block.data();
    validate_node_shape(&data, expected_level, path.len() == 1)?;
    let view = NodeView::new(&data)?;
    let pos = view.search(key)?;
    if expected_level == stop_level {
        return Ok((pos, None));
    }
    let index = match pos {
        SearchPos::Found(i) => i + 1,
        SearchPos::NotFound(i) => i,
    };
    Ok((SearchPos::NotFound(index), Some(view.child(index)?.block)))
}

/// Returns `true` if the path no longer points at the item `saved` was read
/// from.
pub fn item_moved(path: &TreePath, saved: &ItemHead) -> Result<bool> {
    let top = path.top()?;
    if !top.block.is_in_tree() {
        return Ok(true);
    }
    let data = top.block.data();
    let view = NodeView::new(&data)?;
    if top.position >= view.nr_items() {
        return Ok(true);
    }
    Ok(!view.item_head(top.position)?.same_item(saved))
}
