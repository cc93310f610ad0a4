//! Decides how much of one item a delete or truncate step removes.
//!
//! The planner is a closed match over item kinds. Indirect items are the only
//! kind it touches directly: trailing pointers are zeroed in place and their
//! blocks handed back to the allocator before the balancer shrinks the item.

use tracing::{debug, trace};

use super::entry::entry_len;
use super::item::{pointer_at, set_pointer, ItemHead, UNFM_P_SIZE};
use super::key::{Key, KeyType, KeyVersion, DOT_OFFSET};
use super::node::NodeView;
use super::path::TreePath;
use super::search::{item_moved, PositionResult};
use super::STree;
use crate::primitives::concurrency::BoundedWait;
use crate::primitives::wal::Transaction;
use crate::types::{BlockId, Result, StreeError};

/// What the next balance step does to the item under the path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Plan {
    /// Remove the whole item.
    DeleteWhole,
    /// Remove `delta` body bytes from `start_pos` to the item end. For
    /// indirect items `start_pos` is a pointer slot; for directory items it
    /// is the entry index.
    CutBytes {
        /// Body bytes to remove.
        delta: usize,
        /// First removed position inside the item.
        start_pos: usize,
    },
    /// Only the tail block remains past the new size; ask for tail
    /// conversion.
    Convert,
}

/// Planner result.
#[derive(Clone, Copy, Debug)]
pub struct PlanOutcome {
    /// Chosen plan.
    pub plan: Plan,
    /// Head of the item the plan applies to, read after any re-search.
    pub head: ItemHead,
    /// Non-hole pointers released to the allocator while planning.
    pub removed_pointers: usize,
}

impl STree {
    /// Plans one delete or cut step on the item under `path`.
    ///
    /// `new_size` equal to the key version's largest offset selects delete
    /// mode: the item goes away whole (one entry for directory items). The
    /// path must come from a `PositionFound` search and is replaced if the
    /// indirect walk has to search again.
    pub fn prepare_delete_or_cut(
        &self,
        txn: &mut Transaction,
        path: &mut TreePath,
        key: &Key,
        new_size: u64,
    ) -> Result<PlanOutcome> {
        let delete_mode = new_size == key.version.max_offset();
        let head = path.item_head()?;
        let plan = match head.kind() {
            KeyType::StatData => Plan::DeleteWhole,
            KeyType::DirEntry => {
                let count = head.entry_count();
                if count == 1 || (delete_mode && head.key.offset == DOT_OFFSET && count <= 2) {
                    Plan::DeleteWhole
                } else {
                    let start_pos = path.pos_in_item();
                    let leaf = path.leaf()?;
                    let data = leaf.data();
                    let body = NodeView::new(&data)?.item_body(&head)?;
                    Plan::CutBytes {
                        delta: entry_len(&head, body, start_pos)?,
                        start_pos,
                    }
                }
            }
            KeyType::Direct => plan_direct(&head, new_size, delete_mode, self.block_size()),
            KeyType::Indirect => return self.plan_indirect(txn, path, key, new_size, delete_mode),
            KeyType::Any => return Err(StreeError::Corruption("item of unknown kind")),
        };
        trace!(target: "stree::tree", item = %head.key, ?plan, "planned");
        Ok(PlanOutcome {
            plan,
            head,
            removed_pointers: 0,
        })
    }

    fn plan_indirect(
        &self,
        txn: &mut Transaction,
        path: &mut TreePath,
        key: &Key,
        new_size: u64,
        delete_mode: bool,
    ) -> Result<PlanOutcome> {
        let block_size = self.block_size() as u64;
        let limit = if delete_mode { 0 } else { new_size };
        let mut head = path.item_head()?;
        let mut pos = head.pointer_count();
        let mut removed = 0usize;
        let mut released = 0usize;
        let mut busy_block = None;
        let mut wait = BoundedWait::new(self.options.busy_retry_limit, self.options.busy_backoff());

        while pos > 0 && head.key.offset + (pos as u64 - 1) * block_size > limit {
            if !delete_mode
                && removed > 0
                && txn.logged_blocks() > self.options.truncate_checkpoint_blocks
            {
                break;
            }
            let slot = pos - 1;
            let block = {
                let leaf = path.leaf()?;
                let data = leaf.data();
                pointer_at(NodeView::new(&data)?.item_body(&head)?, slot)?
            };
            if !block.is_null() {
                if self.ctx.cache().is_busy(block)? {
                    if wait.wait() {
                        self.ctx.stats().inc_busy_waits();
                        if item_moved(path, &head)? {
                            head = self.relocate(path, key)?;
                            pos = head.pointer_count();
                            removed = 0;
                        }
                        continue;
                    }
                    debug!(
                        target: "stree::tree",
                        block = block.0,
                        waits = wait.spent(),
                        "unformatted block stayed busy"
                    );
                    busy_block = Some(block);
                    break;
                }
                self.release_pointer(txn, path, &head, slot, block)?;
                released += 1;
                wait.reset();
                if item_moved(path, &head)? {
                    // Released slots are null now; walking them again only recounts them.
                    head = self.relocate(path, key)?;
                    pos = head.pointer_count();
                    removed = 0;
                    continue;
                }
            }
            pos -= 1;
            removed += 1;
        }

        let plan = if pos == 0 {
            Plan::DeleteWhole
        } else if removed == 0 {
            if let Some(block) = busy_block {
                return Err(StreeError::Busy { block });
            }
            Plan::Convert
        } else {
            Plan::CutBytes {
                delta: removed * UNFM_P_SIZE,
                start_pos: pos,
            }
        };
        trace!(target: "stree::tree", item = %head.key, ?plan, removed, "planned indirect item");
        Ok(PlanOutcome {
            plan,
            head,
            removed_pointers: released,
        })
    }

    fn release_pointer(
        &self,
        txn: &mut Transaction,
        path: &TreePath,
        head: &ItemHead,
        slot: usize,
        block: BlockId,
    ) -> Result<()> {
        let leaf = path.leaf()?;
        {
            let mut data = leaf.data_mut();
            let start = usize::from(head.location);
            let end = start + usize::from(head.len);
            if end > data.len() {
                return Err(StreeError::Corruption("item body past the block end"));
            }
            set_pointer(&mut data[start..end], slot, BlockId::NULL)?;
        }
        txn.mark_dirty(leaf);
        self.ctx.cache().free(block)?;
        txn.record_free(block);
        self.ctx.stats().inc_blocks_freed();
        Ok(())
    }

    /// Searches again for `key` after the item moved and returns the fresh
    /// head.
    fn relocate(&self, path: &mut TreePath, key: &Key) -> Result<ItemHead> {
        path.release();
        let (fresh, result) = self.search_for_position(key)?;
        if result != PositionResult::PositionFound {
            return Err(StreeError::NotFound);
        }
        *path = fresh;
        path.item_head()
    }
}

fn plan_direct(head: &ItemHead, new_size: u64, delete_mode: bool, block_size: usize) -> Plan {
    if delete_mode {
        return Plan::DeleteWhole;
    }
    let offset = head.key.offset;
    let boundary = match head.version() {
        KeyVersion::V2 => new_size.div_ceil(block_size as u64) * block_size as u64,
        KeyVersion::V1 => new_size,
    };
    if boundary < offset {
        return Plan::DeleteWhole;
    }
    let len = usize::from(head.len);
    let start = usize::try_from(boundary + 1 - offset)
        .unwrap_or(usize::MAX)
        .min(len);
    Plan::CutBytes {
        delta: len - start,
        start_pos: start,
    }
}

/// Content bytes a plan removes from an item.
///
/// Indirect deltas are pointer bytes; each pointer stands for a whole block.
pub fn calc_deleted_bytes(plan: Plan, head: &ItemHead, block_size: usize) -> u64 {
    let bytes = match plan {
        Plan::DeleteWhole => usize::from(head.len),
        Plan::CutBytes { delta, .. } => delta,
        Plan::Convert => 0,
    };
    match head.kind() {
        KeyType::Indirect => (bytes / UNFM_P_SIZE) as u64 * block_size as u64,
        KeyType::StatData | KeyType::Direct | KeyType::DirEntry | KeyType::Any => bytes as u64,
    }
}
