//! Indirect to direct tail conversion and its compensation log.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::object::FileObject;
use super::stat::SD_V2_SIZE;
use crate::primitives::pager::{BlockCache, FrameUse};
use crate::primitives::wal::Transaction;
use crate::storage::options::TailPolicy;
use crate::storage::tree::item::{pointer_at, set_pointer, IH_SIZE, UNFM_P_SIZE};
use crate::storage::tree::node::{NodeView, BLKH_SIZE};
use crate::storage::tree::{Item, ItemHead, Key, KeyType, PositionResult, STree};
use crate::types::{BlockId, Result, StreeError};

/// Largest direct item a tail is packed into. Leaves room for two item
/// heads, a stat-data item and one pointer next to it.
pub fn max_direct_item_len(block_size: usize) -> usize {
    block_size - BLKH_SIZE - 2 * IH_SIZE - SD_V2_SIZE - UNFM_P_SIZE
}

/// Returns `true` if a tail of `tail_len` bytes in a file of `file_size`
/// bytes should stay in its unformatted block.
///
/// The larger the file, the smaller a tail has to be before packing it is
/// worth a leaf slot.
pub fn keep_tail_in_block(file_size: u64, tail_len: usize, block_size: usize) -> bool {
    let max = max_direct_item_len(block_size);
    let block = block_size as u64;
    tail_len == 0
        || tail_len > max
        || file_size >= block * 4
        || (file_size >= block * 3 && tail_len >= max / 4)
        || (file_size >= block * 2 && tail_len >= max / 2)
        || (file_size >= block && tail_len >= max * 3 / 4)
}

impl TailPolicy {
    /// Returns `true` if the policy packs this tail.
    pub fn packs(self, file_size: u64, tail_len: usize, block_size: usize) -> bool {
        match self {
            TailPolicy::Never => false,
            TailPolicy::Always => tail_len > 0,
            TailPolicy::Small => !keep_tail_in_block(file_size, tail_len, block_size),
        }
    }
}

/// Supplies the cached page of an unformatted block.
pub trait PageSource: Send + Sync {
    /// Returns the full page backing `block` of `object`, or `None` when the
    /// page is not available (for example after a read error).
    fn page(&self, object: &FileObject, block: BlockId) -> Result<Option<Vec<u8>>>;
}

/// Reads pages straight through the block cache.
pub struct CachePageSource {
    cache: Arc<dyn BlockCache>,
}

impl CachePageSource {
    /// Creates a page source over `cache`.
    pub fn new(cache: Arc<dyn BlockCache>) -> Self {
        Self { cache }
    }
}

impl PageSource for CachePageSource {
    fn page(&self, object: &FileObject, block: BlockId) -> Result<Option<Vec<u8>>> {
        if block.is_null() {
            return Ok(Some(vec![0; self.cache.block_size()]));
        }
        match self.cache.pin(block) {
            Ok(pinned) => Ok(Some(pinned.data().to_vec())),
            Err(StreeError::Io(err)) => {
                debug!(
                    target: "stree::tree",
                    object = %object.key,
                    block = block.0,
                    %err,
                    "tail page unavailable"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Record of what a conversion changed, replayed in reverse when the
/// pointer removal that completes it fails.
#[derive(Debug)]
pub struct CompensationLog {
    inserted: Vec<Key>,
    slot_key: Key,
    page: Vec<u8>,
}

impl CompensationLog {
    fn new(slot_key: Key, page: Vec<u8>) -> Self {
        Self {
            inserted: Vec::new(),
            slot_key,
            page,
        }
    }

    /// Keys of the direct items inserted so far, in insertion order.
    pub fn inserted(&self) -> &[Key] {
        &self.inserted
    }

    /// Undoes the conversion: deletes every inserted direct item, newest
    /// first, then puts the tail page back under the indirect item if the
    /// pointer was already released.
    pub fn rollback(self, tree: &STree, txn: &mut Transaction) -> Result<()> {
        for key in self.inserted.iter().rev() {
            tree.delete(txn, key)?;
        }
        let (path, result) = tree.search_for_position(&self.slot_key)?;
        if result != PositionResult::PositionFound {
            return Err(StreeError::Corruption("converted indirect item vanished"));
        }
        let head = path.item_head()?;
        if head.kind() != KeyType::Indirect {
            return Err(StreeError::Corruption("tail slot is not an indirect item"));
        }
        let slot = path.pos_in_item();
        let leaf = path.leaf()?;
        let current = {
            let data = leaf.data();
            pointer_at(NodeView::new(&data)?.item_body(&head)?, slot)?
        };
        if current.is_null() {
            let block = tree.context().cache().allocate(FrameUse::Unformatted)?;
            let len = self.page.len().min(tree.block_size());
            block.data_mut()[..len].copy_from_slice(&self.page[..len]);
            txn.mark_dirty(&block);
            {
                let mut data = leaf.data_mut();
                let start = usize::from(head.location);
                set_pointer(&mut data[start..start + usize::from(head.len)], slot, block.id())?;
            }
            txn.mark_dirty(leaf);
            debug!(target: "stree::tree", block = block.id().0, "restored tail block");
        }
        tree.stats().inc_rollbacks();
        Ok(())
    }
}

/// Result of a conversion attempt.
#[derive(Debug)]
pub(crate) enum TailOutcome {
    /// The tail stays in its block; `bytes` is what the caller counts as
    /// removed.
    Skipped {
        /// Logically removed bytes.
        bytes: u64,
    },
    /// Direct items hold the tail now; the last pointer still has to go.
    Packed {
        /// What to undo if the pointer removal fails.
        log: CompensationLog,
        /// Logically removed bytes.
        bytes: u64,
    },
}

impl STree {
    /// Packs the bytes of the last unformatted block below `new_size` into
    /// direct items, when the object and policy allow it.
    pub(crate) fn maybe_indirect_to_direct(
        &self,
        txn: &mut Transaction,
        object: &FileObject,
        head: &ItemHead,
        last_block: BlockId,
        new_size: u64,
    ) -> Result<TailOutcome> {
        let block_size = self.block_size();
        let tail_len = (new_size & (block_size as u64 - 1)) as usize;
        let skipped = TailOutcome::Skipped {
            bytes: if tail_len == 0 { 0 } else { (block_size - tail_len) as u64 },
        };
        if object.handle_count != 1
            || object.nopack
            || !self.options.tail_policy.packs(new_size, tail_len, block_size)
        {
            debug!(
                target: "stree::tree",
                object = %object.key,
                tail_len,
                handles = object.handle_count,
                "tail left in its block"
            );
            return Ok(skipped);
        }
        let Some(page) = self.pages.page(object, last_block)? else {
            return Ok(skipped);
        };
        if page.len() < tail_len {
            return Ok(skipped);
        }

        let first_byte = head.key.offset - 1 + (head.pointer_count() as u64 - 1) * block_size as u64;
        let slot_key = object.item_key(KeyType::Indirect, first_byte + 1);
        let chunk_len = max_direct_item_len(block_size);
        let tail = page[..tail_len].to_vec();
        let mut log = CompensationLog::new(slot_key, page);
        for (i, chunk) in tail.chunks(chunk_len).enumerate() {
            let key = object.item_key(KeyType::Direct, first_byte + 1 + (i * chunk_len) as u64);
            let item = Item::new(key, 0, chunk.to_vec())?;
            if let Err(err) = self.insert(txn, &item) {
                return Err(self.abandon_conversion(txn, Some(log), err));
            }
            log.inserted.push(key);
        }
        self.stats().inc_conversions();
        info!(
            target: "stree::tree",
            object = %object.key,
            tail_len,
            items = log.inserted.len(),
            "packed tail into direct items"
        );
        Ok(TailOutcome::Packed {
            log,
            bytes: (block_size - tail_len) as u64,
        })
    }

    /// Rolls back a partial conversion and returns the error to surface.
    pub(crate) fn abandon_conversion(
        &self,
        txn: &mut Transaction,
        log: Option<CompensationLog>,
        err: StreeError,
    ) -> StreeError {
        let Some(log) = log else {
            return err;
        };
        debug!(target: "stree::tree", %err, undo = log.inserted.len(), "rolling back tail conversion");
        match log.rollback(self, txn) {
            Ok(()) => err,
            Err(rollback_err) => {
                error!(
                    target: "stree::tree",
                    %err,
                    %rollback_err,
                    "tail conversion rollback failed"
                );
                StreeError::Corruption("tail conversion rollback failed")
            }
        }
    }
}
