#![forbid(unsafe_code)]

//! Durability collaborator.
//!
//! The engine only needs units of work: begin one, record which blocks it
//! dirtied, end it. [`MemJournal`] is the in-memory implementation used by the
//! tests and the CLI; it logs a checksum of every dirty block image when a
//! unit ends.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::primitives::pager::{BlockCache, BlockRef};
use crate::types::{block_crc32, BlockId, Result, StreeError};

/// An open unit of durable work.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    reserved: usize,
    dirty: BTreeSet<BlockId>,
    freed: Vec<BlockId>,
}

impl Transaction {
    /// Creates a unit with the given id and block reservation.
    pub fn new(id: u64, reserved: usize) -> Self {
        Self {
            id,
            reserved,
            dirty: BTreeSet::new(),
            freed: Vec::new(),
        }
    }

    /// Unit identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of blocks the unit asked to reserve when it began.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Records that `block` was modified inside this unit.
    pub fn mark_dirty(&mut self, block: &BlockRef) {
        self.dirty.insert(block.id());
    }

    /// Records that `block` was returned to the allocator inside this unit.
    pub fn record_free(&mut self, block: BlockId) {
        self.dirty.remove(&block);
        self.freed.push(block);
    }

    /// Number of distinct blocks logged so far, freed blocks included.
    pub fn logged_blocks(&self) -> usize {
        self.dirty.len() + self.freed.len()
    }

    /// Blocks modified in this unit.
    pub fn dirty_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.dirty.iter().copied()
    }

    /// Blocks freed in this unit.
    pub fn freed_blocks(&self) -> &[BlockId] {
        &self.freed
    }
}

/// Durability layer consumed by the engine.
pub trait Journal: Send + Sync {
    /// Begins a unit of work reserving room for `reserve` blocks.
    fn begin(&self, reserve: usize) -> Result<Transaction>;
    /// Ends the unit, making everything it logged durable.
    fn end(&self, txn: Transaction) -> Result<CommittedUnit>;
}

/// One logged block image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoggedBlock {
    /// Block number.
    pub block: BlockId,
    /// Checksum of the image at commit time.
    pub crc32: u32,
}

/// Summary of an ended unit.
#[derive(Clone, Debug, Default)]
pub struct CommittedUnit {
    /// Unit identifier.
    pub id: u64,
    /// Images logged by the unit.
    pub blocks: Vec<LoggedBlock>,
    /// Blocks freed by the unit.
    pub freed: Vec<BlockId>,
}

/// Statistics for a [`MemJournal`].
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct JournalStats {
    /// Units begun.
    pub begun: u64,
    /// Units ended.
    pub ended: u64,
    /// Block images logged.
    pub blocks_logged: u64,
}

impl fmt::Display for JournalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "begun={} ended={} blocks_logged={}",
            self.begun, self.ended, self.blocks_logged
        )
    }
}

/// In-memory journal that records every ended unit.
pub struct MemJournal {
    cache: Arc<dyn BlockCache>,
    next_id: AtomicU64,
    open: Mutex<BTreeSet<u64>>,
    committed: Mutex<Vec<CommittedUnit>>,
    blocks_logged: AtomicU64,
}

impl MemJournal {
    /// Creates a journal logging images from `cache`.
    pub fn new(cache: Arc<dyn BlockCache>) -> Self {
        Self {
            cache,
            next_id: AtomicU64::new(1),
            open: Mutex::new(BTreeSet::new()),
            committed: Mutex::new(Vec::new()),
            blocks_logged: AtomicU64::new(0),
        }
    }

    /// Units ended so far, oldest first.
    pub fn committed(&self) -> Vec<CommittedUnit> {
        self.committed.lock().clone()
    }

    /// Number of units currently open.
    pub fn open_units(&self) -> usize {
        self.open.lock().len()
    }

    /// Snapshot of the journal counters.
    pub fn stats(&self) -> JournalStats {
        JournalStats {
            begun: self.next_id.load(AtomicOrdering::Relaxed) - 1,
            ended: self.committed.lock().len() as u64,
            blocks_logged: self.blocks_logged.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Journal for MemJournal {
    fn begin(&self, reserve: usize) -> Result<Transaction> {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.open.lock().insert(id);
        debug!(target: "stree::journal", unit = id, reserve, "began unit");
        Ok(Transaction::new(id, reserve))
    }

    fn end(&self, txn: Transaction) -> Result<CommittedUnit> {
        if !self.open.lock().remove(&txn.id) {
            return Err(StreeError::Invalid("journal unit is not open"));
        }
        let mut blocks = Vec::with_capacity(txn.dirty.len());
        for id in txn.dirty_blocks() {
            let block = match self.cache.pin(id) {
                Ok(block) => block,
                Err(StreeError::Io(_)) => continue,
                Err(err) => return Err(err),
            };
            let crc32 = block_crc32(id.0, &block.data());
            block.mark_clean();
            blocks.push(LoggedBlock { block: id, crc32 });
        }
        self.blocks_logged
            .fetch_add(blocks.len() as u64, AtomicOrdering::Relaxed);
        let unit = CommittedUnit {
            id: txn.id,
            blocks,
            freed: txn.freed,
        };
        debug!(
            target: "stree::journal",
            unit = unit.id,
            logged = unit.blocks.len(),
            freed = unit.freed.len(),
            "ended unit"
        );
        self.committed.lock().push(unit.clone());
        Ok(unit)
    }
}
