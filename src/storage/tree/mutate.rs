//! Insert, paste, cut and delete.
//!
//! Each primitive plans against a fresh path, hands the change to the
//! balancer, and searches again whenever the balancer answers
//! [`Balanced::Repeat`].

use tracing::{debug, trace};

use super::balance::{BalanceOp, Balanced};
use super::item::{pointer_at, Item};
use super::key::{Key, KeyLen, KeyType};
use super::node::{max_item_len, NodeView};
use super::path::TreePath;
use super::planner::{calc_deleted_bytes, Plan};
use super::search::PositionResult;
use super::STree;
use crate::primitives::wal::Transaction;
use crate::storage::file::{CompensationLog, FileObject, TailOutcome};
use crate::types::{Result, StreeError};

/// What one cut did.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CutStep {
    /// Content bytes counted as removed.
    pub(crate) removed: u64,
    /// The tail moved into direct items.
    pub(crate) converted: bool,
}

impl STree {
    /// Inserts a new item.
    ///
    /// Fails with `Duplicate` when an item with the same key exists, before
    /// or after any repeat.
    pub fn insert(&self, txn: &mut Transaction, item: &Item) -> Result<()> {
        if item.head.key.len != KeyLen::Four || item.head.kind() == KeyType::Any {
            return Err(StreeError::Invalid("items need a full key of a concrete kind"));
        }
        loop {
            let (path, pos) = self.search_item(&item.head.key)?;
            if pos.is_found() {
                return Err(StreeError::Duplicate);
            }
            match self.balancer.balance(&self.ctx, txn, &path, BalanceOp::Insert(item))? {
                Balanced::Applied => {
                    trace!(target: "stree::tree", key = %item.head.key, len = item.head.len, "inserted");
                    return Ok(());
                }
                Balanced::Repeat => continue,
            }
        }
    }

    /// Appends `bytes` to the item that ends right before `key`.
    ///
    /// File items grow at their end; for a directory key `bytes` is one
    /// encoded entry placed in offset order. Fails with `Duplicate` when the
    /// position is already covered and `NotFound` when the object has no
    /// item to extend.
    pub fn paste(&self, txn: &mut Transaction, key: &Key, bytes: &[u8]) -> Result<()> {
        loop {
            let (path, result) = self.search_for_position(key)?;
            match result {
                PositionResult::PositionFound => return Err(StreeError::Duplicate),
                PositionResult::FileNotFound => return Err(StreeError::NotFound),
                PositionResult::PositionNotFound => {}
            }
            let head = path.item_head()?;
            if head.kind() != key.kind {
                return Err(StreeError::Invalid("paste key kind differs from the item"));
            }
            if head.kind() != KeyType::DirEntry
                && head.key.offset + head.op_bytes(self.block_size()) != key.offset
            {
                return Err(StreeError::Invalid("paste must extend the item end"));
            }
            if usize::from(head.len) + bytes.len() > max_item_len(self.block_size()) {
                return Err(StreeError::OutOfSpace);
            }
            match self.balancer.balance(&self.ctx, txn, &path, BalanceOp::Paste(bytes))? {
                Balanced::Applied => {
                    trace!(target: "stree::tree", %key, len = bytes.len(), "pasted");
                    return Ok(());
                }
                Balanced::Repeat => continue,
            }
        }
    }

    /// Shrinks the object item holding `key` toward `new_size` and returns
    /// the content bytes that went away.
    ///
    /// One call removes at most one item's worth. When only the tail block
    /// is left past `new_size` the tail may be packed into direct items; if
    /// removing the last pointer then fails, the packing is undone before
    /// the error surfaces.
    pub fn cut(
        &self,
        txn: &mut Transaction,
        object: &FileObject,
        key: &Key,
        new_size: u64,
    ) -> Result<u64> {
        self.cut_step(txn, object, key, new_size).map(|step| step.removed)
    }

    pub(crate) fn cut_step(
        &self,
        txn: &mut Transaction,
        object: &FileObject,
        key: &Key,
        new_size: u64,
    ) -> Result<CutStep> {
        let block_size = self.block_size() as u64;
        let mut key = *key;
        let mut new_size = new_size;
        let mut path = self.locate_exact(&key)?;
        let mut conversion: Option<CompensationLog> = None;
        let mut converted_bytes = None;
        loop {
            let outcome = match self.prepare_delete_or_cut(txn, &mut path, &key, new_size) {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.abandon_conversion(txn, conversion, err)),
            };
            let op = match outcome.plan {
                Plan::Convert => {
                    if conversion.is_some() {
                        let err = StreeError::Corruption("tail block survived its conversion");
                        return Err(self.abandon_conversion(txn, conversion, err));
                    }
                    let head = outcome.head;
                    let last_block = {
                        let leaf = path.leaf()?;
                        let data = leaf.data();
                        let body = NodeView::new(&data)?.item_body(&head)?;
                        pointer_at(body, head.pointer_count() - 1)?
                    };
                    path.release();
                    match self.maybe_indirect_to_direct(txn, object, &head, last_block, new_size)? {
                        TailOutcome::Skipped { bytes } => {
                            return Ok(CutStep {
                                removed: bytes,
                                converted: false,
                            })
                        }
                        TailOutcome::Packed { log, bytes } => {
                            conversion = Some(log);
                            converted_bytes = Some(bytes);
                        }
                    }
                    key = key.with_kind(KeyType::Indirect).with_len(KeyLen::Four);
                    new_size = (key.offset - 1) & !(block_size - 1);
                    key.offset = new_size + 1;
                    path = match self.search_for_position(&key) {
                        Ok((found, PositionResult::PositionFound)) => found,
                        Ok(_) => {
                            let err = StreeError::Corruption("converted indirect item vanished");
                            return Err(self.abandon_conversion(txn, conversion, err));
                        }
                        Err(err) => return Err(self.abandon_conversion(txn, conversion, err)),
                    };
                    continue;
                }
                Plan::CutBytes { delta: 0, .. } => {
                    return Ok(CutStep {
                        removed: converted_bytes.unwrap_or(0),
                        converted: conversion.is_some(),
                    })
                }
                Plan::CutBytes { delta, start_pos } => {
                    path.set_pos_in_item(start_pos);
                    BalanceOp::Cut { delta }
                }
                Plan::DeleteWhole => BalanceOp::Delete,
            };
            match self.balancer.balance(&self.ctx, txn, &path, op) {
                Ok(Balanced::Applied) => {
                    let removed = converted_bytes
                        .unwrap_or_else(|| calc_deleted_bytes(outcome.plan, &outcome.head, self.block_size()));
                    trace!(target: "stree::tree", item = %outcome.head.key, ?op, removed, "cut");
                    return Ok(CutStep {
                        removed,
                        converted: conversion.is_some(),
                    });
                }
                Ok(Balanced::Repeat) => {
                    path.release();
                    path = match self.locate_exact(&key) {
                        Ok(found) => found,
                        Err(err) => return Err(self.abandon_conversion(txn, conversion, err)),
                    };
                }
                Err(err) => {
                    debug!(target: "stree::tree", %err, item = %outcome.head.key, "balancer refused the cut");
                    return Err(self.abandon_conversion(txn, conversion, err));
                }
            }
        }
    }

    /// Removes the item at `key`, or a single entry for a directory key, and
    /// returns the bytes removed.
    ///
    /// Indirect items may take several rounds when a block stays busy; the
    /// loop ends with `Busy` if no progress is possible.
    pub fn delete(&self, txn: &mut Transaction, key: &Key) -> Result<u64> {
        let delete_size = key.version.max_offset();
        let mut total = 0;
        loop {
            let mut path = self.locate_exact(key)?;
            let outcome = self.prepare_delete_or_cut(txn, &mut path, key, delete_size)?;
            let op = match outcome.plan {
                Plan::DeleteWhole => BalanceOp::Delete,
                Plan::CutBytes { delta, start_pos } => {
                    path.set_pos_in_item(start_pos);
                    BalanceOp::Cut { delta }
                }
                Plan::Convert => return Err(StreeError::Corruption("delete planned a tail conversion")),
            };
            match self.balancer.balance(&self.ctx, txn, &path, op)? {
                Balanced::Applied => {
                    total += calc_deleted_bytes(outcome.plan, &outcome.head, self.block_size());
                    let partial = matches!(outcome.plan, Plan::CutBytes { .. })
                        && outcome.head.kind() == KeyType::Indirect;
                    if !partial {
                        trace!(target: "stree::tree", %key, total, "deleted");
                        return Ok(total);
                    }
                }
                Balanced::Repeat => continue,
            }
        }
    }

    fn locate_exact(&self, key: &Key) -> Result<TreePath> {
        match self.search_for_position(key)? {
            (path, PositionResult::PositionFound) => Ok(path),
            _ => Err(StreeError::NotFound),
        }
    }
}
