use serde::Serialize;
use tracing::{debug, info};

use super::object::FileObject;
use crate::primitives::wal::Transaction;
use crate::storage::tree::key::DOT_OFFSET;
use crate::storage::tree::{KeyLen, KeyType, KeyVersion, PositionResult, STree};
use crate::types::{Result, StreeError};

/// Summary of one truncate.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TruncateReport {
    /// Content bytes counted as removed.
    pub bytes_removed: u64,
    /// Cut calls issued.
    pub cuts: u32,
    /// Journal units ended early to bound the work per unit.
    pub checkpoints: u32,
    /// The tail was packed into direct items.
    pub converted: bool,
}

impl STree {
    /// Shrinks `object` to `new_size` bytes.
    ///
    /// Directories are never byte-truncated: an empty directory loses its
    /// `.`/`..` item and `new_size` is ignored. Files are cut from the end,
    /// one item per step, and the journal unit is checkpointed whenever it
    /// has logged more than `truncate_checkpoint_blocks` blocks. Growing a
    /// file is left to the writer; the stat data is updated either way.
    pub fn truncate(
        &self,
        object: &mut FileObject,
        new_size: u64,
        update_timestamps: bool,
    ) -> Result<TruncateReport> {
        let mut txn = self.begin()?;
        let result = if object.is_dir() {
            self.truncate_directory(&mut txn, object)
        } else {
            self.truncate_file(&mut txn, object, new_size, update_timestamps)
        };
        let ended = self.end(txn);
        let report = result?;
        ended?;
        Ok(report)
    }

    fn truncate_directory(&self, txn: &mut Transaction, dir: &mut FileObject) -> Result<TruncateReport> {
        let entries = self.list_entries(dir)?;
        if entries.is_empty() {
            return Ok(TruncateReport::default());
        }
        if entries.len() > 2 {
            return Err(StreeError::Invalid("directory is not empty"));
        }
        let removed = self.delete(txn, &dir.item_key(KeyType::DirEntry, DOT_OFFSET))?;
        dir.stat.size = 0;
        dir.stat.touch();
        self.update_stat_data(txn, dir)?;
        debug!(target: "stree::truncate", dir = %dir.key, "removed dot entries");
        Ok(TruncateReport {
            bytes_removed: removed,
            cuts: 1,
            ..TruncateReport::default()
        })
    }

    fn truncate_file(
        &self,
        txn: &mut Transaction,
        file: &mut FileObject,
        new_size: u64,
        update_timestamps: bool,
    ) -> Result<TruncateReport> {
        let block_size = self.block_size() as u64;
        let mut report = TruncateReport::default();
        let (path, result) = self.search_object_end(&file.key)?;
        match result {
            PositionResult::PositionFound => {
                return Err(StreeError::Corruption("item at the largest object offset"))
            }
            PositionResult::FileNotFound => return Err(StreeError::Corruption("object has no stat data")),
            PositionResult::PositionNotFound => {}
        }
        let last = path.item_head()?;
        drop(path);
        let mut content = match last.kind() {
            KeyType::StatData => 0,
            KeyType::Direct | KeyType::Indirect => last.key.offset + last.op_bytes(self.block_size()) - 1,
            KeyType::DirEntry | KeyType::Any => {
                return Err(StreeError::Corruption("file ends in a non-file item"))
            }
        };
        let floor = match file.version() {
            KeyVersion::V2 => new_size.div_ceil(block_size) * block_size,
            KeyVersion::V1 => new_size,
        };

        if content > new_size {
            let mut key = file.item_key(KeyType::Direct, content).with_len(KeyLen::Three);
            loop {
                key.offset = content;
                let step = self.cut_step(txn, file, &key, new_size)?;
                report.cuts += 1;
                report.bytes_removed += step.removed;
                report.converted |= step.converted;
                content = content.saturating_sub(step.removed);

                if txn.logged_blocks() > self.options.truncate_checkpoint_blocks {
                    file.stat.size = file.stat.size.min(content.max(new_size));
                    if update_timestamps {
                        file.stat.touch();
                    }
                    self.update_stat_data(txn, file)?;
                    let fresh = self.begin()?;
                    let done = std::mem::replace(txn, fresh);
                    let logged = done.logged_blocks();
                    self.end(done)?;
                    report.checkpoints += 1;
                    debug!(
                        target: "stree::truncate",
                        object = %file.key,
                        logged,
                        content,
                        "checkpointed truncate"
                    );
                }

                if content <= floor || step.removed == 0 {
                    break;
                }
                key.offset = content;
                if self.search_for_position(&key)?.1 != PositionResult::PositionFound {
                    break;
                }
            }
        }

        file.stat.size = new_size;
        if update_timestamps {
            file.stat.touch();
        }
        self.update_stat_data(txn, file)?;
        info!(
            target: "stree::truncate",
            object = %file.key,
            new_size,
            removed = report.bytes_removed,
            cuts = report.cuts,
            checkpoints = report.checkpoints,
            converted = report.converted,
            "truncated"
        );
        Ok(report)
    }
}
