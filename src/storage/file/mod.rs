//! Objects stored in the tree: stat data, file content, directories, and
//! the truncate orchestrator.
//!
//! Every public operation here runs in its own journal unit. The primitives
//! in [`crate::storage::tree`] take the unit from the caller instead.

mod object;
mod stat;
mod tail;
mod truncate;

pub use object::FileObject;
pub use stat::{StatData, SD_V1_SIZE, SD_V2_SIZE, S_IFDIR, S_IFMT, S_IFREG};
pub use tail::{
    keep_tail_in_block, max_direct_item_len, CachePageSource, CompensationLog, PageSource,
};
pub use truncate::TruncateReport;

pub(crate) use tail::TailOutcome;
