#![forbid(unsafe_code)]

mod frame;
mod pager;

pub use frame::FrameUse;
pub use pager::{
    BlockCache, BlockRef, LoadHook, Pager, PagerOptions, PagerStats, MIN_BLOCK_SIZE,
};
