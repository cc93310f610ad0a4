use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};

use crate::types::BlockId;

/// What a frame currently holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameUse {
    /// Formatted tree node.
    Node,
    /// Raw data block referenced from an indirect item.
    Unformatted,
}

/// In-memory image of one block plus its cache bookkeeping.
pub struct Frame {
    pub id: BlockId,
    pub usage: FrameUse,
    pub buf: RwLock<Box<[u8]>>,
    pub pin_count: AtomicU32,
    pub in_tree: AtomicBool,
    pub locked: AtomicBool,
    pub dirty: AtomicBool,
}

impl Frame {
    pub fn new(id: BlockId, usage: FrameUse, block_size: usize) -> Self {
        Self {
            id,
            usage,
            buf: RwLock::new(vec![0u8; block_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            in_tree: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn pins(&self) -> u32 {
        self.pin_count.load(AtomicOrdering::Acquire)
    }
}
