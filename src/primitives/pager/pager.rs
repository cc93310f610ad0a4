use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use tracing::{debug, trace};

use super::frame::{Frame, FrameUse};
use crate::types::{BlockId, Result, StreeError};

/// Smallest block size the node format can describe.
pub const MIN_BLOCK_SIZE: u32 = 256;

/// Configuration options for the in-memory pager.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each block in bytes; a power of two.
    pub block_size: u32,
    /// Number of blocks in the device, including the reserved block `0`.
    pub capacity_blocks: u32,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            capacity_blocks: 1 << 16,
        }
    }
}

/// Callback run while a block is being loaded. It stands in for the time a
/// real read spends blocked on I/O, during which other writers may run.
pub type LoadHook = Arc<dyn Fn(BlockId) + Send + Sync>;

/// Block cache and allocator consumed by the tree engine.
pub trait BlockCache: Send + Sync + 'static {
    /// Returns the block size in bytes.
    fn block_size(&self) -> usize;
    /// Pins a block, loading it if needed. May block.
    fn pin(&self, id: BlockId) -> Result<BlockRef>;
    /// Allocates a zeroed block and returns it pinned.
    fn allocate(&self, usage: FrameUse) -> Result<BlockRef>;
    /// Returns a block to the allocator. Holders of existing pins keep a
    /// detached image that is no longer part of the tree.
    fn free(&self, id: BlockId) -> Result<()>;
    /// Returns `true` if the block is locked for I/O or pinned by anyone.
    fn is_busy(&self, id: BlockId) -> Result<bool>;
    /// Number of blocks still available to the allocator.
    fn free_count(&self) -> u32;
    /// Number of outstanding pins across all cached blocks.
    fn pinned(&self) -> u64;
}

/// A pinned reference to a cached block. Dropping it releases the pin.
pub struct BlockRef {
    frame: Arc<Frame>,
}

impl BlockRef {
    fn new(frame: Arc<Frame>) -> Self {
        frame.pin_count.fetch_add(1, AtomicOrdering::AcqRel);
        Self { frame }
    }

    /// Block number.
    pub fn id(&self) -> BlockId {
        self.frame.id
    }

    /// What the block holds.
    pub fn usage(&self) -> FrameUse {
        self.frame.usage
    }

    /// Shared access to the block image.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.buf.read()
    }

    /// Exclusive access to the block image.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.frame.dirty.store(true, AtomicOrdering::Release);
        self.frame.buf.write()
    }

    /// Whether the block is still linked into the tree.
    pub fn is_in_tree(&self) -> bool {
        self.frame.in_tree.load(AtomicOrdering::Acquire)
    }

    /// Links or unlinks the block from the tree.
    pub fn set_in_tree(&self, in_tree: bool) {
        self.frame.in_tree.store(in_tree, AtomicOrdering::Release);
    }

    /// Whether the image was modified since it was last logged.
    pub fn is_dirty(&self) -> bool {
        self.frame.dirty.load(AtomicOrdering::Acquire)
    }

    /// Clears the dirty flag once the journal has logged the image.
    pub fn mark_clean(&self) {
        self.frame.dirty.store(false, AtomicOrdering::Release);
    }

    /// Returns `true` if both references pin the same cached image.
    pub fn same_frame(&self, other: &BlockRef) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame)
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        BlockRef::new(Arc::clone(&self.frame))
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.frame.pin_count.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("id", &self.frame.id)
            .field("usage", &self.frame.usage)
            .field("pins", &self.frame.pins())
            .finish()
    }
}

/// Snapshot of pager counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PagerStats {
    /// Blocks loaded through [`BlockCache::pin`].
    pub loads: u64,
    /// Successful allocations.
    pub allocations: u64,
    /// Blocks returned to the allocator.
    pub frees: u64,
    /// Blocks currently allocated.
    pub allocated: u32,
}

impl fmt::Display for PagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loads={} allocations={} frees={} allocated={}",
            self.loads, self.allocations, self.frees, self.allocated
        )
    }
}

struct PagerInner {
    frames: HashMap<BlockId, Arc<Frame>>,
    free: BTreeSet<u32>,
    failing_reads: HashSet<BlockId>,
}

/// In-memory block cache with a bitmap-style allocator.
pub struct Pager {
    options: PagerOptions,
    inner: Mutex<PagerInner>,
    load_hook: Mutex<Option<LoadHook>>,
    loads: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl Pager {
    /// Creates an empty device described by `options`.
    pub fn new(options: PagerOptions) -> Result<Self> {
        if !options.block_size.is_power_of_two() || options.block_size < MIN_BLOCK_SIZE {
            return Err(StreeError::Invalid(
                "block size must be a power of two of at least 256 bytes",
            ));
        }
        if options.block_size > u16::MAX as u32 + 1 {
            return Err(StreeError::Invalid("block size exceeds 64 KiB"));
        }
        if options.capacity_blocks < 2 {
            return Err(StreeError::Invalid("device needs at least two blocks"));
        }
        let free = (1..options.capacity_blocks).collect();
        Ok(Self {
            options,
            inner: Mutex::new(PagerInner {
                frames: HashMap::new(),
                free,
                failing_reads: HashSet::new(),
            }),
            load_hook: Mutex::new(None),
            loads: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    /// Options the pager was created with.
    pub fn options(&self) -> &PagerOptions {
        &self.options
    }

    /// Installs a hook that runs inside every [`BlockCache::pin`] after the
    /// block has been pinned and before it is returned.
    pub fn set_load_hook(&self, hook: Option<LoadHook>) {
        *self.load_hook.lock() = hook;
    }

    /// Makes subsequent loads of `id` fail with an I/O error.
    pub fn fail_reads(&self, id: BlockId, failing: bool) {
        let mut inner = self.inner.lock();
        if failing {
            inner.failing_reads.insert(id);
        } else {
            inner.failing_reads.remove(&id);
        }
    }

    /// Marks a block as locked for I/O, which makes it busy.
    pub fn lock_block(&self, id: BlockId) -> Result<()> {
        let frame = self.frame(id)?;
        frame.locked.store(true, AtomicOrdering::Release);
        Ok(())
    }

    /// Clears the I/O lock set by [`Pager::lock_block`].
    pub fn unlock_block(&self, id: BlockId) -> Result<()> {
        let frame = self.frame(id)?;
        frame.locked.store(false, AtomicOrdering::Release);
        Ok(())
    }

    /// Returns `true` if `id` is currently allocated.
    pub fn is_allocated(&self, id: BlockId) -> bool {
        self.inner.lock().frames.contains_key(&id)
    }

    /// Snapshot of the pager counters.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            loads: self.loads.load(AtomicOrdering::Relaxed),
            allocations: self.allocations.load(AtomicOrdering::Relaxed),
            frees: self.frees.load(AtomicOrdering::Relaxed),
            allocated: self.inner.lock().frames.len() as u32,
        }
    }

    fn frame(&self, id: BlockId) -> Result<Arc<Frame>> {
        self.inner
            .lock()
            .frames
            .get(&id)
            .cloned()
            .ok_or(StreeError::Invalid("block is not allocated"))
    }
}

impl BlockCache for Pager {
    fn block_size(&self) -> usize {
        self.options.block_size as usize
    }

    fn pin(&self, id: BlockId) -> Result<BlockRef> {
        let frame = {
            let inner = self.inner.lock();
            if inner.failing_reads.contains(&id) {
                return Err(StreeError::Io(io::Error::new(
                    ErrorKind::Other,
                    format!("injected read failure on block {id}"),
                )));
            }
            match inner.frames.get(&id) {
                Some(frame) => Arc::clone(frame),
                None => {
                    return Err(StreeError::Io(io::Error::new(
                        ErrorKind::NotFound,
                        format!("block {id} is not allocated"),
                    )))
                }
            }
        };
        let block = BlockRef::new(frame);
        self.loads.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "stree::pager", block = id.0, "pinned block");
        let hook = self.load_hook.lock().clone();
        if let Some(hook) = hook {
            hook(id);
        }
        Ok(block)
    }

    fn allocate(&self, usage: FrameUse) -> Result<BlockRef> {
        let mut inner = self.inner.lock();
        let Some(raw) = inner.free.pop_first() else {
            debug!(target: "stree::pager", "allocator exhausted");
            return Err(StreeError::OutOfSpace);
        };
        let id = BlockId(raw);
        let frame = Arc::new(Frame::new(id, usage, self.options.block_size as usize));
        inner.frames.insert(id, Arc::clone(&frame));
        drop(inner);
        self.allocations.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "stree::pager", block = raw, ?usage, "allocated block");
        Ok(BlockRef::new(frame))
    }

    fn free(&self, id: BlockId) -> Result<()> {
        if id.is_null() {
            return Err(StreeError::Invalid("cannot free the null block"));
        }
        let mut inner = self.inner.lock();
        let frame = inner
            .frames
            .remove(&id)
            .ok_or(StreeError::Invalid("double free of block"))?;
        frame.in_tree.store(false, AtomicOrdering::Release);
        inner.free.insert(id.0);
        drop(inner);
        self.frees.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "stree::pager", block = id.0, "freed block");
        Ok(())
    }

    fn is_busy(&self, id: BlockId) -> Result<bool> {
        let frame = self.frame(id)?;
        Ok(frame.locked.load(AtomicOrdering::Acquire) || frame.pins() > 0)
    }

    fn free_count(&self) -> u32 {
        self.inner.lock().free.len() as u32
    }

    fn pinned(&self) -> u64 {
        self.inner
            .lock()
            .frames
            .values()
            .map(|frame| u64::from(frame.pins()))
            .sum()
    }
}
