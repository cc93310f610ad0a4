#![forbid(unsafe_code)]

//! S+-tree search and item mutation engine.
//!
//! Keys are ordered `(dir_id, object_id, offset, type)`. Leaves hold items,
//! internal nodes hold separator keys and child pointers. Searches never hold
//! a tree-wide lock across a blocking load; they detect concurrent structural
//! changes through the shared [`Generation`] counter and restart from the
//! root instead.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::primitives::concurrency::Generation;
use crate::primitives::pager::{BlockCache, FrameUse};
use crate::primitives::wal::{Journal, Transaction};
use crate::storage::file::{CachePageSource, PageSource};
use crate::storage::options::TreeOptions;
use crate::types::{BlockId, Result, StreeError};

/// Balancer collaborator and its in-memory reference implementation.
pub mod balance;
/// Directory entry codec and entry search.
pub mod entry;
/// Item heads and item body helpers.
pub mod item;
/// Keys, ordering and on-disk key encodings.
pub mod key;
/// Node format and shape validation.
pub mod node;
/// Pinned root-to-node paths and delimiting keys.
pub mod path;
/// Delete/cut planning per item kind.
pub mod planner;
mod mutate;
mod search;
mod stats;

pub use balance::{BalanceOp, Balanced, Balancer, SimpleBalancer};
pub use entry::{DirEntry, EntrySearch, OffsetEntrySearch};
pub use item::{Item, ItemHead};
pub use key::{Key, KeyLen, KeyType, KeyVersion, MAX_KEY, MIN_KEY};
pub use node::{SearchPos, LEAF_LEVEL};
pub use path::TreePath;
pub use planner::{calc_deleted_bytes, Plan, PlanOutcome};
pub use search::{item_moved, PositionResult};
pub use stats::{TreeStats, TreeStatsSnapshot};


/// Current root block and tree height.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RootInfo {
    /// Root block.
    pub block: BlockId,
    /// Level of the root; `1` when the root is a leaf.
    pub height: u16,
}

/// State shared by the engine and its balancer.
pub struct TreeContext {
    cache: Arc<dyn BlockCache>,
    generation: Generation,
    root: RwLock<RootInfo>,
    stats: TreeStats,
}

impl TreeContext {
    /// Block cache holding the tree.
    pub fn cache(&self) -> &Arc<dyn BlockCache> {
        &self.cache
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    /// Structural mutation counter.
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Current root.
    pub fn root(&self) -> RootInfo {
        *self.root.read()
    }

    /// Installs a new root. Only the balancer calls this.
    pub fn set_root(&self, root: RootInfo) {
        *self.root.write() = root;
    }

    /// Engine counters.
    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }
}

/// Builder for [`STree`].
pub struct STreeBuilder {
    cache: Arc<dyn BlockCache>,
    journal: Arc<dyn Journal>,
    balancer: Option<Arc<dyn Balancer>>,
    pages: Option<Arc<dyn PageSource>>,
    entries: Option<Arc<dyn EntrySearch>>,
    options: TreeOptions,
}

impl STreeBuilder {
    /// Replaces the balancer.
    pub fn balancer(mut self, balancer: Arc<dyn Balancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    /// Replaces the page source used for tail conversion.
    pub fn page_source(mut self, pages: Arc<dyn PageSource>) -> Self {
        self.pages = Some(pages);
        self
    }

    /// Replaces the directory entry search.
    pub fn entry_search(mut self, entries: Arc<dyn EntrySearch>) -> Self {
        self.entries = Some(entries);
        self
    }

    /// Sets the engine options.
    pub fn options(mut self, options: TreeOptions) -> Self {
        self.options = options;
        self
    }

    /// Formats an empty root leaf and returns the engine.
    pub fn create(self) -> Result<STree> {
        self.options
            .validate()
            .map_err(|err| StreeError::Config(err.to_string()))?;
        let root = self.cache.allocate(FrameUse::Node)?;
        node::format_empty_leaf(&mut root.data_mut())?;
        root.set_in_tree(true);
        let mut txn = self.journal.begin(1)?;
        txn.mark_dirty(&root);
        self.journal.end(txn)?;
        let root_info = RootInfo {
            block: root.id(),
            height: LEAF_LEVEL,
        };
        info!(
            target: "stree::tree",
            root = root_info.block.0,
            block_size = self.cache.block_size(),
            "created empty tree"
        );
        let pages = self
            .pages
            .unwrap_or_else(|| Arc::new(CachePageSource::new(Arc::clone(&self.cache))));
        Ok(STree {
            ctx: Arc::new(TreeContext {
                cache: self.cache,
                generation: Generation::new(),
                root: RwLock::new(root_info),
                stats: TreeStats::default(),
            }),
            balancer: self
                .balancer
                .unwrap_or_else(|| Arc::new(SimpleBalancer::new())),
            journal: self.journal,
            pages,
            entries: self
                .entries
                .unwrap_or_else(|| Arc::new(OffsetEntrySearch)),
            options: self.options,
        })
    }
}

/// The tree engine: search, mutation primitives and the object operations
/// built on them.
pub struct STree {
    pub(crate) ctx: Arc<TreeContext>,
    pub(crate) balancer: Arc<dyn Balancer>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) pages: Arc<dyn PageSource>,
    pub(crate) entries: Arc<dyn EntrySearch>,
    pub(crate) options: TreeOptions,
}

impl STree {
    /// Starts building an engine over `cache`, logging through `journal`.
    pub fn builder(cache: Arc<dyn BlockCache>, journal: Arc<dyn Journal>) -> STreeBuilder {
        STreeBuilder {
            cache,
            journal,
            balancer: None,
            pages: None,
            entries: None,
            options: TreeOptions::default(),
        }
    }

    /// Shared engine state.
    pub fn context(&self) -> &Arc<TreeContext> {
        &self.ctx
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.ctx.block_size()
    }

    /// Current root and height.
    pub fn root(&self) -> RootInfo {
        self.ctx.root()
    }

    /// Engine options.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Engine counters.
    pub fn stats(&self) -> &TreeStats {
        self.ctx.stats()
    }

    /// Begins a unit of durable work with the configured reservation.
    pub fn begin(&self) -> Result<Transaction> {
        self.journal.begin(self.options.journal_reserve_blocks)
    }

    /// Ends a unit of durable work.
    pub fn end(&self, txn: Transaction) -> Result<()> {
        self.journal.end(txn).map(|_| ())
    }
}
