//! Tree engine and the objects stored in it.
//!
//! Implements keyed search over the S+-tree, the item mutation primitives,
//! and the file and directory operations built on them.

/// File and directory objects, tail conversion and truncate.
pub mod file;

/// Engine options and TOML configuration.
pub mod options;

/// Keys, nodes, search and item mutation.
pub mod tree;

pub use file::{FileObject, PageSource, StatData, TruncateReport};
pub use options::{ConfigError, StoreConfig, TailPolicy, TreeOptions};
pub use tree::{
    BalanceOp, Balanced, Balancer, Item, Key, KeyType, KeyVersion, PositionResult, STree,
    STreeBuilder, SearchPos,
};
