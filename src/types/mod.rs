//! Identifiers, the engine error type and shared result alias.

use std::fmt;

/// CRC32 of block images as they are logged.
pub mod checksum;

pub use checksum::block_crc32;

/// Number of a block owned by the block cache.
///
/// Block `0` is never handed out by the allocator; an indirect item pointer of
/// `0` therefore denotes a hole.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Pointer value stored in indirect items for a hole.
    pub const NULL: BlockId = BlockId(0);

    /// Returns `true` for the hole pointer.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the tree engine and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum StreeError {
    /// Underlying read or write failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A node failed structural validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Key or item absent.
    #[error("not found")]
    NotFound,
    /// Insert or paste target already exists.
    #[error("item or position already exists")]
    Duplicate,
    /// The balancer or allocator ran out of space.
    #[error("no space left to complete the balance")]
    OutOfSpace,
    /// An unformatted block stayed busy past the configured retry limit.
    #[error("block {block} stayed busy past the retry limit")]
    Busy {
        /// The busy block.
        block: BlockId,
    },
    /// Options could not be loaded.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreeError>;
