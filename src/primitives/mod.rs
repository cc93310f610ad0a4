//! Low-level collaborators the tree engine is built on.
//!
//! Includes the block cache, the journal, and the optimistic-concurrency
//! helpers.

/// Generation counter and bounded cooperative waits.
pub mod concurrency;

/// Block cache, pin guards and allocator.
///
/// Manages block images, pin counts and the in-tree flag used by search.
pub mod pager;

/// Units of durable work.
///
/// Records which blocks each unit dirtied and logs them when it ends.
pub mod wal;
