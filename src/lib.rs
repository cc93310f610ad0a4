//! ReiserFS-style S+-tree search and item mutation engine.
//!
//! The crate is layered the same way the engine runs: [`types`] holds ids and
//! the error type, [`primitives`] the block cache, journal and concurrency
//! helpers, and [`storage`] the tree itself plus the file operations on top.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod primitives;
pub mod storage;
pub mod types;
