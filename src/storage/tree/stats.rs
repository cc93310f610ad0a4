use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree engine counters at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeStatsSnapshot {
    /// Completed key searches.
    pub searches: u64,
    /// Descents restarted from the root after a concurrent change
    pub restarts: u64,
    /// Balancer calls that asked for a re-search.
    pub balance_repeats: u64,
    /// Leaf splits performed by the balancer
    pub leaf_splits: u64,
    /// Internal node splits performed by the balancer
    pub internal_splits: u64,
    /// Nodes unlinked because they became empty
    pub nodes_removed: u64,
    /// Indirect tails moved into direct items.
    pub conversions: u64,
    /// Tail conversions undone after a failed pointer removal.
    pub rollbacks: u64,
    /// Cooperative waits on busy unformatted blocks.
    pub busy_waits: u64,
    /// Unformatted blocks released by cuts
    pub blocks_freed: u64,
}

/// Thread-safe counters for tree operations.
#[derive(Default)]
pub struct TreeStats {
    searches: AtomicU64,
    restarts: AtomicU64,
    balance_repeats: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    nodes_removed: AtomicU64,
    conversions: AtomicU64,
    rollbacks: AtomicU64,
    busy_waits: AtomicU64,
    blocks_freed: AtomicU64,
}

impl TreeStats {
    /// Returns the number of completed searches.
    pub fn searches(&self) -> u64 {
        self.searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of restarted descents.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of balancer repeats.
    pub fn balance_repeats(&self) -> u64 {
        self.balance_repeats.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of tail conversions.
    pub fn conversions(&self) -> u64 {
        self.conversions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of conversion rollbacks.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of busy-block waits.
    pub fn busy_waits(&self) -> u64 {
        self.busy_waits.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_searches(&self) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_restarts(&self) {
        self.restarts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_balance_repeats(&self) {
        self.balance_repeats.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_nodes_removed(&self) {
        self.nodes_removed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_conversions(&self) {
        self.conversions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_busy_waits(&self) {
        self.busy_waits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_blocks_freed(&self) {
        self.blocks_freed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current counters.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            searches: self.searches(),
            restarts: self.restarts(),
            balance_repeats: self.balance_repeats(),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            internal_splits: self.internal_splits.load(AtomicOrdering::Relaxed),
            nodes_removed: self.nodes_removed.load(AtomicOrdering::Relaxed),
            conversions: self.conversions(),
            rollbacks: self.rollbacks(),
            busy_waits: self.busy_waits(),
            blocks_freed: self.blocks_freed.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits current counters to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "stree::stats",
            searches = snapshot.searches,
            restarts = snapshot.restarts,
            balance_repeats = snapshot.balance_repeats,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            nodes_removed = snapshot.nodes_removed,
            conversions = snapshot.conversions,
            rollbacks = snapshot.rollbacks,
            busy_waits = snapshot.busy_waits,
            blocks_freed = snapshot.blocks_freed,
            "tree stats snapshot"
        );
    }
}
