//! Optimistic-concurrency helpers shared by search and the planner.
//!
//! The tree never holds a tree-wide lock across a blocking step. Instead every
//! structural change bumps a [`Generation`]; readers snapshot it before a
//! blocking load and re-validate afterwards. [`BoundedWait`] is the
//! cooperative retry loop used while an unformatted block is busy.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::thread;
use std::time::Duration;

/// Global structural-mutation counter.
///
/// The value is odd while a structural change is being written. Readers take
/// a [`Generation::stable_snapshot`] before reading nodes and compare it
/// afterwards, so a change that overlaps the read is always seen.
#[derive(Debug, Default)]
pub struct Generation {
    value: AtomicU64,
}

/// Value of a [`Generation`] observed at some point in time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GenerationSnapshot(pub u64);

impl GenerationSnapshot {
    /// Returns `true` if no change was being written when this was taken.
    pub fn is_stable(self) -> bool {
        self.0 % 2 == 0
    }
}

impl Generation {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the current value.
    pub fn snapshot(&self) -> GenerationSnapshot {
        GenerationSnapshot(self.value.load(AtomicOrdering::Acquire))
    }

    /// Reads the current value once no change is being written.
    pub fn stable_snapshot(&self) -> GenerationSnapshot {
        loop {
            let snapshot = self.snapshot();
            if snapshot.is_stable() {
                return snapshot;
            }
            thread::yield_now();
        }
    }

    /// Records one complete structural mutation and returns the new value.
    pub fn bump(&self) -> GenerationSnapshot {
        GenerationSnapshot(self.value.fetch_add(2, AtomicOrdering::AcqRel) + 2)
    }

    /// Marks a structural change as in progress until the returned guard is
    /// finished or dropped.
    pub fn begin_change(&self) -> GenerationChange<'_> {
        self.value.fetch_add(1, AtomicOrdering::AcqRel);
        GenerationChange {
            generation: self,
            finished: false,
        }
    }

    /// Returns `true` when at least one mutation happened after `snapshot`.
    pub fn changed_since(&self, snapshot: GenerationSnapshot) -> bool {
        self.snapshot() != snapshot
    }
}

/// A structural change in progress; see [`Generation::begin_change`].
#[derive(Debug)]
pub struct GenerationChange<'a> {
    generation: &'a Generation,
    finished: bool,
}

impl GenerationChange<'_> {
    /// Publishes the change and returns the new stable value.
    pub fn finish(mut self) -> GenerationSnapshot {
        self.finished = true;
        GenerationSnapshot(self.generation.value.fetch_add(1, AtomicOrdering::AcqRel) + 1)
    }
}

impl Drop for GenerationChange<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.generation.value.fetch_add(1, AtomicOrdering::AcqRel);
        }
    }
}

/// Bounded, yielding retry loop.
///
/// The first few waits only yield the thread; later ones sleep for
/// `backoff`, doubling up to sixteen times the base. `wait` returns `false`
/// once `limit` waits have been spent.
#[derive(Debug)]
pub struct BoundedWait {
    limit: u32,
    spent: u32,
    backoff: Duration,
}

const YIELD_ONLY_ROUNDS: u32 = 3;

impl BoundedWait {
    /// Creates a wait budget of `limit` rounds.
    pub fn new(limit: u32, backoff: Duration) -> Self {
        Self {
            limit,
            spent: 0,
            backoff,
        }
    }

    /// Number of waits performed so far.
    pub fn spent(&self) -> u32 {
        self.spent
    }

    /// Returns `true` if the budget is exhausted.
    pub fn exhausted(&self) -> bool {
        self.spent >= self.limit
    }

    /// Performs one cooperative wait. Returns `false` without waiting when
    /// the budget is exhausted.
    pub fn wait(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        self.spent += 1;
        if self.spent <= YIELD_ONLY_ROUNDS || self.backoff.is_zero() {
            thread::yield_now();
        } else {
            let shift = (self.spent - YIELD_ONLY_ROUNDS).min(4);
            thread::sleep(self.backoff * (1u32 << shift) / 2);
        }
        true
    }

    /// Resets the budget after progress was made.
    pub fn reset(&mut self) {
        self.spent = 0;
    }
}
