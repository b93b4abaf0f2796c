//! Global and per-transaction conflict counters.
//!
//! A committing writer bumps the global counter whenever a reference it updated
//! still had other arrived transactions. A transaction keeps the value it last saw;
//! as long as the global counter has not moved, none of its reads can have been
//! invalidated and it skips re-validating them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter shared by all transactions of one [`Stm`](crate::Stm).
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    count: AtomicU64,
}

impl GlobalConflictCounter {
    /// Creates a counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current count.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Records that a write may have invalidated reads of other transactions.
    pub fn signal_conflict(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A transaction's cached copy of the global conflict counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalConflictCounter {
    seen: u64,
}

impl LocalConflictCounter {
    /// Creates a local counter synchronized with `global`.
    #[must_use]
    pub fn new(global: &GlobalConflictCounter) -> Self {
        Self {
            seen: global.count(),
        }
    }

    /// Synchronizes with `global` without checking.
    pub fn reset(&mut self, global: &GlobalConflictCounter) {
        self.seen = global.count();
    }

    /// Returns the last synchronized value.
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Synchronizes with `global` and returns true if it moved since the last
    /// synchronization, in which case reads must be re-validated.
    pub fn sync_and_check_conflict(&mut self, global: &GlobalConflictCounter) -> bool {
        let current = global.count();
        if current == self.seen {
            return false;
        }
        self.seen = current;
        true
    }
}
