//! Learned sizing of the transactions an executor creates.

use crate::transaction::StorageKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// What an executor learned about its transactions from failed attempts.
///
/// Both values only grow: once a transaction family needed a capacity or a fat
/// transaction, every later transaction of the family starts with it.
#[derive(Debug)]
pub struct SpeculativeConfig {
    min_capacity: AtomicUsize,
    fat: AtomicBool,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeculativeConfig {
    /// Starts with the cheapest transaction: one slot, lean.
    #[must_use]
    pub fn new() -> Self {
        Self {
            min_capacity: AtomicUsize::new(1),
            fat: AtomicBool::new(false),
        }
    }

    /// Returns the number of slots new transactions start with.
    #[must_use]
    pub fn min_capacity(&self) -> usize {
        self.min_capacity.load(Ordering::Acquire)
    }

    /// Returns true if new transactions must be fat.
    #[must_use]
    pub fn is_fat(&self) -> bool {
        self.fat.load(Ordering::Acquire)
    }

    pub(crate) fn require_capacity(&self, capacity: usize) {
        self.min_capacity.fetch_max(capacity, Ordering::AcqRel);
    }

    pub(crate) fn require_fat(&self) {
        self.fat.store(true, Ordering::Release);
    }

    /// Returns the storage layout that fits the learned capacity.
    #[must_use]
    pub fn storage_kind(&self, max_fixed_capacity: usize) -> StorageKind {
        match self.min_capacity() {
            0 | 1 => StorageKind::Mono,
            capacity if capacity <= max_fixed_capacity => StorageKind::Array,
            _ => StorageKind::Map,
        }
    }
}
