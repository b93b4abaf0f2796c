//! Core type definitions for the STM engine.

use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing per [`Stm`](crate::Stm) instance
/// and never reused. A transaction keeps its ID across resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Identity of a transactional reference.
///
/// Tranlocals are keyed by this identity inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefId(pub u64);

impl RefId {
    /// Creates a new reference ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref:{}", self.0)
    }
}

/// Lock mode held on an orec, ordered from weakest to strongest.
///
/// `Read` is shared between transactions and counted; `Write` and `Exclusive`
/// admit a single holder. A `Write` lock still lets readers see the committed
/// value through its version, an `Exclusive` (commit) lock does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LockMode {
    /// No lock.
    #[default]
    None,
    /// Shared read lock.
    Read,
    /// Single-holder write lock.
    Write,
    /// Single-holder exclusive lock, also used as the commit lock.
    Exclusive,
}

impl LockMode {
    /// Returns true if this mode holds any lock.
    #[must_use]
    pub const fn is_locked(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Write => "write",
            Self::Exclusive => "exclusive",
        };
        f.write_str(name)
    }
}
