//! Property-based test generators using proptest.
//!
//! Provides strategies for generating configurations and workloads that the
//! engine must handle without breaking its invariants.

use orecstm_core::{BackoffPolicy, IsolationLevel, LockLevel, LockMode, TransactionConfig};
use proptest::prelude::*;
use std::time::Duration;

/// A single transfer between two accounts of a [`Bank`](crate::Bank).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Account debited.
    pub from: usize,
    /// Account credited.
    pub to: usize,
    /// Amount moved.
    pub amount: i64,
}

/// An operation applied directly to an orec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrecOp {
    /// Arrive without a lock.
    Arrive,
    /// Depart one earlier arrival after reading.
    DepartAfterReading,
    /// Depart one earlier arrival after a failure.
    DepartAfterFailure,
}

/// Strategy for generating lock levels.
pub fn lock_level_strategy() -> impl Strategy<Value = LockLevel> {
    prop_oneof![
        Just(LockLevel::Default),
        Just(LockLevel::EnsureReads),
        Just(LockLevel::EnsureWrites),
        Just(LockLevel::PrivatizeReads),
        Just(LockLevel::PrivatizeWrites),
    ]
}

/// Strategy for generating isolation levels that keep reads consistent.
pub fn consistent_isolation_strategy() -> impl Strategy<Value = IsolationLevel> {
    prop_oneof![
        Just(IsolationLevel::Snapshot),
        Just(IsolationLevel::RepeatableRead),
        Just(IsolationLevel::Serializable),
    ]
}

/// Strategy for generating any isolation level.
pub fn isolation_level_strategy() -> impl Strategy<Value = IsolationLevel> {
    prop_oneof![
        Just(IsolationLevel::ReadCommitted),
        consistent_isolation_strategy(),
    ]
}

/// Strategy for generating valid updating transaction configurations.
pub fn transaction_config_strategy() -> impl Strategy<Value = TransactionConfig> {
    (
        lock_level_strategy(),
        isolation_level_strategy(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        2usize..32,
        1u32..64,
    )
        .prop_map(
            |(lock_level, isolation_level, dirty_check, track_reads, speculative, capacity, spin)| {
                // Untracked reads cannot be locked, validated for write skew or waited on.
                let track_reads = track_reads
                    || lock_level.read_lock_mode() != LockMode::None
                    || !isolation_level.allows_write_skew();
                TransactionConfig::new()
                    .lock_level(lock_level)
                    .isolation_level(isolation_level)
                    .dirty_check(dirty_check)
                    .track_reads(track_reads)
                    .blocking_allowed(track_reads)
                    .speculative_config_enabled(speculative)
                    .max_fixed_capacity(capacity)
                    .spin_count(spin)
                    .backoff(BackoffPolicy::Exponential {
                        min_delay: Duration::from_nanos(100),
                        max_delay: Duration::from_micros(100),
                    })
            },
        )
}

/// Strategy for generating a transfer between `accounts` accounts.
pub fn transfer_strategy(accounts: usize) -> impl Strategy<Value = Transfer> {
    (0..accounts, 0..accounts, 1i64..100).prop_map(|(from, to, amount)| Transfer { from, to, amount })
}

/// Strategy for generating up to `max_len` transfers between `accounts` accounts.
pub fn transfers_strategy(accounts: usize, max_len: usize) -> impl Strategy<Value = Vec<Transfer>> {
    prop::collection::vec(transfer_strategy(accounts), 1..=max_len)
}

/// Strategy for generating orec operation sequences.
pub fn orec_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<OrecOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(OrecOp::Arrive),
            2 => Just(OrecOp::DepartAfterReading),
            1 => Just(OrecOp::DepartAfterFailure),
        ],
        0..=max_len,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_configs_are_valid() {
        let mut runner = TestRunner::default();
        runner
            .run(&transaction_config_strategy(), |config| {
                prop_assert!(config.validate().is_ok());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn transfers_stay_in_range() {
        let mut runner = TestRunner::default();
        runner
            .run(&transfers_strategy(5, 10), |transfers| {
                prop_assert!(!transfers.is_empty());
                for transfer in transfers {
                    prop_assert!(transfer.from < 5 && transfer.to < 5);
                    prop_assert!(transfer.amount > 0);
                }
                Ok(())
            })
            .unwrap();
    }
}
