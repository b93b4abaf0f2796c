//! Running transaction bodies to completion.

use crate::config::TransactionConfig;
use crate::error::{StmError, StmResult};
use crate::speculative::SpeculativeConfig;
use crate::stm::StmShared;
use crate::transaction::{StorageKind, Transaction};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Runs transaction bodies, re-running them until they commit.
///
/// Conflicts back off and re-run, blocking retries wait for a change, and
/// speculative failures re-run with a bigger transaction. Every executor learns its
/// own transaction size, so one executor per kind of transaction works best.
pub struct TransactionExecutor {
    stm: Arc<StmShared>,
    config: Arc<TransactionConfig>,
    speculative: Arc<SpeculativeConfig>,
}

impl TransactionExecutor {
    pub(crate) fn new(stm: Arc<StmShared>, config: TransactionConfig) -> Self {
        Self {
            stm,
            config: Arc::new(config),
            speculative: Arc::new(SpeculativeConfig::new()),
        }
    }

    /// Returns the transaction configuration.
    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> &Arc<TransactionConfig> {
        &self.config
    }

    /// Returns what the executor learned about its transactions.
    #[must_use]
    pub fn speculative(&self) -> &SpeculativeConfig {
        &self.speculative
    }

    /// Creates a transaction sized by what the executor learned so far.
    ///
    /// With speculative configuration disabled every transaction is fat and
    /// unbounded.
    pub fn new_transaction(&self) -> Transaction {
        if !self.config.speculative_config_enabled {
            return Transaction::new(
                Arc::clone(&self.stm),
                Arc::clone(&self.config),
                StorageKind::Map,
                true,
                None,
            );
        }

        let kind = self.speculative.storage_kind(self.config.max_fixed_capacity);
        let fat = self.speculative.is_fat() || !self.config.permanent_listeners.is_empty();
        Transaction::new(
            Arc::clone(&self.stm),
            Arc::clone(&self.config),
            kind,
            fat,
            Some(Arc::clone(&self.speculative)),
        )
    }

    /// Replaces `failed`, which outgrew its speculative configuration, with a
    /// transaction sized by the updated configuration.
    ///
    /// The attempt count and timeout budget carry over.
    pub fn upgrade_after_speculative_failure(&self, failed: &Transaction) -> Transaction {
        let mut upgraded = self.new_transaction();
        upgraded.inherit_progress(failed);
        debug!(
            family = %self.config.family_name,
            from = %failed.storage_kind(),
            to = %upgraded.storage_kind(),
            fat = upgraded.is_fat(),
            "upgrading transaction after speculative failure"
        );
        upgraded
    }

    /// Runs `body` until it commits.
    ///
    /// `body` may run many times and must not have side effects outside the
    /// transaction. Errors other than conflicts, retries and speculative failures
    /// are returned after the transaction is aborted.
    pub fn execute<R, F>(&self, mut body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        let mut tx = self.new_transaction();
        loop {
            let outcome = body(&mut tx).and_then(|value| tx.commit().map(|()| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(StmError::Retry { .. }) => {
                    trace!(transaction = %tx.id(), attempt = tx.attempt(), "waiting for a change");
                    tx.await_update()?;
                }
                Err(StmError::SpeculativeConfiguration { .. }) => {
                    tx = self.upgrade_after_speculative_failure(&tx);
                    continue;
                }
                Err(err) if err.is_conflict() => {
                    trace!(transaction = %tx.id(), attempt = tx.attempt(), "backing off after conflict");
                    self.config.backoff.backoff(tx.attempt());
                }
                Err(err) => {
                    tx.abort_internal();
                    return Err(err);
                }
            }

            if !tx.soft_reset() {
                debug!(
                    family = %self.config.family_name,
                    attempts = tx.attempt(),
                    "giving up"
                );
                tx.abort_internal();
                return Err(StmError::TooManyRetries {
                    family: self.config.family_name.clone(),
                    attempts: tx.attempt(),
                });
            }
        }
    }
}

impl fmt::Debug for TransactionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionExecutor")
            .field("family", &self.config.family_name)
            .field("speculative", &self.speculative)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stm;

    #[test]
    fn grows_from_mono_to_array() {
        let stm = Stm::new();
        let refs: Vec<_> = (0..3).map(|i| stm.new_ref(i)).collect();
        let executor = stm.executor(TransactionConfig::default()).unwrap();

        assert_eq!(executor.new_transaction().storage_kind(), StorageKind::Mono);
        let sum = executor
            .execute(|tx| {
                let mut sum = 0;
                for reference in &refs {
                    sum += reference.get(tx)?;
                }
                Ok(sum)
            })
            .unwrap();
        assert_eq!(sum, 3);
        assert_eq!(executor.speculative().min_capacity(), 2);
        assert_eq!(executor.new_transaction().storage_kind(), StorageKind::Array);
    }

    #[test]
    fn commute_makes_transactions_fat() {
        let stm = Stm::new();
        let counter = stm.new_ref(0_i64);
        let executor = stm.executor(TransactionConfig::default()).unwrap();
        assert!(!executor.new_transaction().is_fat());

        executor
            .execute(|tx| counter.commute(tx, |value| value + 1))
            .unwrap();
        assert!(executor.speculative().is_fat());
        assert_eq!(counter.atomic_get().unwrap(), 1);
    }

    #[test]
    fn disabled_speculation_uses_fat_map() {
        let stm = Stm::new();
        let executor = stm
            .executor(TransactionConfig::new().speculative_config_enabled(false))
            .unwrap();
        let tx = executor.new_transaction();
        assert!(tx.is_fat());
        assert_eq!(tx.storage_kind(), StorageKind::Map);
    }

    #[test]
    fn user_errors_abort_and_return() {
        let stm = Stm::new();
        let reference = stm.new_ref(1_i32);
        let result: StmResult<()> = stm.atomic(|tx| {
            reference.set(tx, 2)?;
            Err(StmError::function("nope"))
        });
        assert!(matches!(result, Err(StmError::Function { .. })));
        assert_eq!(reference.atomic_get().unwrap(), 1);
        assert!(!reference.orec().has_any_lock());
    }

    #[test]
    fn gives_up_after_max_retries() {
        let stm = Stm::new();
        let reference = stm.new_ref(0_i32);
        let executor = stm
            .executor(
                TransactionConfig::new()
                    .family_name("always-conflicts")
                    .max_retries(3),
            )
            .unwrap();
        let mut runs = 0;
        let result: StmResult<()> = executor.execute(|tx| {
            runs += 1;
            reference.get(tx)?;
            Err(StmError::read_write_conflict(tx.id(), reference.id()))
        });
        match result {
            Err(StmError::TooManyRetries { family, attempts }) => {
                assert_eq!(family, "always-conflicts");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(runs, 3);
        assert!(!reference.orec().has_any_lock());
        assert_eq!(reference.orec().surplus(), 0);
    }
}
