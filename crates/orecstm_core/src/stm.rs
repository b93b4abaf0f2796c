//! The STM instance.

use crate::config::{StmConfig, TransactionConfig};
use crate::conflict::GlobalConflictCounter;
use crate::error::StmResult;
use crate::executor::TransactionExecutor;
use crate::transaction::{StorageKind, Transaction};
use crate::txn_ref::{TxnRef, Value};
use crate::types::{RefId, TransactionId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// State shared by every reference and transaction of one STM instance.
pub(crate) struct StmShared {
    conflicts: GlobalConflictCounter,
    next_transaction: AtomicU64,
    next_reference: AtomicU64,
    config: StmConfig,
}

impl StmShared {
    pub(crate) fn new(config: StmConfig) -> Self {
        Self {
            conflicts: GlobalConflictCounter::new(),
            next_transaction: AtomicU64::new(1),
            next_reference: AtomicU64::new(1),
            config,
        }
    }

    pub(crate) fn conflicts(&self) -> &GlobalConflictCounter {
        &self.conflicts
    }

    pub(crate) fn config(&self) -> &StmConfig {
        &self.config
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.next_transaction.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_reference_id(&self) -> RefId {
        RefId::new(self.next_reference.fetch_add(1, Ordering::Relaxed))
    }
}

/// A software transactional memory instance.
///
/// References created by one instance can only be used by transactions of the same
/// instance. Cloning is cheap and shares the instance.
///
/// # Example
///
/// ```
/// use orecstm_core::Stm;
///
/// let stm = Stm::new();
/// let from = stm.new_ref(100_i64);
/// let to = stm.new_ref(0_i64);
///
/// stm.atomic(|tx| {
///     from.alter(tx, |balance| balance - 30)?;
///     to.alter(tx, |balance| balance + 30)?;
///     Ok(())
/// })
/// .unwrap();
///
/// assert_eq!(from.atomic_get().unwrap(), 70);
/// assert_eq!(to.atomic_get().unwrap(), 30);
/// ```
#[derive(Clone)]
pub struct Stm {
    shared: Arc<StmShared>,
    executor: Arc<TransactionExecutor>,
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm {
    /// Creates an instance with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(StmShared::new(StmConfig::default()));
        let executor = Arc::new(TransactionExecutor::new(
            Arc::clone(&shared),
            TransactionConfig::default(),
        ));
        Self { shared, executor }
    }

    /// Creates an instance with `config`.
    pub fn with_config(config: StmConfig) -> StmResult<Self> {
        config.validate()?;
        debug!(
            read_biased_threshold = config.read_biased_threshold,
            family = %config.transaction.family_name,
            "creating stm"
        );
        let transaction = config.transaction.clone();
        let shared = Arc::new(StmShared::new(config));
        let executor = Arc::new(TransactionExecutor::new(Arc::clone(&shared), transaction));
        Ok(Self { shared, executor })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StmConfig {
        self.shared.config()
    }

    /// Creates a committed reference holding `value`.
    pub fn new_ref<T: Value>(&self, value: T) -> TxnRef<T> {
        TxnRef::committed(Arc::clone(&self.shared), value)
    }

    /// Creates a reference inside `tx`.
    ///
    /// The reference stays exclusively locked at version 0 until `tx` commits, so
    /// no other transaction can observe it before then. If `tx` aborts, the
    /// reference is never published.
    pub fn new_ref_in<T: Value>(&self, tx: &mut Transaction, value: T) -> StmResult<TxnRef<T>> {
        let reference = TxnRef::constructing(Arc::clone(&self.shared));
        tx.open_for_construction(&reference, value)?;
        Ok(reference)
    }

    /// Creates a stand-alone transaction with the default transaction
    /// configuration.
    ///
    /// Stand-alone transactions are fat and unbounded; nothing re-runs them on a
    /// conflict.
    pub fn new_transaction(&self) -> Transaction {
        Transaction::new(
            Arc::clone(&self.shared),
            Arc::clone(self.executor.shared_config()),
            StorageKind::Map,
            true,
            None,
        )
    }

    /// Creates a stand-alone transaction with `config`.
    pub fn new_transaction_with(&self, config: TransactionConfig) -> StmResult<Transaction> {
        config.validate()?;
        Ok(Transaction::new(
            Arc::clone(&self.shared),
            Arc::new(config),
            StorageKind::Map,
            true,
            None,
        ))
    }

    /// Creates an executor that runs transactions with `config`.
    pub fn executor(&self, config: TransactionConfig) -> StmResult<TransactionExecutor> {
        config.validate()?;
        Ok(TransactionExecutor::new(Arc::clone(&self.shared), config))
    }

    /// Runs `body` in a transaction with the default configuration, re-running it
    /// on conflicts and blocking retries.
    pub fn atomic<R, F>(&self, body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        self.executor.execute(body)
    }

    /// Returns the number of conflicts signalled so far.
    #[must_use]
    pub fn global_conflict_count(&self) -> u64 {
        self.shared.conflicts().count()
    }
}

impl fmt::Debug for Stm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm")
            .field("conflicts", &self.shared.conflicts().count())
            .field("config", self.shared.config())
            .finish()
    }
}
