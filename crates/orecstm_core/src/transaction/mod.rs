//! Transactions.
//!
//! A [`Transaction`] collects one [`Tranlocal`] per reference it touches. Reads are
//! validated incrementally as references are opened; writes are buffered in the
//! tranlocals and published at commit under exclusive orec locks.
//!
//! Every operation that fails on an active transaction aborts it before the error
//! is returned, so nothing is left locked behind a failed call.

mod completion;
mod listener;
mod open;
mod state;
mod storage;

pub use listener::{ListenerList, TransactionEvent, TransactionListener};
pub use state::TransactionStatus;
pub use storage::StorageKind;

use crate::config::TransactionConfig;
use crate::conflict::LocalConflictCounter;
use crate::error::{FunctionError, StmError, StmResult};
use crate::latch::RetryLatch;
use crate::object::RefHeader;
use crate::speculative::SpeculativeConfig;
use crate::stm::StmShared;
use crate::tranlocal::Tranlocal;
use crate::txn_ref::{TxnRef, Value};
use crate::types::{RefId, TransactionId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use storage::{new_storage, TranlocalStorage};
use tracing::trace;

/// A transaction over transactional references.
pub struct Transaction {
    id: TransactionId,
    stm: Arc<StmShared>,
    config: Arc<TransactionConfig>,
    speculative: Option<Arc<SpeculativeConfig>>,
    status: TransactionStatus,
    tranlocals: Box<dyn TranlocalStorage>,
    fat: bool,
    attempt: u32,
    remaining_timeout: Option<Duration>,
    has_writes: bool,
    has_reads: bool,
    has_untracked_reads: bool,
    abort_only: bool,
    local_conflicts: LocalConflictCounter,
    retry_latch: Arc<RetryLatch>,
    retry_era: u64,
    listeners: Vec<Arc<dyn TransactionListener>>,
}

impl Transaction {
    /// Creates a transaction.
    ///
    /// A lean transaction (`fat == false`) supports neither commutes, constructions
    /// nor one-shot listeners; hitting one of those reports a speculative failure so
    /// the executor can retry with a fat transaction.
    pub(crate) fn new(
        stm: Arc<StmShared>,
        config: Arc<TransactionConfig>,
        kind: StorageKind,
        fat: bool,
        speculative: Option<Arc<SpeculativeConfig>>,
    ) -> Self {
        let tranlocals = new_storage(kind, config.max_fixed_capacity);
        let local_conflicts = LocalConflictCounter::new(stm.conflicts());
        let retry_latch = Arc::new(RetryLatch::new());
        let retry_era = retry_latch.era();
        Self {
            id: stm.next_transaction_id(),
            remaining_timeout: config.timeout,
            stm,
            config,
            speculative,
            status: TransactionStatus::Active,
            tranlocals,
            fat,
            attempt: 1,
            has_writes: false,
            has_reads: false,
            has_untracked_reads: false,
            abort_only: false,
            local_conflicts,
            retry_latch,
            retry_era,
            listeners: Vec::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Returns the attempt number, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the timeout budget left for blocking retries.
    #[must_use]
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.remaining_timeout
    }

    /// Returns the tranlocal storage layout.
    #[must_use]
    pub fn storage_kind(&self) -> StorageKind {
        self.tranlocals.kind()
    }

    /// Returns true if the transaction supports commutes, constructions and
    /// listeners.
    #[must_use]
    pub fn is_fat(&self) -> bool {
        self.fat
    }

    /// Returns the number of references opened.
    #[must_use]
    pub fn tranlocal_count(&self) -> usize {
        self.tranlocals.len()
    }

    /// Returns true if anything was opened for writing, commuted or constructed.
    #[must_use]
    pub fn has_writes(&self) -> bool {
        self.has_writes
    }

    /// Returns true if the transaction will abort instead of committing.
    #[must_use]
    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    /// Returns the tranlocal of `reference`, if it was opened in this transaction.
    #[must_use]
    pub fn locate<T: Value>(&self, reference: &TxnRef<T>) -> Option<&Tranlocal> {
        self.tranlocals.get(reference.id())
    }

    /// Makes the transaction abort instead of commit. Operations keep working.
    pub fn set_abort_only(&mut self) -> StmResult<()> {
        self.check_active("set_abort_only")?;
        self.abort_only = true;
        Ok(())
    }

    /// Registers a listener notified at the lifecycle points of this attempt.
    pub fn register_listener(&mut self, listener: Arc<dyn TransactionListener>) -> StmResult<()> {
        self.check_active("register_listener")?;
        if !self.fat {
            return Err(self.abort_requiring_fat());
        }
        self.listeners.push(listener);
        Ok(())
    }

    /// Prepares the transaction for another attempt.
    ///
    /// Aborts it if still alive. Returns false when the attempt limit is reached.
    pub fn soft_reset(&mut self) -> bool {
        if self.attempt >= self.config.max_retries {
            return false;
        }
        self.abort_internal();
        self.attempt += 1;
        self.reset_state();
        true
    }

    /// Resets the transaction to its initial state, including the attempt counter
    /// and the timeout budget.
    pub fn hard_reset(&mut self) {
        self.abort_internal();
        self.attempt = 1;
        self.remaining_timeout = self.config.timeout;
        self.reset_state();
    }

    fn reset_state(&mut self) {
        self.status = TransactionStatus::Active;
        self.tranlocals.clear();
        self.has_writes = false;
        self.has_reads = false;
        self.has_untracked_reads = false;
        self.abort_only = false;
        self.listeners.clear();
        self.local_conflicts.reset(self.stm.conflicts());
    }

    /// Continues the attempt count and timeout budget of a transaction this one
    /// replaces.
    pub(crate) fn inherit_progress(&mut self, previous: &Transaction) {
        self.attempt = previous.attempt;
        self.remaining_timeout = previous.remaining_timeout;
    }

    /// Fails unless the transaction is active. A prepared transaction is aborted.
    fn check_active(&mut self, operation: &'static str) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Prepared => {
                self.abort_internal();
                Err(StmError::PreparedTransaction {
                    transaction: self.id,
                    operation,
                })
            }
            status => Err(StmError::dead_transaction(self.id, operation, status)),
        }
    }

    fn check_writable(&mut self, operation: &'static str) -> StmResult<()> {
        if self.config.readonly {
            self.abort_internal();
            return Err(StmError::Readonly {
                transaction: self.id,
                operation,
            });
        }
        Ok(())
    }

    fn check_owner(&mut self, header: &RefHeader) -> StmResult<()> {
        if Arc::ptr_eq(header.stm(), &self.stm) {
            return Ok(());
        }
        self.abort_internal();
        Err(StmError::ForeignReference {
            transaction: self.id,
            reference: header.id(),
        })
    }

    fn abort_on_conflict(&mut self, reference: RefId) -> StmError {
        trace!(transaction = %self.id, %reference, attempt = self.attempt, "read/write conflict");
        self.abort_internal();
        StmError::read_write_conflict(self.id, reference)
    }

    fn abort_on_capacity(&mut self) -> StmError {
        let required_capacity = self.tranlocals.len() + 1;
        if let Some(speculative) = &self.speculative {
            speculative.require_capacity(required_capacity);
        }
        self.abort_internal();
        StmError::SpeculativeConfiguration {
            transaction: self.id,
            required_capacity,
            requires_fat: false,
        }
    }

    fn abort_requiring_fat(&mut self) -> StmError {
        if let Some(speculative) = &self.speculative {
            speculative.require_fat();
        }
        let required_capacity = self.tranlocals.len().max(1);
        self.abort_internal();
        StmError::SpeculativeConfiguration {
            transaction: self.id,
            required_capacity,
            requires_fat: true,
        }
    }

    fn abort_with(&mut self, error: StmError) -> StmError {
        self.abort_internal();
        error
    }

    /// Aborts because a caller-supplied function failed.
    pub(crate) fn fail_with_function_error(&mut self, source: FunctionError) -> StmError {
        self.abort_with(StmError::function(source))
    }

    fn tranlocal_mut(&mut self, id: RefId) -> &mut Tranlocal {
        match self.tranlocals.get_mut(id) {
            Some(tranlocal) => tranlocal,
            None => unreachable!("tranlocal of {id} vanished from transaction"),
        }
    }

    fn notify(&mut self, event: TransactionEvent) {
        let config = Arc::clone(&self.config);
        for listener in config.permanent_listeners.iter() {
            listener.notify(self, event);
        }
        let listeners = std::mem::take(&mut self.listeners);
        for listener in &listeners {
            listener.notify(self, event);
        }
        self.listeners = listeners;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort_internal();
        self.retry_latch.reset();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("family", &self.config.family_name)
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("storage", &self.tranlocals.kind())
            .field("fat", &self.fat)
            .field("tranlocals", &self.tranlocals.len())
            .finish_non_exhaustive()
    }
}
