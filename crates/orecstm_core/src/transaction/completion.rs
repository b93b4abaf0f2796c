//! Prepare, commit, abort and blocking retry.

use super::{Transaction, TransactionEvent, TransactionStatus};
use crate::error::{StmError, StmResult};
use crate::listeners::Registration;
use crate::tranlocal::TranlocalMode;
use crate::types::{LockMode, RefId};
use tracing::trace;

impl Transaction {
    /// Acquires the commit locks and validates the reads.
    ///
    /// Commuting functions are applied first. Dirty writes are exclusively locked;
    /// under serializable isolation every read is read-locked as well. Preparing a
    /// prepared transaction does nothing.
    pub fn prepare(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => {}
            TransactionStatus::Prepared => return Ok(()),
            status => return Err(StmError::dead_transaction(self.id, "prepare", status)),
        }
        if self.abort_only {
            return Err(self.abort_with(StmError::AbortOnly {
                transaction: self.id,
            }));
        }

        self.notify(TransactionEvent::PrePrepare);
        if self.has_writes {
            self.acquire_commit_locks()?;
        }
        self.status = TransactionStatus::Prepared;
        Ok(())
    }

    fn acquire_commit_locks(&mut self) -> StmResult<()> {
        let commuting: Vec<RefId> = self
            .tranlocals
            .iter()
            .filter(|tranlocal| tranlocal.mode == TranlocalMode::Commute)
            .map(|tranlocal| tranlocal.reference())
            .collect();
        for id in commuting {
            self.flatten_commute(id, LockMode::Exclusive)?;
        }

        let spin = self.config.spin_count;
        let dirty_check = self.config.dirty_check;
        let mut conflict = None;
        for tranlocal in self.tranlocals.iter_mut() {
            if !tranlocal.prepare(spin, dirty_check) {
                conflict = Some(tranlocal.reference());
                break;
            }
        }
        match conflict {
            Some(id) => Err(self.abort_on_conflict(id)),
            None => Ok(()),
        }
    }

    /// Commits the transaction, publishing every dirty write.
    ///
    /// An active transaction is prepared first. Committing a committed transaction
    /// does nothing. Waiting retry latches are opened after every lock is released.
    pub fn commit(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Committed => return Ok(()),
            TransactionStatus::Aborted => {
                return Err(StmError::dead_transaction(
                    self.id,
                    "commit",
                    TransactionStatus::Aborted,
                ))
            }
            TransactionStatus::Active => self.prepare()?,
            TransactionStatus::Prepared => {}
        }

        let mut listeners = Vec::new();
        if self.has_writes {
            let conflicts = self.stm.conflicts();
            for tranlocal in self.tranlocals.iter_mut() {
                let chain = tranlocal.commit(conflicts);
                if !chain.is_empty() {
                    listeners.push(chain);
                }
            }
        } else {
            for tranlocal in self.tranlocals.iter_mut() {
                tranlocal.release_after_reading();
            }
        }
        self.tranlocals.clear();
        self.status = TransactionStatus::Committed;
        trace!(
            transaction = %self.id,
            family = %self.config.family_name,
            writes = self.has_writes,
            "committed"
        );

        for chain in listeners {
            chain.open_all();
        }
        self.notify(TransactionEvent::PostCommit);
        Ok(())
    }

    /// Aborts the transaction, releasing every lock and arrival.
    ///
    /// Aborting an aborted transaction does nothing; aborting a committed one fails.
    pub fn abort(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Committed => Err(StmError::dead_transaction(
                self.id,
                "abort",
                TransactionStatus::Committed,
            )),
            _ => {
                self.abort_internal();
                Ok(())
            }
        }
    }

    pub(crate) fn abort_internal(&mut self) {
        if !self.status.is_alive() {
            return;
        }
        for tranlocal in self.tranlocals.iter_mut() {
            tranlocal.release_after_failure();
        }
        self.tranlocals.clear();
        self.status = TransactionStatus::Aborted;
        self.notify(TransactionEvent::PostAbort);
    }

    /// Aborts the transaction and arms its retry latch on every reference read.
    ///
    /// Always returns an error: [`StmError::Retry`] when the latch was registered,
    /// which tells the executor to wait in [`await_update`](Self::await_update) and
    /// run again.
    pub fn retry<R>(&mut self) -> StmResult<R> {
        self.check_active("retry")?;
        if !self.config.blocking_allowed {
            return Err(self.abort_with(StmError::RetryNotAllowed {
                transaction: self.id,
            }));
        }
        if self.tranlocals.is_empty() {
            return Err(self.abort_with(StmError::RetryNotPossible {
                transaction: self.id,
            }));
        }

        let era = self.retry_latch.reset();
        self.retry_era = era;
        let mut registered = false;
        let mut register = true;
        for tranlocal in self.tranlocals.iter_mut() {
            if register {
                match tranlocal
                    .owner
                    .header()
                    .register_change_listener(&self.retry_latch, tranlocal, era)
                {
                    Registration::Done => registered = true,
                    Registration::NotNeeded => {
                        registered = true;
                        register = false;
                    }
                    Registration::None => {}
                }
            }
            tranlocal.release_after_failure();
        }
        self.tranlocals.clear();
        self.status = TransactionStatus::Aborted;
        self.notify(TransactionEvent::PostAbort);

        if registered {
            Err(StmError::Retry {
                transaction: self.id,
            })
        } else {
            Err(StmError::RetryNotPossible {
                transaction: self.id,
            })
        }
    }

    /// Blocks until a reference registered by the last [`retry`](Self::retry)
    /// changes, charging the wait to the remaining timeout budget.
    pub fn await_update(&mut self) -> StmResult<()> {
        let era = self.retry_era;
        match self.remaining_timeout {
            None => {
                self.retry_latch.await_open(era);
                Ok(())
            }
            Some(budget) => match self.retry_latch.await_open_for(era, budget) {
                Some(left) => {
                    self.remaining_timeout = Some(left);
                    Ok(())
                }
                None => {
                    // Strands the registrations so the next writer or waiter drops them.
                    self.retry_era = self.retry_latch.reset();
                    self.remaining_timeout = Some(std::time::Duration::ZERO);
                    Err(StmError::RetryTimeout {
                        transaction: self.id,
                    })
                }
            },
        }
    }
}
