//! Opening references inside a transaction.

use super::Transaction;
use crate::error::{FunctionError, StmError, StmResult};
use crate::object::{RefInner, TxnObject};
use crate::tranlocal::{unbox, BoxedValue, CommuteFn, Tranlocal, TranlocalMode};
use crate::txn_ref::{TxnRef, Value};
use crate::types::{LockMode, RefId};
use std::sync::Arc;

impl Transaction {
    /// Opens `reference` for reading and acquires at least `lock_mode` on it.
    ///
    /// The effective lock is the stronger of `lock_mode` and the read lock of the
    /// configured lock level. Reopening returns the existing tranlocal, upgrading its
    /// lock if needed; a pending commute is applied first.
    pub fn open_for_read<T: Value>(
        &mut self,
        reference: &TxnRef<T>,
        lock_mode: LockMode,
    ) -> StmResult<&mut Tranlocal> {
        self.check_active("open_for_read")?;
        let inner = reference.inner();
        self.check_owner(inner.header())?;

        let desired = lock_mode.max(self.config.read_lock_mode());
        let id = inner.header().id();
        if self.tranlocals.contains(id) {
            self.reopen(id, desired)?;
        } else {
            self.attach(inner, desired)?;
        }
        Ok(self.tranlocal_mut(id))
    }

    /// Opens `reference` for writing and acquires at least `lock_mode` on it.
    ///
    /// The first write remembers the old value so that, with dirty checking enabled,
    /// writing back an equal value publishes nothing.
    pub fn open_for_write<T: Value>(
        &mut self,
        reference: &TxnRef<T>,
        lock_mode: LockMode,
    ) -> StmResult<&mut Tranlocal> {
        self.check_active("open_for_write")?;
        self.check_writable("open_for_write")?;
        let inner = reference.inner();
        self.check_owner(inner.header())?;

        let desired = lock_mode
            .max(self.config.read_lock_mode())
            .max(self.config.write_lock_mode());
        let id = inner.header().id();
        if self.tranlocals.contains(id) {
            self.reopen(id, desired)?;
        } else {
            self.attach(inner, desired)?;
        }

        self.has_writes = true;
        let dirty_check = self.config.dirty_check;
        let tranlocal = self.tranlocal_mut(id);
        tranlocal.upgrade_to_write(dirty_check);
        Ok(tranlocal)
    }

    /// Opens a reference this transaction created, with its initial value.
    ///
    /// The reference must still be at version 0. Opening it again returns the
    /// existing tranlocal and replaces the value.
    pub fn open_for_construction<T: Value>(
        &mut self,
        reference: &TxnRef<T>,
        initial: T,
    ) -> StmResult<&mut Tranlocal> {
        self.check_active("open_for_construction")?;
        self.check_writable("open_for_construction")?;
        let inner = reference.inner();
        self.check_owner(inner.header())?;
        if !self.fat {
            return Err(self.abort_requiring_fat());
        }

        let id = inner.header().id();
        if let Some(existing) = self.tranlocals.get(id) {
            if existing.mode() != TranlocalMode::Construction {
                return Err(self.abort_with(StmError::IllegalConstruction {
                    reference: id,
                    reason: "already opened as a committed reference",
                }));
            }
            let tranlocal = self.tranlocal_mut(id);
            tranlocal.replace_value(initial);
            return Ok(tranlocal);
        }

        if inner.header().version() != 0 || !inner.header().orec.state().has_exclusive_lock() {
            return Err(self.abort_with(StmError::IllegalConstruction {
                reference: id,
                reason: "already committed",
            }));
        }
        if self.tranlocals.is_full() {
            return Err(self.abort_on_capacity());
        }

        let owner: Arc<dyn TxnObject> = Arc::clone(inner) as Arc<dyn TxnObject>;
        self.tranlocals
            .insert(Tranlocal::for_construction(owner, Box::new(initial)));
        self.has_writes = true;
        Ok(self.tranlocal_mut(id))
    }

    /// Records `function` to be applied to the value of `reference` at commit.
    ///
    /// Commuting does not read the reference, so concurrent commutes of the same
    /// reference do not conflict. If the reference was already opened the function
    /// is applied right away instead.
    pub fn commute<T, F>(&mut self, reference: &TxnRef<T>, function: F) -> StmResult<()>
    where
        T: Value,
        F: Fn(T) -> T + Send + 'static,
    {
        let function: CommuteFn = Box::new(move |value: BoxedValue| -> Result<BoxedValue, FunctionError> {
            Ok(Box::new(function(unbox::<T>(value))) as BoxedValue)
        });
        self.commute_boxed(reference, function)
    }

    pub(crate) fn commute_boxed<T: Value>(
        &mut self,
        reference: &TxnRef<T>,
        function: CommuteFn,
    ) -> StmResult<()> {
        self.check_active("commute")?;
        self.check_writable("commute")?;
        let inner = reference.inner();
        self.check_owner(inner.header())?;
        if !self.fat {
            return Err(self.abort_requiring_fat());
        }

        let id = inner.header().id();
        let dirty_check = self.config.dirty_check;
        self.has_writes = true;

        if let Some(tranlocal) = self.tranlocals.get_mut(id) {
            if tranlocal.mode == TranlocalMode::Commute {
                tranlocal.commuting.push(function);
                return Ok(());
            }
            tranlocal.upgrade_to_write(dirty_check);
            let applied = match tranlocal.value.take() {
                Some(value) => function(value),
                None => unreachable!("opened tranlocal of {id} has no value"),
            };
            return match applied {
                Ok(value) => {
                    tranlocal.value = Some(value);
                    tranlocal.is_dirty = true;
                    Ok(())
                }
                Err(source) => Err(self.abort_with(StmError::function(source))),
            };
        }

        if self.tranlocals.is_full() {
            return Err(self.abort_on_capacity());
        }
        let owner: Arc<dyn TxnObject> = Arc::clone(inner) as Arc<dyn TxnObject>;
        let mut tranlocal = Tranlocal::new(owner, TranlocalMode::Commute, false);
        tranlocal.commuting.push(function);
        tranlocal.is_dirty = !dirty_check;
        self.tranlocals.insert(tranlocal);
        Ok(())
    }

    /// Reads the value of `reference`.
    ///
    /// With read tracking disabled, a read-biased reference that is not opened yet
    /// is read without keeping a tranlocal for it.
    pub(crate) fn read<T: Value>(&mut self, reference: &TxnRef<T>) -> StmResult<T> {
        self.check_active("read")?;
        let inner = reference.inner();
        self.check_owner(inner.header())?;

        let untracked = !self.config.track_reads
            && self.config.read_lock_mode() == LockMode::None
            && !self.tranlocals.contains(inner.header().id())
            && inner.header().orec.state().is_read_biased();
        if untracked {
            return self.read_untracked(inner);
        }
        let tranlocal = self.open_for_read(reference, LockMode::None)?;
        Ok(tranlocal.typed_value::<T>().clone())
    }

    fn read_untracked<T: Value>(&mut self, inner: &Arc<RefInner<T>>) -> StmResult<T> {
        let id = inner.header().id();
        self.begin_reading();

        let owner: Arc<dyn TxnObject> = Arc::clone(inner) as Arc<dyn TxnObject>;
        let mut tranlocal = Tranlocal::new(owner, TranlocalMode::Read, false);
        if !tranlocal.load(self.config.spin_count, LockMode::None) {
            return Err(self.abort_on_conflict(id));
        }

        if tranlocal.has_depart_obligation() {
            // The reference stopped being read-biased in the meantime, so the
            // arrival must be departed at the end like any other read.
            if self.tranlocals.is_full() {
                tranlocal.release_after_failure();
                return Err(self.abort_on_capacity());
            }
            let value = tranlocal.typed_value::<T>().clone();
            self.tranlocals.insert(tranlocal);
            if !self.is_read_consistent(id) {
                return Err(self.abort_on_conflict(id));
            }
            return Ok(value);
        }

        self.has_untracked_reads = true;
        let value = tranlocal.typed_value::<T>().clone();
        if !self.is_read_consistent(id) {
            return Err(self.abort_on_conflict(id));
        }
        Ok(value)
    }

    /// Loads a reference not yet in the transaction and adds it.
    fn attach<T: Value>(&mut self, inner: &Arc<RefInner<T>>, desired: LockMode) -> StmResult<()> {
        let id = inner.header().id();
        if self.tranlocals.is_full() {
            return Err(self.abort_on_capacity());
        }
        self.begin_reading();

        let owner: Arc<dyn TxnObject> = Arc::clone(inner) as Arc<dyn TxnObject>;
        let write_skew_check = !self.config.isolation_level.allows_write_skew();
        let mut tranlocal = Tranlocal::new(owner, TranlocalMode::Read, write_skew_check);
        if !tranlocal.load(self.config.spin_count, desired) {
            return Err(self.abort_on_conflict(id));
        }
        self.tranlocals.insert(tranlocal);

        if !self.is_read_consistent(id) {
            return Err(self.abort_on_conflict(id));
        }
        Ok(())
    }

    /// Upgrades the lock of an already opened reference, applying pending commutes.
    fn reopen(&mut self, id: RefId, desired: LockMode) -> StmResult<()> {
        let spin = self.config.spin_count;
        let mode = self.tranlocal_mut(id).mode;
        if mode == TranlocalMode::Commute {
            return self.flatten_commute(id, desired);
        }
        if !self.tranlocal_mut(id).try_lock_and_check_conflict(spin, desired) {
            return Err(self.abort_on_conflict(id));
        }
        Ok(())
    }

    /// Loads the committed value of a commuting tranlocal and applies the recorded
    /// functions to it, turning it into a write.
    pub(super) fn flatten_commute(&mut self, id: RefId, desired: LockMode) -> StmResult<()> {
        let spin = self.config.spin_count;
        self.begin_reading();
        if !self.tranlocal_mut(id).load(spin, desired) {
            return Err(self.abort_on_conflict(id));
        }
        if !self.is_read_consistent(id) {
            return Err(self.abort_on_conflict(id));
        }

        let tranlocal = self.tranlocal_mut(id);
        tranlocal.mode = TranlocalMode::Write;
        let old_value = tranlocal
            .value
            .as_ref()
            .map(|value| tranlocal.owner.clone_value(value));
        tranlocal.old_value = old_value;
        let functions = std::mem::take(&mut tranlocal.commuting);
        let mut value = match tranlocal.value.take() {
            Some(value) => value,
            None => unreachable!("loaded tranlocal of {id} has no value"),
        };
        for function in &functions {
            match function(value) {
                Ok(next) => value = next,
                Err(source) => return Err(self.abort_with(StmError::function(source))),
            }
        }
        self.tranlocal_mut(id).value = Some(value);
        Ok(())
    }

    /// Snapshots the global conflict counter before the first read.
    fn begin_reading(&mut self) {
        if !self.has_reads {
            self.local_conflicts.reset(self.stm.conflicts());
            self.has_reads = true;
        }
    }

    /// Returns true if every read so far still matches the committed state.
    ///
    /// The full scan only runs when the global conflict counter moved since the last
    /// check. `just_added` was loaded after the counter was read and is skipped.
    pub(super) fn is_read_consistent(&mut self, just_added: RefId) -> bool {
        if self.config.isolation_level.allows_inconsistent_reads() {
            return true;
        }
        if self.config.read_lock_mode() != LockMode::None {
            // Every read holds a lock, so nothing can change underneath.
            return true;
        }
        if !self
            .local_conflicts
            .sync_and_check_conflict(self.stm.conflicts())
        {
            return true;
        }
        if self.has_untracked_reads {
            return false;
        }
        self.tranlocals
            .iter()
            .all(|tranlocal| tranlocal.reference() == just_added || !tranlocal.has_read_conflict())
    }
}
