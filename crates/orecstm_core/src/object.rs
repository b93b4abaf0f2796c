//! Shared state of a transactional reference.
//!
//! Transactions work with references of many value types at once, so the parts
//! they need are reached through the object-safe [`TxnObject`] trait: the
//! [`RefHeader`] (identity, orec, version, listeners) plus type-erased access to the
//! committed value.

use crate::error::{StmError, StmResult};
use crate::latch::RetryLatch;
use crate::listeners::{ListenerChain, Listeners, Registration};
use crate::orec::{ArriveOutcome, Orec};
use crate::stm::StmShared;
use crate::tranlocal::{BoxedValue, Tranlocal, TranlocalMode};
use crate::txn_ref::Value;
use crate::types::{LockMode, RefId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Concurrency header of one reference.
pub(crate) struct RefHeader {
    id: RefId,
    stm: Arc<StmShared>,
    pub(crate) orec: Orec,
    version: AtomicU64,
    pub(crate) listeners: Listeners,
}

impl RefHeader {
    fn new(stm: Arc<StmShared>, orec: Orec, version: u64) -> Self {
        Self {
            id: stm.next_reference_id(),
            stm,
            orec,
            version: AtomicU64::new(version),
            listeners: Listeners::default(),
        }
    }

    pub(crate) fn id(&self) -> RefId {
        self.id
    }

    pub(crate) fn stm(&self) -> &Arc<StmShared> {
        &self.stm
    }

    /// Returns the version of the last committed value (0 while under construction).
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn publish_version(&self, version: u64) {
        self.version.store(version, Ordering::SeqCst);
    }

    /// Returns true if `tranlocal` can no longer be trusted: the version moved on,
    /// or another transaction holds a write or exclusive lock. A tranlocal holding a
    /// lock itself never conflicts.
    pub(crate) fn has_read_conflict(&self, tranlocal: &Tranlocal) -> bool {
        if tranlocal.lock_mode.is_locked() {
            return false;
        }
        if self.orec.state().has_write_or_exclusive_lock() {
            return true;
        }
        self.version() != tranlocal.version
    }

    /// Registers `latch` to be opened by the next write of this reference.
    pub(crate) fn register_change_listener(
        &self,
        latch: &Arc<RetryLatch>,
        tranlocal: &Tranlocal,
        era: u64,
    ) -> Registration {
        if matches!(
            tranlocal.mode,
            TranlocalMode::Commute | TranlocalMode::Construction
        ) {
            return Registration::None;
        }

        let expected = tranlocal.version;
        if self.version() != expected {
            latch.open(era);
            return Registration::NotNeeded;
        }

        if self
            .listeners
            .register_if(latch, era, || self.version() == expected)
        {
            Registration::Done
        } else {
            latch.open(era);
            Registration::NotNeeded
        }
    }
}

/// Object-safe access to a reference of any value type.
pub(crate) trait TxnObject: Send + Sync + 'static {
    /// Returns the concurrency header.
    fn header(&self) -> &RefHeader;

    /// Clones the committed value, `None` while under construction.
    fn read_value(&self) -> Option<BoxedValue>;

    /// Replaces the committed value. Only called under the exclusive lock.
    fn write_value(&self, value: BoxedValue);

    /// Clones a value of this reference's type.
    fn clone_value(&self, value: &BoxedValue) -> BoxedValue;

    /// Compares two values of this reference's type.
    fn values_equal(&self, left: &BoxedValue, right: &BoxedValue) -> bool;
}

/// Typed storage of one reference.
pub(crate) struct RefInner<T> {
    header: RefHeader,
    value: RwLock<Option<T>>,
}

fn downcast<'a, T: Value>(id: RefId, value: &'a BoxedValue) -> &'a T {
    match value.downcast_ref::<T>() {
        Some(value) => value,
        None => panic!(
            "{id} holds a value of another type than {}",
            std::any::type_name::<T>()
        ),
    }
}

impl<T: Value> TxnObject for RefInner<T> {
    fn header(&self) -> &RefHeader {
        &self.header
    }

    fn read_value(&self) -> Option<BoxedValue> {
        self.value
            .read()
            .clone()
            .map(|value| Box::new(value) as BoxedValue)
    }

    fn write_value(&self, value: BoxedValue) {
        match value.downcast::<T>() {
            Ok(value) => *self.value.write() = Some(*value),
            Err(_) => panic!(
                "{} received a value of another type than {}",
                self.header.id,
                std::any::type_name::<T>()
            ),
        }
    }

    fn clone_value(&self, value: &BoxedValue) -> BoxedValue {
        Box::new(downcast::<T>(self.header.id, value).clone())
    }

    fn values_equal(&self, left: &BoxedValue, right: &BoxedValue) -> bool {
        downcast::<T>(self.header.id, left) == downcast::<T>(self.header.id, right)
    }
}

impl<T: Value> RefInner<T> {
    /// Creates a committed reference at version 1.
    pub(crate) fn committed(stm: Arc<StmShared>, value: T) -> Self {
        let orec = Orec::new(stm.config().read_biased_threshold);
        Self {
            header: RefHeader::new(stm, orec, 1),
            value: RwLock::new(Some(value)),
        }
    }

    /// Creates a reference at version 0, exclusively locked by its creator.
    pub(crate) fn constructing(stm: Arc<StmShared>) -> Self {
        let orec = Orec::new_for_construction(stm.config().read_biased_threshold);
        Self {
            header: RefHeader::new(stm, orec, 0),
            value: RwLock::new(None),
        }
    }

    pub(crate) fn header(&self) -> &RefHeader {
        &self.header
    }

    /// Reads the committed value without a transaction.
    ///
    /// Spins while the exclusive lock is held, since the value may be in the middle
    /// of being replaced.
    pub(crate) fn atomic_get(&self) -> StmResult<T> {
        let config = self.header.stm.config();
        let budget = u64::from(config.spin_count.max(1)) * u64::from(config.atomic_lock_attempts);
        for _ in 0..budget {
            if self.header.orec.state().has_exclusive_lock() {
                std::hint::spin_loop();
                continue;
            }
            let version = self.header.version();
            let value = self.value.read().clone();
            if self.header.orec.state().has_exclusive_lock() || self.header.version() != version {
                continue;
            }
            if let Some(value) = value {
                return Ok(value);
            }
        }
        Err(StmError::ReferenceLocked {
            reference: self.header.id,
        })
    }

    fn lock_exclusively(&self) -> StmResult<ArriveOutcome> {
        let config = self.header.stm.config();
        for _ in 0..config.atomic_lock_attempts {
            let outcome = self
                .header
                .orec
                .try_lock_and_arrive(config.spin_count, LockMode::Exclusive);
            if outcome.is_arrived() {
                return Ok(outcome);
            }
            std::thread::yield_now();
        }
        Err(StmError::ReferenceLocked {
            reference: self.header.id,
        })
    }

    fn unlock_unchanged(&self, outcome: ArriveOutcome) {
        if outcome.has_depart_obligation() {
            self.header.orec.depart_after_reading_and_unlock();
        } else {
            self.header.orec.unlock_by_unregistered();
        }
    }

    /// Runs `update` on the committed value under the exclusive lock.
    ///
    /// `update` returns the replacement value, if any, and the result to hand back.
    /// A replacement equal to the current value does not bump the version.
    pub(crate) fn atomic_modify<R>(&self, update: impl FnOnce(&T) -> (Option<T>, R)) -> StmResult<R> {
        let outcome = self.lock_exclusively()?;
        let current = self.value.read().clone();
        let Some(current) = current else {
            self.unlock_unchanged(outcome);
            return Err(StmError::ReferenceLocked {
                reference: self.header.id,
            });
        };

        let (replacement, result) = update(&current);
        match replacement {
            Some(value) if value != current => {
                let listeners = self.publish(value);
                listeners.open_all();
            }
            _ => self.unlock_unchanged(outcome),
        }
        Ok(result)
    }

    fn publish(&self, value: T) -> ListenerChain {
        *self.value.write() = Some(value);
        self.header.publish_version(self.header.version() + 1);
        let listeners = self.header.listeners.take();
        self.header
            .orec
            .depart_after_update_and_unlock(self.header.stm.conflicts());
        listeners
    }
}
