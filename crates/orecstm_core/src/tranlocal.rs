//! Transaction-local snapshot of one reference.
//!
//! A [`Tranlocal`] records what a transaction knows about a reference: the version
//! it read, the value it works on, the lock it holds and whether it still owes the
//! orec a depart. All orec traffic of a transaction goes through the methods here so
//! that every arrival and lock is paired with exactly one release.

use crate::conflict::GlobalConflictCounter;
use crate::error::FunctionError;
use crate::listeners::ListenerChain;
use crate::object::TxnObject;
use crate::orec::ArriveOutcome;
use crate::types::{LockMode, RefId};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value of any reference type, boxed for storage in a transaction.
pub(crate) type BoxedValue = Box<dyn Any + Send>;

/// Deferred transform recorded by a commute.
pub(crate) type CommuteFn = Box<dyn Fn(BoxedValue) -> Result<BoxedValue, FunctionError> + Send>;

/// Unboxes a value of a known type.
pub(crate) fn unbox<T: 'static>(value: BoxedValue) -> T {
    match value.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => panic!("expected a value of type {}", std::any::type_name::<T>()),
    }
}

/// How a transaction uses a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranlocalMode {
    /// Opened for reading.
    Read,
    /// Opened for writing.
    Write,
    /// Created by this transaction and not yet published.
    Construction,
    /// Only deferred commuting functions are recorded; nothing was read yet.
    Commute,
}

impl fmt::Display for TranlocalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Construction => "construction",
            Self::Commute => "commute",
        };
        f.write_str(name)
    }
}

/// Per-transaction state of one reference.
pub struct Tranlocal {
    pub(crate) owner: Arc<dyn TxnObject>,
    pub(crate) version: u64,
    pub(crate) old_value: Option<BoxedValue>,
    pub(crate) value: Option<BoxedValue>,
    pub(crate) lock_mode: LockMode,
    pub(crate) mode: TranlocalMode,
    pub(crate) is_dirty: bool,
    pub(crate) commuting: Vec<CommuteFn>,
    pub(crate) has_depart_obligation: bool,
    pub(crate) write_skew_check: bool,
}

impl Tranlocal {
    pub(crate) fn new(owner: Arc<dyn TxnObject>, mode: TranlocalMode, write_skew_check: bool) -> Self {
        Self {
            owner,
            version: 0,
            old_value: None,
            value: None,
            lock_mode: LockMode::None,
            mode,
            is_dirty: false,
            commuting: Vec::new(),
            has_depart_obligation: false,
            write_skew_check,
        }
    }

    /// Creates the tranlocal of a reference this transaction constructs.
    ///
    /// The creator holds the exclusive lock from the start; its arrival is released
    /// by the publishing depart, so there is no separate depart obligation.
    pub(crate) fn for_construction(owner: Arc<dyn TxnObject>, value: BoxedValue) -> Self {
        Self {
            lock_mode: LockMode::Exclusive,
            value: Some(value),
            is_dirty: true,
            ..Self::new(owner, TranlocalMode::Construction, false)
        }
    }

    /// Returns the id of the reference.
    #[must_use]
    pub fn reference(&self) -> RefId {
        self.owner.header().id()
    }

    /// Returns the version this tranlocal was loaded from.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns how the transaction uses the reference.
    #[must_use]
    pub fn mode(&self) -> TranlocalMode {
        self.mode
    }

    /// Returns the lock the transaction holds on the reference.
    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Returns true if the value will be published at commit.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Returns true if the transaction has a counted arrival on the orec.
    #[must_use]
    pub fn has_depart_obligation(&self) -> bool {
        self.has_depart_obligation
    }

    /// Returns the number of commuting functions not yet applied.
    #[must_use]
    pub fn pending_commutes(&self) -> usize {
        self.commuting.len()
    }

    /// Returns true if the value is checked for concurrent updates at prepare.
    #[must_use]
    pub fn write_skew_check(&self) -> bool {
        self.write_skew_check
    }

    /// Returns the working value, if loaded and of type `T`.
    #[must_use]
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|value| value.downcast_ref())
    }

    /// Returns the working value mutably, if loaded and of type `T`.
    pub fn value_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.value.as_mut().and_then(|value| value.downcast_mut())
    }

    /// Returns the value as it was when opened for writing.
    #[must_use]
    pub fn old_value<T: 'static>(&self) -> Option<&T> {
        self.old_value.as_ref().and_then(|value| value.downcast_ref())
    }

    pub(crate) fn typed_value<T: 'static>(&self) -> &T {
        match self.value() {
            Some(value) => value,
            None => panic!(
                "{} has no loaded value of type {}",
                self.reference(),
                std::any::type_name::<T>()
            ),
        }
    }

    pub(crate) fn replace_value<T: Send + 'static>(&mut self, value: T) {
        self.value = Some(Box::new(value));
    }

    /// Turns a read into a write, remembering the old value for the dirty check.
    pub(crate) fn upgrade_to_write(&mut self, dirty_check: bool) {
        if self.mode != TranlocalMode::Read {
            return;
        }
        self.old_value = self
            .value
            .as_ref()
            .map(|value| self.owner.clone_value(value));
        self.mode = TranlocalMode::Write;
        self.is_dirty = !dirty_check;
    }

    /// Loads the committed value, arriving on the orec and acquiring `lock_mode`.
    ///
    /// Returns false if the orec stayed locked for the whole spin budget or the value
    /// was replaced while it was being read; nothing is held on the orec then.
    pub(crate) fn load(&mut self, spin: u32, lock_mode: LockMode) -> bool {
        let header = self.owner.header();

        if lock_mode != LockMode::None {
            let outcome = header.orec.try_lock_and_arrive(spin, lock_mode);
            if !outcome.is_arrived() {
                return false;
            }
            let Some(value) = self.owner.read_value() else {
                // Still under construction by another transaction.
                release_failed_lock(self.owner.as_ref(), outcome);
                return false;
            };
            self.version = header.version();
            self.value = Some(value);
            self.lock_mode = lock_mode;
            self.has_depart_obligation = outcome.has_depart_obligation();
            return true;
        }

        loop {
            let version = header.version();
            let value = self.owner.read_value();

            let outcome = header.orec.arrive(spin);
            if !outcome.is_arrived() {
                return false;
            }

            if header.version() != version {
                if outcome.has_depart_obligation() {
                    header.orec.depart_after_failure();
                }
                continue;
            }

            let Some(value) = value else {
                if outcome.has_depart_obligation() {
                    header.orec.depart_after_failure();
                }
                return false;
            };

            self.version = version;
            self.value = Some(value);
            self.has_depart_obligation = outcome.has_depart_obligation();
            return true;
        }
    }

    /// Acquires at least `desired` on an already loaded tranlocal and checks that the
    /// version did not move since it was loaded.
    ///
    /// On failure a lock taken by this call is released again and the lock mode is
    /// left unchanged. When the lock was taken on top of the existing arrival, the
    /// two are released together and the depart obligation is cleared.
    pub(crate) fn try_lock_and_check_conflict(&mut self, spin: u32, desired: LockMode) -> bool {
        if self.lock_mode >= desired {
            return true;
        }

        let header = self.owner.header();
        match self.lock_mode {
            LockMode::None => {
                if header.version() != self.version {
                    return false;
                }

                if self.has_depart_obligation {
                    if !header.orec.try_lock_after_normal_arrive(spin, desired) {
                        return false;
                    }
                    if header.version() != self.version {
                        // The arrival goes together with the lock.
                        header.orec.depart_after_failure_and_unlock();
                        self.has_depart_obligation = false;
                        return false;
                    }
                } else {
                    let outcome = header.orec.try_lock_and_arrive(spin, desired);
                    if !outcome.is_arrived() {
                        return false;
                    }
                    if header.version() != self.version {
                        release_failed_lock(self.owner.as_ref(), outcome);
                        return false;
                    }
                    self.has_depart_obligation = outcome.has_depart_obligation();
                }
            }
            LockMode::Read => {
                if !header
                    .orec
                    .try_upgrade_from_read_lock(spin, desired == LockMode::Exclusive)
                {
                    return false;
                }
            }
            LockMode::Write => header.orec.upgrade_write_lock_to_commit_lock(),
            LockMode::Exclusive => unreachable!("exclusive is the strongest lock mode"),
        }

        self.lock_mode = desired;
        true
    }

    /// Releases the tranlocal after a successful commit that did not change it.
    pub(crate) fn release_after_reading(&mut self) {
        let orec = &self.owner.header().orec;
        if self.lock_mode.is_locked() {
            if self.has_depart_obligation {
                orec.depart_after_reading_and_unlock();
            } else {
                orec.unlock_by_unregistered();
            }
        } else if self.has_depart_obligation {
            orec.depart_after_reading();
        }
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
    }

    /// Releases the tranlocal after an abort.
    ///
    /// A reference under construction stays locked forever: it was never published,
    /// so no other transaction can have seen it.
    pub(crate) fn release_after_failure(&mut self) {
        if self.mode == TranlocalMode::Construction {
            return;
        }
        let orec = &self.owner.header().orec;
        if self.lock_mode.is_locked() {
            if self.has_depart_obligation {
                orec.depart_after_failure_and_unlock();
            } else {
                orec.unlock_by_unregistered();
            }
        } else if self.has_depart_obligation {
            orec.depart_after_failure();
        }
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
    }

    /// Publishes the working value under the exclusive lock and departs.
    ///
    /// The new version is one past the version that was read, which for a
    /// construction is 0. Returns the detached listener chain; the caller opens it
    /// once every tranlocal of the transaction is released.
    pub(crate) fn publish(&mut self, conflicts: &GlobalConflictCounter) -> ListenerChain {
        let header = self.owner.header();
        if let Some(value) = self.value.take() {
            self.owner.write_value(value);
        }
        header.publish_version(self.version + 1);
        let listeners = header.listeners.take();
        header.orec.depart_after_update_and_unlock(conflicts);
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
        listeners
    }

    /// Finishes the tranlocal as part of a successful commit.
    pub(crate) fn commit(&mut self, conflicts: &GlobalConflictCounter) -> ListenerChain {
        match self.mode {
            TranlocalMode::Construction => self.publish(conflicts),
            TranlocalMode::Write if self.is_dirty => self.publish(conflicts),
            _ => {
                self.release_after_reading();
                ListenerChain::EMPTY
            }
        }
    }

    /// Takes the locks commit needs.
    ///
    /// Dirty writes get the exclusive lock. Reads that take part in the write skew
    /// check get at least a read lock. Returns false on a conflict.
    pub(crate) fn prepare(&mut self, spin: u32, dirty_check: bool) -> bool {
        match self.mode {
            TranlocalMode::Construction => true,
            TranlocalMode::Commute => {
                unreachable!("commuting functions are applied before prepare")
            }
            TranlocalMode::Read => {
                !self.write_skew_check || self.try_lock_and_check_conflict(spin, LockMode::Read)
            }
            TranlocalMode::Write => {
                if !self.is_dirty && dirty_check {
                    self.is_dirty = match (&self.old_value, &self.value) {
                        (Some(old), Some(new)) => !self.owner.values_equal(old, new),
                        _ => true,
                    };
                }
                if self.is_dirty {
                    self.try_lock_and_check_conflict(spin, LockMode::Exclusive)
                } else if self.write_skew_check {
                    self.try_lock_and_check_conflict(spin, LockMode::Read)
                } else {
                    true
                }
            }
        }
    }

    /// Returns true if the committed state moved away from this tranlocal.
    pub(crate) fn has_read_conflict(&self) -> bool {
        match self.mode {
            TranlocalMode::Commute | TranlocalMode::Construction => false,
            TranlocalMode::Read | TranlocalMode::Write => {
                self.owner.header().has_read_conflict(self)
            }
        }
    }
}

fn release_failed_lock(owner: &dyn TxnObject, outcome: ArriveOutcome) {
    let orec = &owner.header().orec;
    if outcome.has_depart_obligation() {
        orec.depart_after_failure_and_unlock();
    } else {
        orec.unlock_by_unregistered();
    }
}

impl fmt::Debug for Tranlocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tranlocal")
            .field("reference", &self.reference())
            .field("version", &self.version)
            .field("mode", &self.mode)
            .field("lock_mode", &self.lock_mode)
            .field("is_dirty", &self.is_dirty)
            .field("has_depart_obligation", &self.has_depart_obligation)
            .field("pending_commutes", &self.commuting.len())
            .finish_non_exhaustive()
    }
}
