//! Typed transactional references.

use crate::error::{FunctionError, StmResult};
use crate::object::RefInner;
use crate::orec::OrecState;
use crate::stm::StmShared;
use crate::tranlocal::{unbox, BoxedValue, CommuteFn, Tranlocal};
use crate::transaction::Transaction;
use crate::types::{LockMode, RefId};
use std::fmt;
use std::ops::Add;
use std::sync::Arc;

/// Values that can be stored in a [`TxnRef`].
///
/// Values are cloned into and out of transactions and compared by the dirty check.
pub trait Value: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> Value for T {}

/// A transactional reference to a value of type `T`.
///
/// Cloning the handle is cheap; clones refer to the same reference.
pub struct TxnRef<T: Value> {
    inner: Arc<RefInner<T>>,
}

impl<T: Value> Clone for TxnRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Value> TxnRef<T> {
    pub(crate) fn committed(stm: Arc<StmShared>, value: T) -> Self {
        Self {
            inner: Arc::new(RefInner::committed(stm, value)),
        }
    }

    pub(crate) fn constructing(stm: Arc<StmShared>) -> Self {
        Self {
            inner: Arc::new(RefInner::constructing(stm)),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RefInner<T>> {
        &self.inner
    }

    /// Returns the reference ID.
    #[must_use]
    pub fn id(&self) -> RefId {
        self.inner.header().id()
    }

    /// Returns the version of the last committed value; 0 while under construction.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.header().version()
    }

    /// Returns a snapshot of the orec.
    #[must_use]
    pub fn orec(&self) -> OrecState {
        self.inner.header().orec.state()
    }

    /// Returns the number of retry latches waiting for the next write.
    #[must_use]
    pub fn waiting_listeners(&self) -> usize {
        self.inner.header().listeners.len()
    }

    /// Returns true if both handles refer to the same reference.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Reads the value.
    pub fn get(&self, tx: &mut Transaction) -> StmResult<T> {
        tx.read(self)
    }

    /// Writes the value.
    pub fn set(&self, tx: &mut Transaction, value: T) -> StmResult<()> {
        tx.open_for_write(self, LockMode::None)?.replace_value(value);
        Ok(())
    }

    /// Writes the value and returns the previous one.
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> StmResult<T> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let previous = tranlocal.typed_value::<T>().clone();
        tranlocal.replace_value(value);
        Ok(previous)
    }

    /// Replaces the value with `function(value)` and returns the new value.
    pub fn alter(&self, tx: &mut Transaction, function: impl FnOnce(T) -> T) -> StmResult<T> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let next = function(tranlocal.typed_value::<T>().clone());
        tranlocal.replace_value(next.clone());
        Ok(next)
    }

    /// Like [`alter`](Self::alter), but `function` may fail, which aborts the
    /// transaction.
    pub fn try_alter<E>(
        &self,
        tx: &mut Transaction,
        function: impl FnOnce(T) -> Result<T, E>,
    ) -> StmResult<T>
    where
        E: Into<FunctionError>,
    {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        match function(tranlocal.typed_value::<T>().clone()) {
            Ok(next) => {
                tranlocal.replace_value(next.clone());
                Ok(next)
            }
            Err(source) => Err(tx.fail_with_function_error(source.into())),
        }
    }

    /// Applies `function` to the value at commit without reading it now.
    ///
    /// See [`Transaction::commute`].
    pub fn commute<F>(&self, tx: &mut Transaction, function: F) -> StmResult<()>
    where
        F: Fn(T) -> T + Send + 'static,
    {
        tx.commute(self, function)
    }

    /// Like [`commute`](Self::commute), but `function` may fail, which aborts the
    /// transaction when the function is applied.
    pub fn try_commute<F, E>(&self, tx: &mut Transaction, function: F) -> StmResult<()>
    where
        F: Fn(T) -> Result<T, E> + Send + 'static,
        E: Into<FunctionError>,
    {
        let function: CommuteFn =
            Box::new(move |value: BoxedValue| -> Result<BoxedValue, FunctionError> {
                function(unbox::<T>(value))
                    .map(|next| Box::new(next) as BoxedValue)
                    .map_err(Into::into)
            });
        tx.commute_boxed(self, function)
    }

    /// Makes the commit fail if another transaction updates the reference before
    /// this transaction commits, even if this transaction only reads it.
    pub fn ensure(&self, tx: &mut Transaction) -> StmResult<()> {
        tx.open_for_read(self, LockMode::None)?.write_skew_check = true;
        Ok(())
    }

    /// Acquires at least `lock_mode` on the reference, held until the transaction
    /// ends.
    pub fn acquire(&self, tx: &mut Transaction, lock_mode: LockMode) -> StmResult<()> {
        tx.open_for_read(self, lock_mode)?;
        Ok(())
    }

    /// Returns the lock `tx` holds on the reference.
    #[must_use]
    pub fn lock_mode(&self, tx: &Transaction) -> LockMode {
        tx.locate(self).map_or(LockMode::None, Tranlocal::lock_mode)
    }

    /// Blocks the transaction until the value equals `expected`.
    pub fn await_value(&self, tx: &mut Transaction, expected: &T) -> StmResult<()> {
        if self.get(tx)? == *expected {
            Ok(())
        } else {
            tx.retry()
        }
    }

    /// Blocks the transaction until `predicate` holds for the value, and returns it.
    pub fn await_until(
        &self,
        tx: &mut Transaction,
        predicate: impl FnOnce(&T) -> bool,
    ) -> StmResult<T> {
        let value = self.get(tx)?;
        if predicate(&value) {
            Ok(value)
        } else {
            tx.retry()
        }
    }

    /// Reads the committed value without a transaction.
    pub fn atomic_get(&self) -> StmResult<T> {
        self.inner.atomic_get()
    }

    /// Writes the value without a transaction and returns the previous one.
    pub fn atomic_set(&self, value: T) -> StmResult<T> {
        self.inner
            .atomic_modify(|current| (Some(value), current.clone()))
    }

    /// Replaces the value with `function(value)` without a transaction and returns
    /// the new value.
    pub fn atomic_alter(&self, function: impl FnOnce(T) -> T) -> StmResult<T> {
        self.inner.atomic_modify(|current| {
            let next = function(current.clone());
            (Some(next.clone()), next)
        })
    }

    /// Writes `value` if the current value equals `expected`. Returns true if it did.
    pub fn atomic_compare_and_set(&self, expected: &T, value: T) -> StmResult<bool> {
        self.inner.atomic_modify(|current| {
            if current == expected {
                (Some(value), true)
            } else {
                (None, false)
            }
        })
    }

    /// Returns the lock currently held on the reference by anyone.
    #[must_use]
    pub fn atomic_lock_mode(&self) -> LockMode {
        self.orec().lock_mode()
    }
}

impl<T> TxnRef<T>
where
    T: Value + Add<Output = T>,
{
    /// Adds `delta` to the value and returns the new value.
    pub fn increment(&self, tx: &mut Transaction, delta: T) -> StmResult<T> {
        self.alter(tx, |value| value + delta)
    }

    /// Adds `delta` to the value at commit without reading it now.
    pub fn commute_increment(&self, tx: &mut Transaction, delta: T) -> StmResult<()> {
        self.commute(tx, move |value| value + delta.clone())
    }

    /// Adds `delta` to the value without a transaction and returns the new value.
    pub fn atomic_increment_and_get(&self, delta: T) -> StmResult<T> {
        self.atomic_alter(|value| value + delta)
    }
}

impl<T: Value> fmt::Debug for TxnRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnRef")
            .field("id", &self.id())
            .field("version", &self.version())
            .field("orec", &self.orec())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StmError;
    use crate::Stm;

    #[test]
    fn set_is_visible_after_commit() {
        let stm = Stm::new();
        let reference = stm.new_ref(String::from("a"));
        let mut tx = stm.new_transaction();
        reference.set(&mut tx, String::from("b")).unwrap();
        assert_eq!(reference.get(&mut tx).unwrap(), "b");
        assert_eq!(reference.atomic_get().unwrap(), "a");
        tx.commit().unwrap();
        assert_eq!(reference.atomic_get().unwrap(), "b");
        assert_eq!(reference.version(), 2);
    }

    #[test]
    fn get_and_set_returns_previous() {
        let stm = Stm::new();
        let reference = stm.new_ref(1_u32);
        let previous = stm.atomic(|tx| reference.get_and_set(tx, 9)).unwrap();
        assert_eq!(previous, 1);
        assert_eq!(reference.atomic_get().unwrap(), 9);
    }

    #[test]
    fn try_alter_error_aborts() {
        let stm = Stm::new();
        let reference = stm.new_ref(5_i64);
        let mut tx = stm.new_transaction();
        let result = reference.try_alter(&mut tx, |value| {
            if value < 10 {
                Err("too small")
            } else {
                Ok(value)
            }
        });
        assert!(matches!(result, Err(StmError::Function { .. })));
        assert_eq!(tx.status(), crate::TransactionStatus::Aborted);
        assert!(!reference.orec().has_any_lock());
    }

    #[test]
    fn acquire_holds_lock_until_commit() {
        let stm = Stm::new();
        let reference = stm.new_ref(0_i32);
        let mut tx = stm.new_transaction();
        reference.acquire(&mut tx, LockMode::Write).unwrap();
        assert_eq!(reference.lock_mode(&tx), LockMode::Write);
        assert_eq!(reference.atomic_lock_mode(), LockMode::Write);
        assert!(matches!(
            reference.atomic_set(1),
            Err(StmError::ReferenceLocked { .. })
        ));
        tx.commit().unwrap();
        assert_eq!(reference.atomic_lock_mode(), LockMode::None);
        assert_eq!(reference.atomic_set(1).unwrap(), 0);
    }

    #[test]
    fn atomic_compare_and_set() {
        let stm = Stm::new();
        let reference = stm.new_ref(3_i32);
        assert!(!reference.atomic_compare_and_set(&4, 5).unwrap());
        assert_eq!(reference.version(), 1);
        assert!(reference.atomic_compare_and_set(&3, 5).unwrap());
        assert_eq!(reference.atomic_get().unwrap(), 5);
        assert_eq!(reference.version(), 2);
    }

    #[test]
    fn increments() {
        let stm = Stm::new();
        let reference = stm.new_ref(10_i64);
        assert_eq!(stm.atomic(|tx| reference.increment(tx, 5)).unwrap(), 15);
        stm.atomic(|tx| reference.commute_increment(tx, 2)).unwrap();
        assert_eq!(reference.atomic_increment_and_get(3).unwrap(), 20);
    }

    #[test]
    fn await_value_without_blocking_is_rejected() {
        let stm = Stm::new();
        let reference = stm.new_ref(0_i32);
        let executor = stm
            .executor(crate::TransactionConfig::new().blocking_allowed(false))
            .unwrap();
        let result = executor.execute(|tx| reference.await_value(tx, &1));
        assert!(matches!(result, Err(StmError::RetryNotAllowed { .. })));
    }
}
