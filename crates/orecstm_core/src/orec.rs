//! Ownership record (orec): the concurrency state guarding one reference.
//!
//! All state lives in a single `u64` that is only ever changed with
//! compare-and-swap, so lock mode, arrival count and read-bias bookkeeping can never
//! be updated independently of each other.
//!
//! ## Layout
//!
//! | bits  | field                                   |
//! |-------|-----------------------------------------|
//! | 63    | exclusive (commit) lock                 |
//! | 62    | write lock                              |
//! | 61    | read-biased flag                        |
//! | 40-60 | read lock count                         |
//! | 10-39 | surplus (arrived transactions)          |
//! | 0-9   | readonly streak                         |
//!
//! ## Arrive and depart
//!
//! A transaction *arrives* when it starts depending on the committed state of the
//! reference and *departs* when it stops. The surplus counts transactions that have
//! arrived but not departed, so a committing writer knows whether anyone else may be
//! reading a value it is about to replace. When the surplus is non-zero after the
//! writer departs, the global conflict counter is bumped so readers re-validate.
//!
//! A long enough streak of read-only departs switches the orec to *read-biased*
//! mode. Readers then stop counting themselves; the surplus sticks at 1 and every
//! write has to assume there are readers.
//!
//! Every protocol violation (departing without arriving, unlocking a lock that is not
//! held, ...) is a bug in the engine and panics with the rendered orec state.

use crate::conflict::GlobalConflictCounter;
use crate::types::LockMode;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const EXCLUSIVE_LOCK: u64 = 1 << 63;
const WRITE_LOCK: u64 = 1 << 62;
const READ_BIASED: u64 = 1 << 61;

const READ_LOCK_SHIFT: u32 = 40;
const READ_LOCK_MASK: u64 = 0x1F_FFFF << READ_LOCK_SHIFT;

const SURPLUS_SHIFT: u32 = 10;
const SURPLUS_MASK: u64 = 0x3FFF_FFFF << SURPLUS_SHIFT;
const MAX_SURPLUS: u64 = SURPLUS_MASK >> SURPLUS_SHIFT;

const READONLY_MASK: u64 = 0x3FF;

/// Largest readonly streak the orec can count, and so the largest valid
/// read-biased threshold.
pub const MAX_READ_BIASED_THRESHOLD: u32 = READONLY_MASK as u32;

/// Default number of consecutive read-only departs before an orec becomes
/// read-biased.
pub const DEFAULT_READ_BIASED_THRESHOLD: u32 = 128;

/// Outcome of an arrival attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArriveOutcome {
    /// The arrival was counted; the caller must depart later.
    Normal,
    /// The orec is read-biased and did not count the arrival; no depart is needed.
    Unregistered,
    /// The orec stayed locked for the whole spin budget.
    LockNotFree,
}

impl ArriveOutcome {
    /// Returns true if the caller is now arrived (counted or not).
    #[must_use]
    pub const fn is_arrived(self) -> bool {
        !matches!(self, Self::LockNotFree)
    }

    /// Returns true if the caller has to depart from the orec later.
    #[must_use]
    pub const fn has_depart_obligation(self) -> bool {
        matches!(self, Self::Normal)
    }
}

/// A decoded snapshot of the orec word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OrecState(u64);

impl OrecState {
    /// The state of a fresh orec: unlocked, update-biased, nobody arrived.
    pub const EMPTY: Self = Self(0);

    /// Returns the raw packed word.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the strongest lock mode currently held.
    #[must_use]
    pub const fn lock_mode(self) -> LockMode {
        if self.0 & EXCLUSIVE_LOCK != 0 {
            LockMode::Exclusive
        } else if self.0 & WRITE_LOCK != 0 {
            LockMode::Write
        } else if self.0 & READ_LOCK_MASK != 0 {
            LockMode::Read
        } else {
            LockMode::None
        }
    }

    /// Returns true if the exclusive (commit) lock is held.
    #[must_use]
    pub const fn has_exclusive_lock(self) -> bool {
        self.0 & EXCLUSIVE_LOCK != 0
    }

    /// Returns true if the write lock is held.
    #[must_use]
    pub const fn has_write_lock(self) -> bool {
        self.0 & WRITE_LOCK != 0
    }

    /// Returns true if a write or exclusive lock is held.
    #[must_use]
    pub const fn has_write_or_exclusive_lock(self) -> bool {
        self.0 & (WRITE_LOCK | EXCLUSIVE_LOCK) != 0
    }

    /// Returns true if any lock, including a shared read lock, is held.
    #[must_use]
    pub const fn has_any_lock(self) -> bool {
        self.0 & (WRITE_LOCK | EXCLUSIVE_LOCK | READ_LOCK_MASK) != 0
    }

    /// Returns the number of read lock holders.
    #[must_use]
    pub const fn read_lock_count(self) -> u64 {
        (self.0 & READ_LOCK_MASK) >> READ_LOCK_SHIFT
    }

    /// Returns the number of arrived transactions.
    #[must_use]
    pub const fn surplus(self) -> u64 {
        (self.0 & SURPLUS_MASK) >> SURPLUS_SHIFT
    }

    /// Returns true if the orec is in read-biased mode.
    #[must_use]
    pub const fn is_read_biased(self) -> bool {
        self.0 & READ_BIASED != 0
    }

    /// Returns the current streak of read-only departs.
    #[must_use]
    pub const fn readonly_count(self) -> u32 {
        (self.0 & READONLY_MASK) as u32
    }

    const fn with_surplus(self, surplus: u64) -> Self {
        Self((self.0 & !SURPLUS_MASK) | (surplus << SURPLUS_SHIFT))
    }

    const fn with_read_lock_count(self, count: u64) -> Self {
        Self((self.0 & !READ_LOCK_MASK) | (count << READ_LOCK_SHIFT))
    }

    const fn with_readonly_count(self, count: u32) -> Self {
        Self((self.0 & !READONLY_MASK) | count as u64)
    }

    const fn with_read_biased(self, read_biased: bool) -> Self {
        if read_biased {
            Self(self.0 | READ_BIASED)
        } else {
            Self(self.0 & !READ_BIASED)
        }
    }

    /// Adds `mode` to the state. Read locks are counted.
    const fn with_lock(self, mode: LockMode) -> Self {
        match mode {
            LockMode::None => self,
            LockMode::Read => self.with_read_lock_count(self.read_lock_count() + 1),
            LockMode::Write => Self(self.0 | WRITE_LOCK),
            LockMode::Exclusive => Self(self.0 | EXCLUSIVE_LOCK),
        }
    }

    /// Releases one lock: one read lock holder, or the single write/exclusive holder.
    const fn without_lock(self) -> Self {
        if self.has_write_or_exclusive_lock() {
            Self(self.0 & !(WRITE_LOCK | EXCLUSIVE_LOCK))
        } else {
            self.with_read_lock_count(self.read_lock_count().saturating_sub(1))
        }
    }

    /// Returns true if the current holders block a request for `mode`.
    const fn blocks(self, mode: LockMode) -> bool {
        match mode {
            LockMode::None => false,
            LockMode::Read => self.has_write_or_exclusive_lock(),
            LockMode::Write | LockMode::Exclusive => self.has_any_lock(),
        }
    }
}

impl fmt::Display for OrecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Orec(lock={}, read_locks={}, surplus={}, read_biased={}, readonly={})",
            self.lock_mode(),
            self.read_lock_count(),
            self.surplus(),
            self.is_read_biased(),
            self.readonly_count()
        )
    }
}

impl fmt::Debug for OrecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cold]
#[track_caller]
fn fatal(operation: &str, reason: &str, state: OrecState) -> ! {
    panic!("orec protocol violation in {operation}: {reason}, {state}")
}

/// Ownership record guarding one transactional reference.
pub struct Orec {
    state: AtomicU64,
    read_biased_threshold: u32,
}

impl Orec {
    /// Creates an unlocked, update-biased orec.
    ///
    /// # Panics
    ///
    /// Panics if `read_biased_threshold` is 0 or above
    /// [`MAX_READ_BIASED_THRESHOLD`].
    #[must_use]
    pub fn new(read_biased_threshold: u32) -> Self {
        Self::with_state(read_biased_threshold, OrecState::EMPTY)
    }

    /// Creates an orec for a reference under construction: exclusively locked with
    /// its creator counted as the only arrival.
    #[must_use]
    pub(crate) fn new_for_construction(read_biased_threshold: u32) -> Self {
        Self::with_state(
            read_biased_threshold,
            OrecState::EMPTY
                .with_surplus(1)
                .with_lock(LockMode::Exclusive),
        )
    }

    fn with_state(read_biased_threshold: u32, state: OrecState) -> Self {
        assert!(
            (1..=MAX_READ_BIASED_THRESHOLD).contains(&read_biased_threshold),
            "read-biased threshold must be in 1..={MAX_READ_BIASED_THRESHOLD}, got {read_biased_threshold}"
        );
        Self {
            state: AtomicU64::new(state.raw()),
            read_biased_threshold,
        }
    }

    /// Returns a snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> OrecState {
        OrecState(self.state.load(Ordering::SeqCst))
    }

    /// Returns the readonly streak at which the orec becomes read-biased.
    #[must_use]
    pub fn read_biased_threshold(&self) -> u32 {
        self.read_biased_threshold
    }

    fn compare_and_set(&self, current: OrecState, next: OrecState) -> bool {
        self.state
            .compare_exchange(current.0, next.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Computes the state after one more arrival, or `None` when a read-biased orec
    /// already has its sticky arrival.
    fn arrival(operation: &str, current: OrecState) -> (Option<OrecState>, ArriveOutcome) {
        let surplus = current.surplus();
        if current.is_read_biased() {
            match surplus {
                0 => (Some(current.with_surplus(1)), ArriveOutcome::Unregistered),
                1 => (None, ArriveOutcome::Unregistered),
                _ => fatal(operation, "read-biased orec with surplus above 1", current),
            }
        } else {
            if surplus == MAX_SURPLUS {
                fatal(operation, "surplus overflow", current);
            }
            (Some(current.with_surplus(surplus + 1)), ArriveOutcome::Normal)
        }
    }

    /// Registers interest in the committed state.
    ///
    /// Spins up to `spin` times while a write or exclusive lock is held and then
    /// reports [`ArriveOutcome::LockNotFree`].
    pub fn arrive(&self, spin: u32) -> ArriveOutcome {
        let mut remaining = spin;
        loop {
            let current = self.state();
            if current.has_write_or_exclusive_lock() {
                if remaining == 0 {
                    return ArriveOutcome::LockNotFree;
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }

            match Self::arrival("arrive", current) {
                (None, outcome) => return outcome,
                (Some(next), outcome) => {
                    if self.compare_and_set(current, next) {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Arrives and acquires `mode` in a single step.
    pub fn try_lock_and_arrive(&self, spin: u32, mode: LockMode) -> ArriveOutcome {
        if mode == LockMode::None {
            return self.arrive(spin);
        }

        let mut remaining = spin;
        loop {
            let current = self.state();
            if current.blocks(mode) {
                if remaining == 0 {
                    return ArriveOutcome::LockNotFree;
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }

            let (arrived, outcome) = Self::arrival("try_lock_and_arrive", current);
            let next = arrived.unwrap_or(current).with_lock(mode);
            if self.compare_and_set(current, next) {
                return outcome;
            }
        }
    }

    /// Acquires `mode` for a caller that already has a counted arrival.
    ///
    /// Returns false if an incompatible lock stayed held for the whole spin budget.
    pub fn try_lock_after_normal_arrive(&self, spin: u32, mode: LockMode) -> bool {
        if mode == LockMode::None {
            return true;
        }

        let mut remaining = spin;
        loop {
            let current = self.state();
            if current.is_read_biased() {
                fatal(
                    "try_lock_after_normal_arrive",
                    "orec is read-biased so there is no counted arrival",
                    current,
                );
            }
            if current.surplus() == 0 {
                fatal("try_lock_after_normal_arrive", "no arrival to lock after", current);
            }
            if current.blocks(mode) {
                if remaining == 0 {
                    return false;
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }

            if self.compare_and_set(current, current.with_lock(mode)) {
                return true;
            }
        }
    }

    /// Upgrades the caller's read lock to a write lock, or to the exclusive lock when
    /// `exclusive` is set.
    ///
    /// Only the sole reader can upgrade; while other readers hold the lock this spins
    /// and then returns false.
    pub fn try_upgrade_from_read_lock(&self, spin: u32, exclusive: bool) -> bool {
        let mut remaining = spin;
        loop {
            let current = self.state();
            let readers = current.read_lock_count();
            if readers == 0 {
                fatal("try_upgrade_from_read_lock", "read lock not held", current);
            }
            if readers > 1 {
                if remaining == 0 {
                    return false;
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }

            let mode = if exclusive {
                LockMode::Exclusive
            } else {
                LockMode::Write
            };
            let next = current.with_read_lock_count(0).with_lock(mode);
            if self.compare_and_set(current, next) {
                return true;
            }
        }
    }

    /// Upgrades the caller's write lock to the exclusive lock.
    ///
    /// Already holding the exclusive lock is a no-op.
    pub fn upgrade_write_lock_to_exclusive_lock(&self) {
        loop {
            let current = self.state();
            if current.has_exclusive_lock() {
                return;
            }
            if !current.has_write_lock() {
                fatal("upgrade_write_lock_to_exclusive_lock", "write lock not held", current);
            }

            let next = OrecState(current.0 & !WRITE_LOCK).with_lock(LockMode::Exclusive);
            if self.compare_and_set(current, next) {
                return;
            }
        }
    }

    /// Upgrades the caller's write lock to the commit lock.
    ///
    /// The commit lock is the exclusive lock.
    #[inline]
    pub fn upgrade_write_lock_to_commit_lock(&self) {
        self.upgrade_write_lock_to_exclusive_lock();
    }

    fn readonly_depart(&self, current: OrecState, surplus: u64) -> OrecState {
        let threshold = self.read_biased_threshold;
        let mut readonly = current.readonly_count();
        if readonly < threshold {
            readonly += 1;
        }

        let next = current.with_surplus(surplus).with_readonly_count(readonly);
        if surplus == 0 && !next.has_any_lock() && readonly >= threshold {
            next.with_read_biased(true).with_readonly_count(0)
        } else {
            next
        }
    }

    /// Departs after a read that did not change anything.
    pub fn depart_after_reading(&self) {
        loop {
            let current = self.state();
            let surplus = current.surplus();
            if surplus == 0 {
                fatal("depart_after_reading", "no surplus to depart from", current);
            }
            if current.is_read_biased() {
                fatal("depart_after_reading", "orec is read-biased", current);
            }
            if surplus <= 1 && current.has_any_lock() {
                fatal("depart_after_reading", "lock is held by the only arrival", current);
            }

            let next = self.readonly_depart(current, surplus - 1);
            if self.compare_and_set(current, next) {
                return;
            }
        }
    }

    /// Departs after a read and releases the lock the caller held.
    pub fn depart_after_reading_and_unlock(&self) {
        loop {
            let current = self.state();
            let surplus = current.surplus();
            if surplus == 0 {
                fatal("depart_after_reading_and_unlock", "no surplus to depart from", current);
            }
            if current.is_read_biased() {
                fatal("depart_after_reading_and_unlock", "orec is read-biased", current);
            }
            if !current.has_any_lock() {
                fatal("depart_after_reading_and_unlock", "lock not held", current);
            }

            let next = self.readonly_depart(current.without_lock(), surplus - 1);
            if self.compare_and_set(current, next) {
                return;
            }
        }
    }

    /// Departs after a failed open or an aborted transaction, without a lock.
    pub fn depart_after_failure(&self) {
        loop {
            let current = self.state();
            if current.is_read_biased() {
                fatal("depart_after_failure", "orec is read-biased", current);
            }
            let surplus = current.surplus();
            if current.has_any_lock() {
                if surplus < 2 {
                    fatal("depart_after_failure", "lock is held by the only arrival", current);
                }
            } else if surplus == 0 {
                fatal("depart_after_failure", "no surplus to depart from", current);
            }

            if self.compare_and_set(current, current.with_surplus(surplus - 1)) {
                return;
            }
        }
    }

    /// Departs after a failure and releases the lock the caller held.
    ///
    /// On a read-biased orec the sticky arrival stays. Returns the residual surplus.
    pub fn depart_after_failure_and_unlock(&self) -> u64 {
        loop {
            let current = self.state();
            if !current.has_any_lock() {
                fatal("depart_after_failure_and_unlock", "lock not held", current);
            }
            let mut surplus = current.surplus();
            if surplus == 0 {
                fatal("depart_after_failure_and_unlock", "no surplus to depart from", current);
            }
            if current.is_read_biased() {
                if surplus > 1 {
                    fatal(
                        "depart_after_failure_and_unlock",
                        "read-biased orec with surplus above 1",
                        current,
                    );
                }
            } else {
                surplus -= 1;
            }

            let next = current.without_lock().with_surplus(surplus);
            if self.compare_and_set(current, next) {
                return surplus;
            }
        }
    }

    /// Releases a lock that was acquired without a counted arrival on a read-biased
    /// orec.
    pub fn unlock_by_unregistered(&self) {
        loop {
            let current = self.state();
            if !current.is_read_biased() {
                fatal("unlock_by_unregistered", "orec is not read-biased", current);
            }
            if !current.has_any_lock() {
                fatal("unlock_by_unregistered", "lock not held", current);
            }

            if self.compare_and_set(current, current.without_lock()) {
                return;
            }
        }
    }

    /// Departs after publishing a write and releases the write/exclusive lock.
    ///
    /// The orec returns to update-biased mode with an empty readonly streak. When
    /// other transactions are still arrived, or when the orec was read-biased and so
    /// its readers were never counted, the global conflict counter is signalled once.
    /// Returns the residual surplus.
    pub fn depart_after_update_and_unlock(&self, conflicts: &GlobalConflictCounter) -> u64 {
        loop {
            let current = self.state();
            if !current.has_write_or_exclusive_lock() {
                fatal("depart_after_update_and_unlock", "write lock not held", current);
            }
            let surplus = current.surplus();
            if surplus == 0 {
                fatal("depart_after_update_and_unlock", "no surplus to depart from", current);
            }

            let (residual, conflict) = if current.is_read_biased() {
                if surplus > 1 {
                    fatal(
                        "depart_after_update_and_unlock",
                        "read-biased orec with surplus above 1",
                        current,
                    );
                }
                (0, true)
            } else {
                (surplus - 1, surplus > 1)
            };

            if self.compare_and_set(current, OrecState::EMPTY.with_surplus(residual)) {
                if conflict {
                    conflicts.signal_conflict();
                }
                return residual;
            }
        }
    }
}

impl fmt::Debug for Orec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.state(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    const SPIN: u32 = 4;

    fn orec() -> Orec {
        Orec::new(DEFAULT_READ_BIASED_THRESHOLD)
    }

    fn read_biased_orec() -> Orec {
        let orec = Orec::new(2);
        for _ in 0..2 {
            assert_eq!(orec.arrive(SPIN), ArriveOutcome::Normal);
            orec.depart_after_reading();
        }
        assert!(orec.state().is_read_biased());
        orec
    }

    #[test]
    fn new_orec_is_empty() {
        let state = orec().state();
        assert_eq!(state, OrecState::EMPTY);
        assert_eq!(state.lock_mode(), LockMode::None);
        assert_eq!(state.surplus(), 0);
        assert!(!state.is_read_biased());
    }

    #[test]
    fn construction_orec_is_exclusively_locked_with_one_arrival() {
        let orec = Orec::new_for_construction(DEFAULT_READ_BIASED_THRESHOLD);
        let state = orec.state();
        assert_eq!(state.lock_mode(), LockMode::Exclusive);
        assert_eq!(state.surplus(), 1);
        assert_eq!(orec.arrive(SPIN), ArriveOutcome::LockNotFree);
    }

    #[test]
    fn arrive_increments_surplus() {
        let orec = orec();
        assert_eq!(orec.arrive(SPIN), ArriveOutcome::Normal);
        assert_eq!(orec.arrive(SPIN), ArriveOutcome::Normal);
        assert_eq!(orec.state().surplus(), 2);
    }

    #[test]
    fn arrive_fails_on_write_and_exclusive_lock() {
        for mode in [LockMode::Write, LockMode::Exclusive] {
            let orec = orec();
            assert_eq!(orec.try_lock_and_arrive(SPIN, mode), ArriveOutcome::Normal);
            assert_eq!(orec.arrive(SPIN), ArriveOutcome::LockNotFree);
            assert_eq!(orec.state().surplus(), 1);
        }
    }

    #[test]
    fn arrive_passes_read_lock() {
        let orec = orec();
        assert_eq!(orec.try_lock_and_arrive(SPIN, LockMode::Read), ArriveOutcome::Normal);
        assert_eq!(orec.arrive(SPIN), ArriveOutcome::Normal);
        assert_eq!(orec.state().surplus(), 2);
        assert_eq!(orec.state().read_lock_count(), 1);
    }

    #[test]
    fn read_locks_are_shared_and_counted() {
        let orec = orec();
        assert!(orec.try_lock_and_arrive(SPIN, LockMode::Read).is_arrived());
        assert!(orec.try_lock_and_arrive(SPIN, LockMode::Read).is_arrived());
        assert_eq!(orec.state().read_lock_count(), 2);
        assert_eq!(orec.state().lock_mode(), LockMode::Read);

        assert_eq!(
            orec.try_lock_and_arrive(SPIN, LockMode::Write),
            ArriveOutcome::LockNotFree
        );
        assert_eq!(orec.state().surplus(), 2);
    }

    #[test]
    fn read_lock_blocked_by_exclusive_lock() {
        let orec = orec();
        assert!(orec.try_lock_and_arrive(SPIN, LockMode::Exclusive).is_arrived());
        assert_eq!(
            orec.try_lock_and_arrive(SPIN, LockMode::Read),
            ArriveOutcome::LockNotFree
        );
        assert_eq!(orec.state().read_lock_count(), 0);
    }

    #[test]
    fn lock_after_normal_arrive() {
        let orec = orec();
        orec.arrive(SPIN);
        orec.arrive(SPIN);

        assert!(orec.try_lock_after_normal_arrive(SPIN, LockMode::Read));
        assert!(orec.try_lock_after_normal_arrive(SPIN, LockMode::Read));
        assert!(!orec.try_lock_after_normal_arrive(SPIN, LockMode::Exclusive));
        assert_eq!(orec.state().read_lock_count(), 2);
        assert_eq!(orec.state().surplus(), 2);
    }

    #[test]
    #[should_panic(expected = "no arrival to lock after")]
    fn lock_without_arrival_panics() {
        orec().try_lock_after_normal_arrive(SPIN, LockMode::Write);
    }

    #[test]
    fn upgrade_from_read_lock_as_sole_reader() {
        let orec = orec();
        orec.try_lock_and_arrive(SPIN, LockMode::Read);
        assert!(orec.try_upgrade_from_read_lock(SPIN, true));
        assert_eq!(orec.state().lock_mode(), LockMode::Exclusive);
        assert_eq!(orec.state().read_lock_count(), 0);
    }

    #[test]
    fn upgrade_from_read_lock_fails_with_other_readers() {
        let orec = orec();
        orec.try_lock_and_arrive(SPIN, LockMode::Read);
        orec.try_lock_and_arrive(SPIN, LockMode::Read);
        assert!(!orec.try_upgrade_from_read_lock(SPIN, false));
        assert_eq!(orec.state().read_lock_count(), 2);
    }

    #[test]
    #[should_panic(expected = "read lock not held")]
    fn upgrade_without_read_lock_panics() {
        orec().try_upgrade_from_read_lock(SPIN, false);
    }

    #[test]
    fn upgrade_write_to_commit_lock() {
        let orec = orec();
        orec.try_lock_and_arrive(SPIN, LockMode::Write);
        orec.upgrade_write_lock_to_commit_lock();
        assert_eq!(orec.state().lock_mode(), LockMode::Exclusive);
        assert!(!orec.state().has_write_lock());
    }

    #[test]
    #[should_panic(expected = "write lock not held")]
    fn upgrade_without_write_lock_panics() {
        orec().upgrade_write_lock_to_exclusive_lock();
    }

    #[test]
    fn depart_after_reading_restores_surplus() {
        let orec = orec();
        orec.arrive(SPIN);
        orec.depart_after_reading();
        let state = orec.state();
        assert_eq!(state.surplus(), 0);
        assert_eq!(state.readonly_count(), 1);
    }

    #[test]
    #[should_panic(expected = "no surplus to depart from")]
    fn depart_without_arrive_panics() {
        orec().depart_after_reading();
    }

    #[test]
    fn read_streak_switches_to_read_biased() {
        let orec = Orec::new(3);
        for round in 0..3 {
            assert!(!orec.state().is_read_biased(), "biased too early in round {round}");
            orec.arrive(SPIN);
            orec.depart_after_reading();
        }
        let state = orec.state();
        assert!(state.is_read_biased());
        assert_eq!(state.readonly_count(), 0);
        assert_eq!(state.surplus(), 0);
    }

    #[test]
    fn read_biased_arrivals_are_not_counted() {
        let orec = read_biased_orec();
        assert_eq!(orec.arrive(SPIN), ArriveOutcome::Unregistered);
        assert_eq!(orec.state().surplus(), 1);
        for _ in 0..10 {
            assert_eq!(orec.arrive(SPIN), ArriveOutcome::Unregistered);
        }
        assert_eq!(orec.state().surplus(), 1);
    }

    #[test]
    fn update_on_read_biased_orec_signals_conflict() {
        let conflicts = GlobalConflictCounter::new();
        let orec = read_biased_orec();
        assert_eq!(orec.arrive(SPIN), ArriveOutcome::Unregistered);
        assert_eq!(
            orec.try_lock_and_arrive(SPIN, LockMode::Exclusive),
            ArriveOutcome::Unregistered
        );

        assert_eq!(orec.depart_after_update_and_unlock(&conflicts), 0);
        assert_eq!(conflicts.count(), 1);
        let state = orec.state();
        assert!(!state.is_read_biased());
        assert_eq!(state.surplus(), 0);
        assert_eq!(state.lock_mode(), LockMode::None);
    }

    #[test]
    fn update_without_readers_does_not_signal() {
        let conflicts = GlobalConflictCounter::new();
        let orec = orec();
        orec.try_lock_and_arrive(SPIN, LockMode::Exclusive);
        assert_eq!(orec.depart_after_update_and_unlock(&conflicts), 0);
        assert_eq!(conflicts.count(), 0);
        assert_eq!(orec.state(), OrecState::EMPTY);
    }

    #[test]
    fn update_with_readers_signals_once() {
        let conflicts = GlobalConflictCounter::new();
        let orec = orec();
        orec.arrive(SPIN);
        orec.arrive(SPIN);
        orec.try_lock_and_arrive(SPIN, LockMode::Exclusive);
        assert_eq!(orec.depart_after_update_and_unlock(&conflicts), 2);
        assert_eq!(conflicts.count(), 1);
        assert_eq!(orec.state().lock_mode(), LockMode::None);
    }

    #[test]
    fn depart_after_failure_and_unlock_releases_both() {
        let orec = orec();
        orec.try_lock_and_arrive(SPIN, LockMode::Write);
        assert_eq!(orec.depart_after_failure_and_unlock(), 0);
        assert_eq!(orec.state(), OrecState::EMPTY);
    }

    #[test]
    fn depart_after_failure_and_unlock_keeps_sticky_arrival() {
        let orec = read_biased_orec();
        orec.try_lock_and_arrive(SPIN, LockMode::Read);
        assert_eq!(orec.depart_after_failure_and_unlock(), 1);
        assert!(orec.state().is_read_biased());
        assert_eq!(orec.state().read_lock_count(), 0);
    }

    #[test]
    fn unlock_by_unregistered_releases_read_lock() {
        let orec = read_biased_orec();
        assert_eq!(
            orec.try_lock_and_arrive(SPIN, LockMode::Read),
            ArriveOutcome::Unregistered
        );
        orec.unlock_by_unregistered();
        assert!(!orec.state().has_any_lock());
        assert_eq!(orec.state().surplus(), 1);
    }

    #[test]
    #[should_panic(expected = "lock is held by the only arrival")]
    fn depart_after_failure_of_lock_holder_panics() {
        let orec = orec();
        orec.try_lock_and_arrive(SPIN, LockMode::Exclusive);
        orec.depart_after_failure();
    }

    #[test]
    fn concurrent_arrive_depart_conserves_surplus() {
        let orec = Arc::new(Orec::new(MAX_READ_BIASED_THRESHOLD));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let orec = Arc::clone(&orec);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        if orec.arrive(SPIN) == ArriveOutcome::Normal {
                            orec.depart_after_failure();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(orec.state().surplus(), 0);
    }

    #[test]
    fn concurrent_exclusive_locks_are_mutually_exclusive() {
        let orec = Arc::new(orec());
        let conflicts = Arc::new(GlobalConflictCounter::new());
        let holders = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let orec = Arc::clone(&orec);
                let conflicts = Arc::clone(&conflicts);
                let holders = Arc::clone(&holders);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        if orec.try_lock_and_arrive(SPIN, LockMode::Exclusive).is_arrived() {
                            assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                            holders.fetch_sub(1, Ordering::SeqCst);
                            orec.depart_after_update_and_unlock(&conflicts);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(orec.state().lock_mode(), LockMode::None);
    }

    proptest! {
        #[test]
        fn surplus_equals_arrivals_minus_departs(ops in prop::collection::vec(any::<bool>(), 0..200)) {
            let orec = Orec::new(MAX_READ_BIASED_THRESHOLD);
            let mut expected = 0u64;
            for arrive in ops {
                if arrive {
                    prop_assert_eq!(orec.arrive(SPIN), ArriveOutcome::Normal);
                    expected += 1;
                } else if expected > 0 {
                    orec.depart_after_reading();
                    expected -= 1;
                }
                prop_assert_eq!(orec.state().surplus(), expected);
            }
        }

        #[test]
        fn read_lock_count_tracks_holders(readers in 1u64..64) {
            let orec = orec();
            for _ in 0..readers {
                prop_assert!(orec.try_lock_and_arrive(SPIN, LockMode::Read).is_arrived());
            }
            prop_assert_eq!(orec.state().read_lock_count(), readers);
            for remaining in (0..readers).rev() {
                orec.depart_after_reading_and_unlock();
                prop_assert_eq!(orec.state().read_lock_count(), remaining);
            }
            prop_assert!(!orec.state().has_any_lock());
        }
    }
}
