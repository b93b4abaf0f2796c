//! Retry latch: the gate a retrying transaction blocks on.
//!
//! A latch is owned by one transaction and reused across its attempts. Every reset
//! starts a new *era*; registrations carry the era they were made in, so a late
//! commit touching a reference read by an earlier attempt cannot open the latch
//! for the current one.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LatchState {
    era: u64,
    open: bool,
}

/// Blocking latch with era-based reuse.
#[derive(Debug, Default)]
pub struct RetryLatch {
    state: Mutex<LatchState>,
    opened: Condvar,
}

impl RetryLatch {
    /// Creates a closed latch in era 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current era.
    #[must_use]
    pub fn era(&self) -> u64 {
        self.state.lock().era
    }

    /// Returns true if the latch is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Returns true if a registration made in `era` can no longer open the latch.
    pub(crate) fn is_stale(&self, era: u64) -> bool {
        let state = self.state.lock();
        state.era != era || state.open
    }

    /// Closes the latch and starts a new era. Returns the new era.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.era += 1;
        state.open = false;
        state.era
    }

    /// Opens the latch if it is still in `expected_era`, waking all waiters.
    pub fn open(&self, expected_era: u64) {
        let mut state = self.state.lock();
        if state.era != expected_era || state.open {
            return;
        }
        state.open = true;
        drop(state);
        self.opened.notify_all();
    }

    /// Blocks until the latch is opened in `expected_era` or a new era starts.
    pub fn await_open(&self, expected_era: u64) {
        let mut state = self.state.lock();
        while state.era == expected_era && !state.open {
            self.opened.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout`.
    ///
    /// Returns the unused part of the timeout if the latch opened, `None` if the
    /// timeout ran out first.
    pub fn await_open_for(&self, expected_era: u64, timeout: Duration) -> Option<Duration> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.era == expected_era && !state.open {
            if self.opened.wait_until(&mut state, deadline).timed_out() {
                return (state.open || state.era != expected_era)
                    .then(|| deadline.saturating_duration_since(Instant::now()));
            }
        }
        Some(deadline.saturating_duration_since(Instant::now()))
    }
}
