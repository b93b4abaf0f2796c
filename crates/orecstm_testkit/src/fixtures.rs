//! Test fixtures and engine helpers.
//!
//! Provides convenience functions for setting up STM instances and common test
//! scenarios.

use orecstm_core::{
    Stm, StmConfig, StmResult, Transaction, TransactionEvent, TransactionId, TransactionListener,
    TxnRef,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Installs a tracing subscriber that writes through the test harness.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Calling it more than
/// once is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Creates an STM whose references become read-biased after `threshold`
/// consecutive read-only departs.
pub fn stm_with_threshold(threshold: u32) -> Stm {
    Stm::with_config(StmConfig::new().read_biased_threshold(threshold))
        .expect("Invalid read-biased threshold")
}

/// A fixed set of account balances that transfers move money between.
///
/// The total of all balances never changes, which makes it a cheap invariant to
/// check after concurrent runs.
#[derive(Debug, Clone)]
pub struct Bank {
    stm: Stm,
    accounts: Vec<TxnRef<i64>>,
    initial_balance: i64,
}

impl Bank {
    /// Creates `count` accounts holding `initial_balance` each on a fresh STM.
    pub fn new(count: usize, initial_balance: i64) -> Self {
        Self::with_stm(Stm::new(), count, initial_balance)
    }

    /// Creates `count` accounts holding `initial_balance` each on `stm`.
    pub fn with_stm(stm: Stm, count: usize, initial_balance: i64) -> Self {
        let accounts = (0..count).map(|_| stm.new_ref(initial_balance)).collect();
        Self {
            stm,
            accounts,
            initial_balance,
        }
    }

    /// Returns the STM the accounts live in.
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Returns all accounts.
    pub fn accounts(&self) -> &[TxnRef<i64>] {
        &self.accounts
    }

    /// Returns the account at `index`.
    pub fn account(&self, index: usize) -> &TxnRef<i64> {
        &self.accounts[index]
    }

    /// Returns the number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Returns true if the bank has no accounts.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Moves `amount` from account `from` to account `to` inside `tx`.
    pub fn transfer(&self, tx: &mut Transaction, from: usize, to: usize, amount: i64) -> StmResult<()> {
        if from == to {
            return Ok(());
        }
        self.accounts[from].increment(tx, -amount)?;
        self.accounts[to].increment(tx, amount)?;
        Ok(())
    }

    /// Sums all balances inside `tx`.
    pub fn total(&self, tx: &mut Transaction) -> StmResult<i64> {
        let mut total = 0;
        for account in &self.accounts {
            total += account.get(tx)?;
        }
        Ok(total)
    }

    /// Sums all balances in a transaction of its own.
    pub fn atomic_total(&self) -> i64 {
        self.stm
            .atomic(|tx| self.total(tx))
            .expect("Failed to sum balances")
    }

    /// Returns the total the bank started with.
    pub fn expected_total(&self) -> i64 {
        self.initial_balance * self.accounts.len() as i64
    }
}

/// A listener that records every event it is notified of.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(TransactionId, TransactionEvent)>>,
}

impl RecordingListener {
    /// Creates an empty listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events in order.
    pub fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().iter().map(|(_, event)| *event).collect()
    }

    /// Returns the recorded events together with the transaction they came from.
    pub fn entries(&self) -> Vec<(TransactionId, TransactionEvent)> {
        self.events.lock().clone()
    }

    /// Returns how many times `event` was recorded.
    pub fn count(&self, event: TransactionEvent) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(_, recorded)| *recorded == event)
            .count()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TransactionListener for RecordingListener {
    fn notify(&self, transaction: &Transaction, event: TransactionEvent) {
        self.events.lock().push((transaction.id(), event));
    }
}
