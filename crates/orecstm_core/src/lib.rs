//! # orecstm Core
//!
//! Software transactional memory built on ownership records (orecs).
//!
//! This crate provides:
//! - Orecs: one packed atomic word per reference holding its lock, arrival and
//!   read-bias state
//! - Transactional references with optimistic reads and buffered writes
//! - Incremental read validation driven by a global conflict counter
//! - Commuting updates, pessimistic lock levels and serializable isolation
//! - Blocking retry that sleeps until a read reference changes
//! - An executor that re-runs transactions and learns their size
//!
//! ## Usage
//!
//! ```
//! use orecstm_core::{Stm, StmResult};
//!
//! let stm = Stm::new();
//! let stock = stm.new_ref(3_u32);
//!
//! let taken: StmResult<u32> = stm.atomic(|tx| {
//!     let available = stock.get(tx)?;
//!     stock.set(tx, available - 1)?;
//!     Ok(available)
//! });
//!
//! assert_eq!(taken.unwrap(), 3);
//! assert_eq!(stock.atomic_get().unwrap(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod config;
mod conflict;
mod error;
mod executor;
mod latch;
mod listeners;
mod object;
pub mod orec;
mod speculative;
mod stm;
mod tranlocal;
mod transaction;
mod txn_ref;
mod types;

pub use backoff::BackoffPolicy;
pub use config::{
    IsolationLevel, LockLevel, StmConfig, TransactionConfig, DEFAULT_MAX_FIXED_CAPACITY,
    DEFAULT_MAX_RETRIES, DEFAULT_SPIN_COUNT,
};
pub use conflict::{GlobalConflictCounter, LocalConflictCounter};
pub use error::{FunctionError, StmError, StmResult};
pub use executor::TransactionExecutor;
pub use latch::RetryLatch;
pub use orec::{ArriveOutcome, Orec, OrecState};
pub use speculative::SpeculativeConfig;
pub use stm::Stm;
pub use tranlocal::{Tranlocal, TranlocalMode};
pub use transaction::{
    ListenerList, StorageKind, Transaction, TransactionEvent, TransactionListener,
    TransactionStatus,
};
pub use txn_ref::{TxnRef, Value};
pub use types::{LockMode, RefId, TransactionId};
