//! Error types for the STM engine.
//!
//! Every error returned from an operation on an active transaction has already
//! aborted that transaction, so all locks and arrivals it held are released by the
//! time the caller sees the error. Orec invariant violations are not represented
//! here: they indicate a bug in the engine and panic instead.

use crate::transaction::TransactionStatus;
use crate::types::{RefId, TransactionId};
use thiserror::Error;

/// Result type for STM operations.
pub type StmResult<T> = Result<T, StmError>;

/// Boxed error produced by a caller-supplied transform function.
pub type FunctionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while running transactions.
#[derive(Debug, Error)]
pub enum StmError {
    /// An operation was attempted on a committed or aborted transaction.
    #[error("{operation} failed: transaction {transaction} is already {status}")]
    DeadTransaction {
        /// The transaction the operation was attempted on.
        transaction: TransactionId,
        /// The operation that was attempted.
        operation: &'static str,
        /// The terminal status the transaction is in.
        status: TransactionStatus,
    },

    /// A mutating operation was attempted after the transaction was prepared.
    #[error("{operation} failed: transaction {transaction} is already prepared")]
    PreparedTransaction {
        /// The transaction the operation was attempted on.
        transaction: TransactionId,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// The version of a reference advanced, or another transaction holds an
    /// incompatible lock on it.
    #[error("read/write conflict on {reference} in transaction {transaction}")]
    ReadWriteConflict {
        /// The transaction that detected the conflict.
        transaction: TransactionId,
        /// The reference the conflict was detected on.
        reference: RefId,
    },

    /// A write, commute or construction was attempted in a readonly transaction.
    #[error("{operation} is not allowed in readonly transaction {transaction}")]
    Readonly {
        /// The readonly transaction.
        transaction: TransactionId,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// Retry was requested but there is nothing to wait on.
    #[error("retry not possible in transaction {transaction}: no tracked reads to wait on")]
    RetryNotPossible {
        /// The transaction that requested the retry.
        transaction: TransactionId,
    },

    /// Retry was requested but blocking is disabled by configuration.
    #[error("retry not allowed in transaction {transaction}: blocking is disabled")]
    RetryNotAllowed {
        /// The transaction that requested the retry.
        transaction: TransactionId,
    },

    /// Control signal: the transaction registered a retry latch and was aborted.
    ///
    /// The executor waits for one of the read references to change and then runs
    /// the transaction body again.
    #[error("retry requested by transaction {transaction}")]
    Retry {
        /// The transaction that requested the retry.
        transaction: TransactionId,
    },

    /// The speculative capacity or capability assumptions of the transaction were
    /// wrong. The executor re-runs with an upgraded transaction.
    #[error(
        "speculative configuration of transaction {transaction} too small: \
         capacity {required_capacity} required, fat {requires_fat}"
    )]
    SpeculativeConfiguration {
        /// The transaction that ran out of capacity or capability.
        transaction: TransactionId,
        /// Minimal number of tranlocal slots the next attempt needs.
        required_capacity: usize,
        /// Whether the next attempt needs a fat transaction.
        requires_fat: bool,
    },

    /// Commit was attempted on a transaction marked abort-only.
    #[error("transaction {transaction} is abort-only")]
    AbortOnly {
        /// The abort-only transaction.
        transaction: TransactionId,
    },

    /// The executor gave up after the configured number of attempts.
    #[error("transaction family '{family}' gave up after {attempts} attempts")]
    TooManyRetries {
        /// Family name of the executor.
        family: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The timeout budget ran out while waiting for a retry latch.
    #[error("transaction {transaction} timed out waiting for a change")]
    RetryTimeout {
        /// The waiting transaction.
        transaction: TransactionId,
    },

    /// An atomic operation outside a transaction could not lock the reference.
    #[error("{reference} is locked by another transaction")]
    ReferenceLocked {
        /// The locked reference.
        reference: RefId,
    },

    /// The reference belongs to a different STM instance.
    #[error("{reference} belongs to another STM instance than transaction {transaction}")]
    ForeignReference {
        /// The transaction the reference was opened in.
        transaction: TransactionId,
        /// The foreign reference.
        reference: RefId,
    },

    /// A reference was opened for construction by a transaction that did not
    /// create it, or after it was committed.
    #[error("{reference} cannot be opened for construction: {reason}")]
    IllegalConstruction {
        /// The reference.
        reference: RefId,
        /// Why construction is not possible.
        reason: &'static str,
    },

    /// A caller-supplied function failed.
    #[error("transaction function failed: {source}")]
    Function {
        /// The error the function returned.
        #[source]
        source: FunctionError,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the problem.
        message: String,
    },
}

impl StmError {
    /// Creates an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Creates a read/write conflict error.
    pub fn read_write_conflict(transaction: TransactionId, reference: RefId) -> Self {
        Self::ReadWriteConflict {
            transaction,
            reference,
        }
    }

    /// Creates a dead transaction error.
    pub fn dead_transaction(
        transaction: TransactionId,
        operation: &'static str,
        status: TransactionStatus,
    ) -> Self {
        Self::DeadTransaction {
            transaction,
            operation,
            status,
        }
    }

    /// Creates a function error from anything convertible to a boxed error.
    pub fn function(source: impl Into<FunctionError>) -> Self {
        Self::Function {
            source: source.into(),
        }
    }

    /// Returns true if the error is a read/write conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ReadWriteConflict { .. })
    }

    /// Returns true if the error is a control signal for the executor rather than a
    /// failure of the transaction body.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Self::Retry { .. } | Self::SpeculativeConfiguration { .. }
        )
    }

    /// Returns true if running the transaction again may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ReadWriteConflict { .. }
                | Self::Retry { .. }
                | Self::SpeculativeConfiguration { .. }
                | Self::ReferenceLocked { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_recoverable() {
        let err = StmError::read_write_conflict(TransactionId::new(3), RefId::new(7));
        assert!(err.is_conflict());
        assert!(err.is_recoverable());
        assert!(!err.is_control_flow());
        assert_eq!(err.to_string(), "read/write conflict on ref:7 in transaction txn:3");
    }

    #[test]
    fn retry_is_control_flow() {
        let err = StmError::Retry {
            transaction: TransactionId::new(1),
        };
        assert!(err.is_control_flow());
        assert!(err.is_recoverable());
    }

    #[test]
    fn dead_transaction_is_not_recoverable() {
        let err = StmError::dead_transaction(
            TransactionId::new(2),
            "open_for_read",
            TransactionStatus::Committed,
        );
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "open_for_read failed: transaction txn:2 is already committed"
        );
    }

    #[test]
    fn function_error_keeps_source() {
        let err = StmError::function("balance would go negative");
        assert_eq!(
            err.to_string(),
            "transaction function failed: balance would go negative"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
