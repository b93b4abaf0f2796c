//! Transaction status.

use std::fmt;

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Transaction is active and can perform operations.
    Active,
    /// Commit locks are held; only commit or abort may follow.
    Prepared,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

impl TransactionStatus {
    /// Returns true if the transaction can still commit or abort.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Active | Self::Prepared)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Prepared => "prepared",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_statuses() {
        assert!(TransactionStatus::Active.is_alive());
        assert!(TransactionStatus::Prepared.is_alive());
        assert!(!TransactionStatus::Committed.is_alive());
        assert!(!TransactionStatus::Aborted.is_alive());
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(TransactionStatus::Prepared.to_string(), "prepared");
        assert_eq!(TransactionStatus::Aborted.to_string(), "aborted");
    }
}
