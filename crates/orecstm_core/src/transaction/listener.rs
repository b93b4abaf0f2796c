//! Transaction lifecycle listeners.

use super::Transaction;
use std::fmt;
use std::sync::Arc;

/// Lifecycle points a [`TransactionListener`] is notified of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionEvent {
    /// Before the commit locks are taken.
    PrePrepare,
    /// After all writes were published.
    PostCommit,
    /// After the transaction released everything it held.
    PostAbort,
}

/// Callback notified at lifecycle points of a transaction.
pub trait TransactionListener: Send + Sync {
    /// Called with the transaction at `event`.
    fn notify(&self, transaction: &Transaction, event: TransactionEvent);
}

/// A list of shared listeners.
#[derive(Default, Clone)]
pub struct ListenerList(Vec<Arc<dyn TransactionListener>>);

impl ListenerList {
    /// Appends a listener.
    pub fn push(&mut self, listener: Arc<dyn TransactionListener>) {
        self.0.push(listener);
    }

    /// Iterates over the listeners in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TransactionListener>> {
        self.0.iter()
    }

    /// Returns the number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no listeners.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ListenerList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerList")
            .field("len", &self.0.len())
            .finish()
    }
}
