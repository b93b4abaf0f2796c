//! Per-reference chain of retry latches waiting for the next write.
//!
//! The chain sits behind a short `parking_lot::Mutex` outside the orec protocol; it
//! is taken only to prepend or detach nodes, never while spinning on an orec.

use crate::latch::RetryLatch;
use parking_lot::Mutex;
use std::sync::Arc;

struct ListenerNode {
    latch: Arc<RetryLatch>,
    era: u64,
    next: Option<Box<ListenerNode>>,
}

/// Outcome of registering a retry latch on a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// The latch was added to the chain and will be opened by the next write.
    Done,
    /// The reference already changed; the latch was opened right away.
    NotNeeded,
    /// The tranlocal has no committed snapshot to wait on.
    None,
}

/// Chain length below which registration never scans for stale nodes.
const MIN_PRUNE_LEN: usize = 16;

#[derive(Default)]
struct Chain {
    head: Option<Box<ListenerNode>>,
    len: usize,
    prune_at: usize,
}

impl Chain {
    /// Unlinks nodes whose latch was opened or moved to a later era.
    ///
    /// Waiters that timed out or were dropped leave such nodes behind; nothing
    /// would ever open them again.
    fn prune_stale(&mut self) {
        let mut live = Vec::new();
        let mut node = self.head.take();
        while let Some(mut current) = node {
            node = current.next.take();
            if !current.latch.is_stale(current.era) {
                live.push(current);
            }
        }
        self.len = live.len();
        for mut current in live.into_iter().rev() {
            current.next = self.head.take();
            self.head = Some(current);
        }
        self.prune_at = (self.len * 2).max(MIN_PRUNE_LEN);
    }
}

/// Singly linked chain of waiting latches, newest first.
///
/// The head is guarded by a mutex held only to prepend one node or to detach the
/// whole chain. A registration that finds the chain twice as long as after the
/// last pruning first drops the stale nodes, so abandoned waits stay bounded.
#[derive(Default)]
pub(crate) struct Listeners {
    chain: Mutex<Chain>,
}

impl Listeners {
    /// Prepends a node if `still_current` holds while the chain is locked.
    ///
    /// A writer publishes its version before detaching the chain, so a check done
    /// under the chain lock either sees the new version or leaves a node the writer
    /// will find.
    pub(crate) fn register_if(
        &self,
        latch: &Arc<RetryLatch>,
        era: u64,
        still_current: impl FnOnce() -> bool,
    ) -> bool {
        let mut chain = self.chain.lock();
        if !still_current() {
            return false;
        }
        if chain.len >= chain.prune_at {
            chain.prune_stale();
        }
        let next = chain.head.take();
        chain.head = Some(Box::new(ListenerNode {
            latch: Arc::clone(latch),
            era,
            next,
        }));
        chain.len += 1;
        true
    }

    /// Detaches the whole chain.
    pub(crate) fn take(&self) -> ListenerChain {
        let mut chain = self.chain.lock();
        chain.len = 0;
        ListenerChain(chain.head.take())
    }

    /// Returns the number of waiting latches.
    pub(crate) fn len(&self) -> usize {
        self.chain.lock().len
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        drop(ListenerChain(self.chain.get_mut().head.take()));
    }
}

/// A detached chain of latches.
#[must_use = "a detached chain must be opened or its waiters sleep until timeout"]
pub(crate) struct ListenerChain(Option<Box<ListenerNode>>);

impl ListenerChain {
    /// An empty chain.
    pub(crate) const EMPTY: Self = Self(None);

    /// Returns true if the chain holds no latches.
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Opens every latch in the chain for the era it registered in.
    pub(crate) fn open_all(mut self) {
        let mut node = self.0.take();
        while let Some(mut current) = node {
            current.latch.open(current.era);
            node = current.next.take();
        }
    }
}

impl Drop for ListenerChain {
    fn drop(&mut self) {
        // Unlink iteratively so long chains cannot overflow the stack.
        let mut node = self.0.take();
        while let Some(mut current) = node {
            node = current.next.take();
        }
    }
}
