//! Transactions
//!
//! A transaction batches writes to changeable cells and collections. Nothing
//! it stages is visible to readers until [`Transaction::commit`], which
//! validates every staged write, applies all of them, and marks the
//! transitive consumers outdated, all under the runtime's commit lock. A
//! commit either applies every write or none.
//!
//! Commit performs no recomputation. Derived cells and collections refresh
//! on their next pull, so several writes feeding the same derivation cost one
//! recomputation.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::cell::Changeable;
use crate::error::{Error, Result, TxStatus};
use crate::graph::{GraphNode, NodeCore, NodeId};
use crate::runtime::Runtime;

/// A write staged in a transaction, applied at commit.
pub(crate) trait StagedWrite: Send {
    /// Check the write against the committed state. Runs before any write of
    /// the transaction is applied.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Apply the write and return the node whose consumers must be marked,
    /// or `None` if the committed state did not change.
    fn apply(self: Box<Self>) -> Option<Arc<dyn GraphNode>>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) type StagedWrites = IndexMap<NodeId, Box<dyn StagedWrite>>;

struct TxState {
    status: TxStatus,
    staged: StagedWrites,
}

/// State shared by every handle to one transaction.
pub(crate) struct TxInner {
    id: u64,
    thread: ThreadId,
    state: Mutex<TxState>,
}

impl TxInner {
    pub(crate) fn new(thread: ThreadId) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            thread,
            state: Mutex::new(TxState {
                status: TxStatus::Open,
                staged: IndexMap::new(),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }

    pub(crate) fn status(&self) -> TxStatus {
        self.state.lock().status
    }

    /// Validate all staged writes and close the transaction.
    ///
    /// On success the transaction is committed and its writes are handed
    /// over for applying. On failure it is discarded.
    pub(crate) fn seal(&self) -> Result<StagedWrites> {
        let mut state = self.state.lock();
        if state.status != TxStatus::Open {
            return Err(Error::TransactionClosed(state.status));
        }

        if let Err(err) = state.staged.values().try_for_each(|write| write.validate()) {
            state.status = TxStatus::Discarded;
            let dropped = std::mem::take(&mut state.staged);
            drop(state);
            drop(dropped);
            tracing::debug!(tx = self.id, error = %err, "transaction rejected at commit");
            return Err(err);
        }

        state.status = TxStatus::Committed;
        Ok(std::mem::take(&mut state.staged))
    }

    /// Discard if still open. Returns true if this call discarded it.
    fn discard(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != TxStatus::Open {
            return false;
        }
        state.status = TxStatus::Discarded;
        let dropped = std::mem::take(&mut state.staged);
        drop(state);
        tracing::debug!(tx = self.id, writes = dropped.len(), "transaction discarded");
        true
    }
}

/// A handle to an open (or finished) transaction.
///
/// Created by [`Runtime::begin`]. Dropping the outermost handle of a
/// transaction that was never committed discards it, so a failing scope
/// never leaves writes staged.
pub struct Transaction {
    runtime: Runtime,
    inner: Arc<TxInner>,
    outermost: bool,
}

impl Transaction {
    pub(crate) fn new(runtime: Runtime, inner: Arc<TxInner>, outermost: bool) -> Self {
        Self {
            runtime,
            inner,
            outermost,
        }
    }

    /// Identifier shared by every handle to this transaction.
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TxStatus {
        self.inner.status()
    }

    /// True for handles returned by a `begin` inside an open transaction.
    pub fn is_nested(&self) -> bool {
        !self.outermost
    }

    /// The runtime this transaction belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Number of nodes with staged writes.
    pub fn staged_writes(&self) -> usize {
        self.inner.state.lock().staged.len()
    }

    /// Stage `value` as the new value of `cell`.
    pub fn write<T>(&self, cell: &Changeable<T>, value: T) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        cell.write(self, value)
    }

    /// Apply every staged write atomically and mark dependents outdated.
    ///
    /// On a nested handle this only checks that the transaction is still
    /// open; the outermost handle commits.
    pub fn commit(&self) -> Result<()> {
        if !self.outermost {
            return match self.status() {
                TxStatus::Open => Ok(()),
                status => Err(Error::TransactionClosed(status)),
            };
        }
        self.runtime.commit(&self.inner)
    }

    /// Drop every staged write. Discarding through a nested handle discards
    /// the whole transaction.
    pub fn discard(self) {
        self.close();
    }

    fn close(&self) {
        if self.inner.discard() {
            self.runtime.release(&self.inner);
        }
    }

    /// Run `f` on the staged write for `node`, creating it with `init` first
    /// if this transaction has not touched the node yet.
    pub(crate) fn stage<S, R>(
        &self,
        node: &NodeCore,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> Result<R>,
    ) -> Result<R>
    where
        S: StagedWrite + 'static,
    {
        if !self.runtime.ptr_eq(node.runtime()) {
            return Err(Error::ForeignRuntime);
        }

        let mut state = self.inner.state.lock();
        if state.status != TxStatus::Open {
            return Err(Error::TransactionClosed(state.status));
        }

        let write = state
            .staged
            .entry(node.id())
            .or_insert_with(|| Box::new(init()));
        let write = write
            .as_any_mut()
            .downcast_mut::<S>()
            .expect("staged write type is fixed per node");
        f(write)
    }

    /// Inspect the staged write for `node`, if any.
    pub(crate) fn peek<S, R>(&self, node: NodeId, f: impl FnOnce(Option<&S>) -> R) -> R
    where
        S: StagedWrite + 'static,
    {
        let state = self.inner.state.lock();
        let write = state
            .staged
            .get(&node)
            .and_then(|write| write.as_any().downcast_ref::<S>());
        f(write)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.outermost {
            self.close();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("nested", &self.is_nested())
            .finish()
    }
}
