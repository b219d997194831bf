//! Runtime
//!
//! The runtime is the central coordinator shared by every node it creates.
//! It owns no nodes. It holds only the state that must be global to one
//! graph:
//!
//! - the commit lock, so only one transaction validates, applies and marks at
//!   a time
//! - the shape lock, taken exclusively while a commit applies writes and marks
//!   dependents, and shared by every pull, so a pull never observes a
//!   half-applied transaction and edges never change under a mark
//! - a commit revision counter
//! - the registry of transactions open on each thread
//!
//! # Thread Safety
//!
//! `Runtime` is a cheap `Arc` handle and is `Send + Sync`. Pulls on different
//! threads proceed in parallel; a commit waits for in-flight pulls to finish
//! and blocks new ones while it runs. Commits never run derivations, so that
//! window stays short.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::cell::TrackingContext;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result, TxStatus};
use crate::graph::{edges, mark, AsNode, GraphNode};
use crate::transaction::{Transaction, TxInner};

struct RuntimeInner {
    config: RuntimeConfig,
    commit_lock: Mutex<()>,
    shape: RwLock<()>,
    revision: AtomicU64,
    open: DashMap<ThreadId, Arc<TxInner>>,
}

/// Handle to one dependency graph and its transaction coordinator.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                commit_lock: Mutex::new(()),
                shape: RwLock::new(()),
                revision: AtomicU64::new(0),
                open: DashMap::new(),
            }),
        }
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Number of transactions committed so far.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::Acquire)
    }

    /// Open a transaction on the calling thread.
    ///
    /// If a transaction is already open on this thread, the returned handle
    /// refers to that same transaction: writes staged through it accumulate
    /// in the outer transaction and its [`commit`](Transaction::commit) does
    /// nothing. Only the outermost handle commits.
    pub fn begin(&self) -> Transaction {
        if let Some(tx) = self.current_transaction() {
            return tx;
        }

        let thread = thread::current().id();
        let inner = Arc::new(TxInner::new(thread));
        self.inner.open.insert(thread, inner.clone());
        tracing::trace!(tx = inner.id(), "transaction opened");
        Transaction::new(self.clone(), inner, true)
    }

    /// The transaction open on the calling thread, as a nested handle.
    pub fn current_transaction(&self) -> Option<Transaction> {
        let thread = thread::current().id();
        let existing = self.inner.open.get(&thread).map(|entry| entry.value().clone());
        existing
            .filter(|inner| inner.status() == TxStatus::Open)
            .map(|inner| Transaction::new(self.clone(), inner, false))
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits if `f` succeeds and discards the staged writes if it fails.
    /// Called inside another transaction, the writes join the outer one, and
    /// a failure discards the outer transaction as well.
    pub fn transact<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        let tx = self.begin();
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.discard();
                Err(err)
            }
        }
    }

    /// Declare that `consumer` reads `producer`.
    ///
    /// Declared edges persist across recomputations, unlike the edges
    /// recorded from reads during a derivation. The consumer is marked
    /// outdated since its cached value did not account for the new input.
    /// Fails with [`Error::Cycle`] if `producer` already depends on
    /// `consumer`.
    pub fn connect(&self, consumer: &impl AsNode, producer: &impl AsNode) -> Result<()> {
        if TrackingContext::is_active() {
            return Err(Error::CommitInsideDerivation);
        }
        let consumer = consumer.node().0;
        let producer = producer.node().0;
        self.check_owner(&consumer)?;
        self.check_owner(&producer)?;

        let _shape = self.inner.shape.write();
        edges::connect(&consumer, &producer, true)?;
        mark::mark_outdated(&consumer);
        Ok(())
    }

    /// Remove an edge previously added with [`connect`](Self::connect).
    ///
    /// Returns false if no such declared edge existed. Edges recorded by the
    /// consumer's own recomputation are left alone.
    pub fn disconnect(&self, consumer: &impl AsNode, producer: &impl AsNode) -> Result<bool> {
        if TrackingContext::is_active() {
            return Err(Error::CommitInsideDerivation);
        }
        let consumer = consumer.node().0;
        let producer = producer.node();
        self.check_owner(&consumer)?;

        let _shape = self.inner.shape.write();
        Ok(edges::disconnect_declared(&consumer, producer.id()))
    }

    /// Returns true if both handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn check_owner(&self, node: &Arc<dyn GraphNode>) -> Result<()> {
        if self.ptr_eq(node.core().runtime()) {
            Ok(())
        } else {
            Err(Error::ForeignRuntime)
        }
    }

    /// Shared access to the graph shape for the duration of a pull.
    ///
    /// Recursive so nested pulls on one thread never queue behind a waiting
    /// commit.
    pub(crate) fn shape_read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.shape.read_recursive()
    }

    /// Validate, apply and mark. Called by the outermost transaction handle.
    pub(crate) fn commit(&self, tx: &TxInner) -> Result<()> {
        if TrackingContext::is_active() {
            return Err(Error::CommitInsideDerivation);
        }

        let _serial = self.inner.commit_lock.lock();

        let staged = match tx.seal() {
            Ok(staged) => staged,
            Err(err) => {
                self.release(tx);
                return Err(err);
            }
        };
        self.release(tx);

        let writes = staged.len();
        let (revision, marked) = {
            let _shape = self.inner.shape.write();
            let revision = self.inner.revision.fetch_add(1, Ordering::AcqRel) + 1;

            let written: Vec<Arc<dyn GraphNode>> =
                staged.into_values().filter_map(|write| write.apply()).collect();
            let marked: usize = written.iter().map(mark::mark_consumers).sum();
            (revision, marked)
        };

        tracing::debug!(tx = tx.id(), revision, writes, marked, "transaction committed");
        Ok(())
    }

    /// Drop the thread binding of a finished transaction.
    pub(crate) fn release(&self, tx: &TxInner) {
        self.inner
            .open
            .remove_if(&tx.thread(), |_, open| open.id() == tx.id());
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("revision", &self.revision())
            .field("open_transactions", &self.inner.open.len())
            .finish()
    }
}
