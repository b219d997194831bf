//! Tracking Context
//!
//! The tracking context records which nodes a running derivation reads.
//! When a cell or collection is read, the node is appended to the innermost
//! context's read set; when the derivation finishes, the read set becomes the
//! node's tracked producers.
//!
//! # Implementation
//!
//! Each thread keeps a stack of contexts. Running a derivation pushes an
//! entry, and the guard returned by [`TrackingContext::enter`] pops it on
//! drop, including during unwinding. Nested derivations (an adaptive cell
//! forcing another) push nested entries, so each one sees only its own reads.
//!
//! The stack also answers "is this node already being computed on this
//! thread?", which turns a dynamic self-dependency into [`Error::Cycle`]
//! instead of a deadlock on the node's compute mutex.
//!
//! [`Error::Cycle`]: crate::Error::Cycle

use std::cell::RefCell;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::graph::{GraphNode, NodeId};

type Reads = SmallVec<[Arc<dyn GraphNode>; 4]>;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = RefCell::new(Vec::new());
}

struct ContextEntry {
    /// The node being computed, or `None` inside [`untracked`].
    node: Option<NodeId>,
    reads: Reads,
}

/// Guard for one entry of the thread's tracking stack.
pub(crate) struct TrackingContext {
    node: Option<NodeId>,
}

impl TrackingContext {
    /// Start recording reads on behalf of `node`.
    pub(crate) fn enter(node: NodeId) -> Self {
        Self::push(Some(node))
    }

    fn push(node: Option<NodeId>) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                node,
                reads: SmallVec::new(),
            });
        });
        Self { node }
    }

    /// Returns true if a derivation is running on this thread.
    pub(crate) fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| stack.borrow().iter().any(|entry| entry.node.is_some()))
    }

    /// The innermost node being computed on this thread.
    pub(crate) fn current() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().iter().rev().find_map(|entry| entry.node))
    }

    /// Returns true if `node` is on this thread's stack, i.e. reading it now
    /// would read a value that is still being computed.
    pub(crate) fn is_computing(node: NodeId) -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .any(|entry| entry.node == Some(node))
        })
    }

    /// Record a read of `node` in the innermost context, if any.
    pub(crate) fn track(node: &Arc<dyn GraphNode>) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let Some(entry) = stack.last_mut() else {
                return;
            };
            if entry.node.is_none() {
                return;
            }
            let id = node.core().id();
            if !entry.reads.iter().any(|read| read.core().id() == id) {
                entry.reads.push(node.clone());
            }
        });
    }

    /// Take the reads recorded so far in this context.
    pub(crate) fn take_reads(&self) -> Reads {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last_mut() {
                Some(entry) => {
                    debug_assert_eq!(entry.node, self.node, "tracking context mismatch");
                    std::mem::take(&mut entry.reads)
                }
                None => SmallVec::new(),
            }
        })
    }
}

impl Drop for TrackingContext {
    fn drop(&mut self) {
        let popped = CONTEXT_STACK.with(|stack| stack.borrow_mut().pop());
        if let Some(entry) = &popped {
            debug_assert_eq!(
                entry.node, self.node,
                "TrackingContext mismatch: expected {:?}, got {:?}",
                self.node, entry.node
            );
        }
        // Reads are released outside the thread-local borrow.
        drop(popped);
    }
}

/// Run `f` without recording its reads as dependencies of the enclosing
/// derivation.
///
/// ```
/// use ripple_core::{untracked, Adaptive, Runtime};
///
/// let rt = Runtime::new();
/// let input = rt.changeable(1);
/// let hint = rt.changeable(100);
///
/// let a = {
///     let (input, hint) = (input.clone(), hint.clone());
///     Adaptive::new(&rt, move || input.get() + untracked(|| hint.get()))
/// };
/// assert_eq!(a.force().unwrap(), 101);
///
/// // `hint` is not a producer, so writing it leaves `a` up to date.
/// rt.transact(|tx| hint.write(tx, 0)).unwrap();
/// assert!(!a.is_outdated());
/// ```
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = TrackingContext::push(None);
    f()
}
