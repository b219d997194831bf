//! Changeable Cells
//!
//! A changeable cell is a root of the graph: it holds one value that only a
//! transaction can replace.
//!
//! # Example
//!
//! ```
//! use ripple_core::Runtime;
//!
//! let rt = Runtime::new();
//! let count = rt.changeable(0);
//!
//! let tx = rt.begin();
//! count.write(&tx, 1).unwrap();
//! count.update(&tx, |n| n + 1).unwrap();
//! assert_eq!(count.read_in(&tx), 2);
//! assert_eq!(count.get(), 0);
//!
//! tx.commit().unwrap();
//! assert_eq!(count.get(), 2);
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::TrackingContext;
use crate::error::{Error, Result};
use crate::graph::{AsNode, GraphNode, NodeCore, NodeId, NodeKind, NodeRef};
use crate::runtime::Runtime;
use crate::transaction::{StagedWrite, Transaction};

pub(crate) struct ChangeableNode<T> {
    core: NodeCore,
    value: RwLock<T>,
}

impl<T> GraphNode for ChangeableNode<T>
where
    T: Send + Sync + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }
}

/// Last write wins.
struct StagedValue<T> {
    node: Arc<ChangeableNode<T>>,
    value: Option<T>,
}

impl<T> StagedWrite for StagedValue<T>
where
    T: Send + Sync + 'static,
{
    fn apply(self: Box<Self>) -> Option<Arc<dyn GraphNode>> {
        let StagedValue { node, value } = *self;
        *node.value.write() = value?;
        Some(node)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A value that changes only through transactions.
pub struct Changeable<T> {
    node: Arc<ChangeableNode<T>>,
}

impl<T> Changeable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(runtime: &Runtime, initial: T) -> Self {
        Self {
            node: Arc::new(ChangeableNode {
                core: NodeCore::new(runtime, NodeKind::Changeable),
                value: RwLock::new(initial),
            }),
        }
    }

    /// The cell's node identifier.
    pub fn id(&self) -> NodeId {
        self.node.core.id()
    }

    /// The runtime that owns this cell.
    pub fn runtime(&self) -> &Runtime {
        self.node.core.runtime()
    }

    /// The committed value.
    ///
    /// Inside a derivation the read is recorded as a dependency.
    pub fn get(&self) -> T {
        TrackingContext::track(&self.erased());
        let _shape = self.node.core.runtime().shape_read();
        self.node.value.read().clone()
    }

    /// The value as seen from inside `tx`: the staged value if `tx` wrote
    /// this cell, otherwise the committed value. Never tracked.
    pub fn read_in(&self, tx: &Transaction) -> T {
        tx.peek::<StagedValue<T>, _>(self.id(), |staged| {
            staged.and_then(|staged| staged.value.clone())
        })
        .unwrap_or_else(|| self.node.value.read().clone())
    }

    /// Stage `value` as this cell's new value in `tx`.
    pub fn write(&self, tx: &Transaction, value: T) -> Result<()> {
        let mut value = Some(value);
        tx.stage(
            &self.node.core,
            || StagedValue {
                node: self.node.clone(),
                value: None,
            },
            |staged: &mut StagedValue<T>| {
                staged.value = value.take();
                Ok(())
            },
        )
    }

    /// Stage `f` applied to the value as seen from inside `tx`.
    pub fn update(&self, tx: &Transaction, f: impl FnOnce(&T) -> T) -> Result<()> {
        let current = self.read_in(tx);
        self.write(tx, f(&current))
    }

    /// Stage `value` in the transaction open on the calling thread.
    pub fn set(&self, value: T) -> Result<()> {
        let tx = self
            .runtime()
            .current_transaction()
            .ok_or(Error::NoTransaction)?;
        self.write(&tx, value)
    }

    fn erased(&self) -> Arc<dyn GraphNode> {
        self.node.clone()
    }
}

impl Runtime {
    /// Create a changeable cell holding `initial`.
    pub fn changeable<T>(&self, initial: T) -> Changeable<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        Changeable::new(self, initial)
    }
}

impl<T> Clone for Changeable<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> AsNode for Changeable<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node(&self) -> NodeRef {
        NodeRef(self.erased())
    }
}

impl<T> fmt::Debug for Changeable<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changeable")
            .field("id", &self.node.core.id())
            .field("value", &*self.node.value.read())
            .finish()
    }
}

/// A handle whose current value can be read, recording a dependency when
/// read inside a derivation.
///
/// Implemented by [`Changeable`] and [`Adaptive`](super::Adaptive); used by
/// the `map` constructors of adaptive cells.
pub trait Readable: AsNode + Clone + Send + Sync + 'static {
    /// The type of value read.
    type Value;

    /// The current value, bringing it up to date first if necessary.
    fn read(&self) -> Result<Self::Value>;
}

impl<T> Readable for Changeable<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn read(&self) -> Result<T> {
        Ok(self.get())
    }
}
