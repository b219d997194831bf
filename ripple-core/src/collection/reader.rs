//! Collection readers.

use std::fmt;
use std::sync::Arc;

use super::delta::Delta;
use super::history::ReaderId;
use super::node::CollectionNode;
use crate::cell::TrackingContext;
use crate::error::Result;
use crate::graph::{GraphNode, NodeId};

/// A cursor into one collection's delta history.
///
/// Created by [`Collection::subscribe`](super::Collection::subscribe).
/// Dropping the reader unsubscribes it.
pub struct Reader<D: Delta> {
    node: Arc<CollectionNode<D>>,
    id: ReaderId,
}

impl<D: Delta> Reader<D> {
    pub(crate) fn new(node: Arc<CollectionNode<D>>, id: ReaderId) -> Self {
        Self { node, id }
    }

    /// The collection this reader follows.
    pub fn collection_id(&self) -> NodeId {
        self.node.core().id()
    }

    /// Bring the collection up to date and take every delta this reader has
    /// not seen yet.
    ///
    /// The first pull returns the content as additions. A pull with no
    /// change since the previous one returns an empty vector. Inside a
    /// derivation the read is recorded as a dependency.
    pub fn pull(&self) -> Result<Vec<D>> {
        let erased: Arc<dyn GraphNode> = self.node.clone();
        TrackingContext::track(&erased);

        let _shape = self.node.core().runtime().shape_read();
        self.node.refresh()?;

        let mut state = self.node.state.write();
        let state = &mut *state;
        Ok(state.history.drain(self.id, &state.content))
    }

    /// Deltas already logged for this reader. Changes a derived collection
    /// has not processed yet are not counted.
    pub fn pending(&self) -> usize {
        self.node.state.read().history.pending(self.id)
    }

    /// Forget what this reader has seen. The next pull returns the whole
    /// content as additions again.
    pub(crate) fn rewind(&self) {
        self.node.state.write().history.rewind(self.id);
    }

    /// Stop following the collection. Same as dropping the reader.
    pub fn unsubscribe(self) {}
}

impl<D: Delta> Drop for Reader<D> {
    fn drop(&mut self) {
        self.node.state.write().history.unregister(self.id);
        tracing::trace!(node = %self.node.core().id(), reader = self.id, "reader unsubscribed");
    }
}

impl<D: Delta> fmt::Debug for Reader<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("collection", &self.collection_id())
            .field("id", &self.id)
            .field("pending", &self.pending())
            .finish()
    }
}
