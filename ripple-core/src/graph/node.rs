//! Graph Nodes
//!
//! This module defines the state every node in the dependency graph carries,
//! regardless of whether it is a scalar cell or a collection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::runtime::Runtime;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// An externally writable scalar. Roots of the graph.
    Changeable,

    /// A scalar derived from other nodes, cached and lazily refreshed.
    Adaptive,

    /// An externally writable collection.
    ChangeableCollection,

    /// A collection maintained by a combinator over other collections.
    DerivedCollection,
}

impl NodeKind {
    /// Source nodes are only changed by transactions, never recomputed.
    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::Changeable | NodeKind::ChangeableCollection)
    }
}

/// Anything that lives in the dependency graph.
pub(crate) trait GraphNode: Send + Sync {
    fn core(&self) -> &NodeCore;

    /// Recompute the node if it is outdated. Sources are always current.
    fn bring_up_to_date(self: Arc<Self>) -> Result<()> {
        Ok(())
    }
}

/// An edge from a consumer to one of its producers.
pub(crate) struct ProducerEdge {
    /// Owning reference: a consumer keeps what it reads alive.
    pub(crate) node: Arc<dyn GraphNode>,
    /// Added through [`Runtime::connect`]; survives recomputation.
    pub(crate) declared: bool,
    /// Observed during the latest recomputation.
    pub(crate) tracked: bool,
}

/// Both directions of a node's edges.
#[derive(Default)]
pub(crate) struct Edges {
    pub(crate) producers: IndexMap<NodeId, ProducerEdge>,
    /// Non-owning back-references; released consumers are pruned lazily.
    pub(crate) consumers: IndexMap<NodeId, Weak<dyn GraphNode>>,
}

/// State shared by every node kind.
pub(crate) struct NodeCore {
    id: NodeId,
    kind: NodeKind,
    runtime: Runtime,
    outdated: AtomicBool,
    pub(crate) edges: Mutex<Edges>,
}

impl NodeCore {
    pub(crate) fn new(runtime: &Runtime, kind: NodeKind) -> Self {
        Self {
            id: NodeId::next(),
            kind,
            runtime: runtime.clone(),
            // Derived nodes start outdated so the first pull computes them.
            outdated: AtomicBool::new(!kind.is_source()),
            edges: Mutex::new(Edges::default()),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn is_outdated(&self) -> bool {
        self.outdated.load(Ordering::Acquire)
    }

    /// Set the flag, returning true if it was previously clear.
    pub(crate) fn mark_outdated(&self) -> bool {
        !self.outdated.swap(true, Ordering::AcqRel)
    }

    /// Clear the flag, returning true if it was set.
    pub(crate) fn take_outdated(&self) -> bool {
        self.outdated.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn producer_ids(&self) -> Vec<NodeId> {
        self.edges.lock().producers.keys().copied().collect()
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        let producers = std::mem::take(&mut self.edges.get_mut().producers);
        for (_, edge) in producers {
            edge.node
                .core()
                .edges
                .lock()
                .consumers
                .swap_remove(&self.id);
        }
    }
}

/// A type-erased, owning handle to a graph node.
///
/// Used to inspect the graph and to declare edges with
/// [`Runtime::connect`].
#[derive(Clone)]
pub struct NodeRef(pub(crate) Arc<dyn GraphNode>);

impl NodeRef {
    /// The node's identifier.
    pub fn id(&self) -> NodeId {
        self.0.core().id()
    }

    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        self.0.core().kind()
    }

    /// Whether the node's cached state may be stale.
    pub fn is_outdated(&self) -> bool {
        self.0.core().is_outdated()
    }

    /// The nodes this node currently reads.
    pub fn producers(&self) -> Vec<NodeId> {
        self.0.core().producer_ids()
    }

    /// The nodes currently reading this node that are still alive.
    pub fn consumers(&self) -> Vec<NodeId> {
        super::mark::live_consumers(&self.0)
            .iter()
            .map(|node| node.core().id())
            .collect()
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("outdated", &self.is_outdated())
            .finish()
    }
}

/// Implemented by every handle that wraps a graph node.
pub trait AsNode {
    /// A type-erased handle to the underlying node.
    fn node(&self) -> NodeRef;
}

impl AsNode for NodeRef {
    fn node(&self) -> NodeRef {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare(NodeCore);

    impl GraphNode for Bare {
        fn core(&self) -> &NodeCore {
            &self.0
        }
    }

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::next();
        let id2 = NodeId::next();
        assert_ne!(id1, id2);
        assert!(id2 > id1);
    }

    #[test]
    fn sources_start_fresh_and_derived_nodes_start_outdated() {
        let rt = Runtime::new();
        let source = NodeCore::new(&rt, NodeKind::Changeable);
        let derived = NodeCore::new(&rt, NodeKind::Adaptive);

        assert!(!source.is_outdated());
        assert!(derived.is_outdated());
    }

    #[test]
    fn outdated_flag_transitions() {
        let rt = Runtime::new();
        let core = NodeCore::new(&rt, NodeKind::Adaptive);

        assert!(core.take_outdated());
        assert!(!core.is_outdated());
        assert!(!core.take_outdated());

        assert!(core.mark_outdated());
        assert!(!core.mark_outdated());
        assert!(core.is_outdated());
    }

    #[test]
    fn dropping_a_consumer_removes_its_back_reference() {
        let rt = Runtime::new();
        let producer: Arc<dyn GraphNode> = Arc::new(Bare(NodeCore::new(&rt, NodeKind::Changeable)));
        let consumer: Arc<dyn GraphNode> = Arc::new(Bare(NodeCore::new(&rt, NodeKind::Adaptive)));

        super::super::edges::connect(&consumer, &producer, true).unwrap();
        assert_eq!(producer.core().edges.lock().consumers.len(), 1);

        drop(consumer);
        assert!(producer.core().edges.lock().consumers.is_empty());
    }

    #[test]
    fn node_ref_reports_edges() {
        let rt = Runtime::new();
        let producer: Arc<dyn GraphNode> = Arc::new(Bare(NodeCore::new(&rt, NodeKind::Changeable)));
        let consumer: Arc<dyn GraphNode> = Arc::new(Bare(NodeCore::new(&rt, NodeKind::Adaptive)));
        super::super::edges::connect(&consumer, &producer, true).unwrap();

        let p = NodeRef(producer.clone());
        let c = NodeRef(consumer.clone());
        assert_eq!(c.producers(), vec![p.id()]);
        assert_eq!(p.consumers(), vec![c.id()]);
        assert_eq!(c.kind(), NodeKind::Adaptive);
    }
}
