//! Mark Phase
//!
//! Marking walks from a node to its transitive consumers and sets their
//! outdated flags. A node that is already outdated has outdated consumers:
//! every mark continues to the consumers, and a node only becomes current
//! after its producers have (tracked producers are read by the derivation,
//! declared ones are brought up to date before it runs). So the walk stops
//! there. Each call costs time proportional to the nodes it newly marks,
//! not to the size of the graph.

use std::sync::Arc;

use super::node::GraphNode;

/// Consumers of `node` that are still alive. Released back-references are
/// pruned as a side effect.
pub(crate) fn live_consumers(node: &Arc<dyn GraphNode>) -> Vec<Arc<dyn GraphNode>> {
    let mut live = Vec::new();
    {
        let mut edges = node.core().edges.lock();
        live.reserve(edges.consumers.len());
        edges.consumers.retain(|_, weak| match weak.upgrade() {
            Some(consumer) => {
                live.push(consumer);
                true
            }
            None => false,
        });
    }
    live
}

/// Mark every transitive consumer of `node` outdated, not `node` itself.
///
/// Returns the number of newly marked nodes.
pub(crate) fn mark_consumers(node: &Arc<dyn GraphNode>) -> usize {
    let mut marked = 0;
    let mut stack = live_consumers(node);
    while let Some(next) = stack.pop() {
        if next.core().mark_outdated() {
            marked += 1;
            stack.extend(live_consumers(&next));
        }
    }
    marked
}

/// Mark `node` and its transitive consumers outdated.
///
/// Idempotent: marking an outdated node does nothing and returns zero.
pub(crate) fn mark_outdated(node: &Arc<dyn GraphNode>) -> usize {
    if node.core().mark_outdated() {
        1 + mark_consumers(node)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edges::connect;
    use crate::graph::{NodeCore, NodeKind};
    use crate::runtime::Runtime;

    struct Bare(NodeCore);

    impl GraphNode for Bare {
        fn core(&self) -> &NodeCore {
            &self.0
        }
    }

    fn fresh(rt: &Runtime, kind: NodeKind) -> Arc<dyn GraphNode> {
        let node: Arc<dyn GraphNode> = Arc::new(Bare(NodeCore::new(rt, kind)));
        node.core().take_outdated();
        node
    }

    #[test]
    fn marking_propagates_down_a_chain() {
        let rt = Runtime::new();
        let source = fresh(&rt, NodeKind::Changeable);
        let derived1 = fresh(&rt, NodeKind::Adaptive);
        let derived2 = fresh(&rt, NodeKind::Adaptive);
        connect(&derived1, &source, false).unwrap();
        connect(&derived2, &derived1, false).unwrap();

        assert_eq!(mark_consumers(&source), 2);
        assert!(!source.core().is_outdated());
        assert!(derived1.core().is_outdated());
        assert!(derived2.core().is_outdated());
    }

    #[test]
    fn marking_short_circuits_at_outdated_nodes() {
        let rt = Runtime::new();
        let source = fresh(&rt, NodeKind::Changeable);
        let mid = fresh(&rt, NodeKind::Adaptive);
        let leaf = fresh(&rt, NodeKind::Adaptive);
        connect(&mid, &source, false).unwrap();
        connect(&leaf, &mid, false).unwrap();

        assert_eq!(mark_consumers(&source), 2);
        assert_eq!(mark_consumers(&source), 0);
        assert_eq!(mark_outdated(&mid), 0);
    }

    #[test]
    fn diamonds_are_marked_once() {
        let rt = Runtime::new();
        let source = fresh(&rt, NodeKind::Changeable);
        let left = fresh(&rt, NodeKind::Adaptive);
        let right = fresh(&rt, NodeKind::Adaptive);
        let join = fresh(&rt, NodeKind::Adaptive);
        connect(&left, &source, false).unwrap();
        connect(&right, &source, false).unwrap();
        connect(&join, &left, false).unwrap();
        connect(&join, &right, false).unwrap();

        assert_eq!(mark_consumers(&source), 3);
    }

    #[test]
    fn released_consumers_are_skipped() {
        let rt = Runtime::new();
        let source = fresh(&rt, NodeKind::Changeable);
        let kept = fresh(&rt, NodeKind::Adaptive);
        let released = fresh(&rt, NodeKind::Adaptive);
        connect(&kept, &source, false).unwrap();
        connect(&released, &source, false).unwrap();
        drop(released);

        let live = live_consumers(&source);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].core().id(), kept.core().id());
        assert_eq!(mark_consumers(&source), 1);
    }
}
