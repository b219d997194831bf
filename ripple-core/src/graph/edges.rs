//! Edge Maintenance
//!
//! Producer and consumer tables are updated together so the edge set stays
//! symmetric. Every function here must be called with the runtime's shape
//! lock held (shared or exclusive), and never holds two nodes' edge locks at
//! once.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::node::{GraphNode, ProducerEdge};
use super::NodeId;
use crate::error::{Error, Result};

/// Returns true if `target` is reachable from `start` by following producer
/// edges, i.e. `start` transitively reads `target`.
pub(crate) fn depends_on(start: &Arc<dyn GraphNode>, target: NodeId) -> bool {
    let mut visited = HashSet::new();
    let mut stack: Vec<Arc<dyn GraphNode>> = vec![start.clone()];

    while let Some(node) = stack.pop() {
        let producers: SmallVec<[Arc<dyn GraphNode>; 4]> = node
            .core()
            .edges
            .lock()
            .producers
            .values()
            .map(|edge| edge.node.clone())
            .collect();

        for producer in producers {
            let id = producer.core().id();
            if id == target {
                return true;
            }
            if visited.insert(id) {
                stack.push(producer);
            }
        }
    }
    false
}

fn check_acyclic(consumer: &Arc<dyn GraphNode>, producer: &Arc<dyn GraphNode>) -> Result<()> {
    let c = consumer.core().id();
    let p = producer.core().id();
    if c == p || depends_on(producer, c) {
        tracing::warn!(consumer = %c, producer = %p, "rejected edge that would close a cycle");
        return Err(Error::Cycle {
            consumer: c,
            producer: p,
        });
    }
    Ok(())
}

/// Bring the outdated declared producers of `node` up to date. Called
/// before `node` computes, since its derivation may never read them.
///
/// Their failures are left for whoever reads them.
pub(crate) fn refresh_declared(node: &dyn GraphNode) {
    let declared: SmallVec<[Arc<dyn GraphNode>; 4]> = node
        .core()
        .edges
        .lock()
        .producers
        .values()
        .filter(|edge| edge.declared && edge.node.core().is_outdated())
        .map(|edge| edge.node.clone())
        .collect();

    for producer in declared {
        let id = producer.core().id();
        if let Err(err) = crate::cell::untracked(|| producer.bring_up_to_date()) {
            tracing::trace!(node = %node.core().id(), producer = %id, error = %err, "declared producer failed");
        }
    }
}

/// Add the edge `producer -> consumer`.
///
/// `declared` edges persist across recomputations; the others are replaced by
/// each recomputation's read set. Both nodes must belong to one runtime.
pub(crate) fn connect(
    consumer: &Arc<dyn GraphNode>,
    producer: &Arc<dyn GraphNode>,
    declared: bool,
) -> Result<()> {
    let producer_id = producer.core().id();
    {
        let mut edges = consumer.core().edges.lock();
        if let Some(edge) = edges.producers.get_mut(&producer_id) {
            if declared {
                edge.declared = true;
            } else {
                edge.tracked = true;
            }
            return Ok(());
        }
    }

    if !consumer.core().runtime().ptr_eq(producer.core().runtime()) {
        return Err(Error::ForeignRuntime);
    }
    check_acyclic(consumer, producer)?;

    consumer.core().edges.lock().producers.insert(
        producer_id,
        ProducerEdge {
            node: producer.clone(),
            declared,
            tracked: !declared,
        },
    );
    producer
        .core()
        .edges
        .lock()
        .consumers
        .insert(consumer.core().id(), Arc::downgrade(consumer));
    Ok(())
}

/// Remove the declared flag from an edge, dropping the edge unless the last
/// recomputation also read the producer.
pub(crate) fn disconnect_declared(consumer: &Arc<dyn GraphNode>, producer: NodeId) -> bool {
    let removed = {
        let mut edges = consumer.core().edges.lock();
        match edges.producers.get_mut(&producer) {
            Some(edge) if edge.declared => {
                edge.declared = false;
                if edge.tracked {
                    return true;
                }
                edges.producers.swap_remove(&producer)
            }
            _ => return false,
        }
    };

    if let Some(edge) = removed {
        unlink(&edge, consumer.core().id());
    }
    true
}

fn unlink(edge: &ProducerEdge, consumer: NodeId) {
    edge.node.core().edges.lock().consumers.swap_remove(&consumer);
}

/// Replace the tracked producers of `node` with the set read by its latest
/// recomputation.
///
/// Stale edges are disconnected, new ones connected. If any new edge would
/// close a cycle or cross into another runtime, nothing changes and the
/// error is reported.
pub(crate) fn replace_tracked<I>(node: &Arc<dyn GraphNode>, reads: I) -> Result<()>
where
    I: IntoIterator<Item = Arc<dyn GraphNode>>,
{
    let id = node.core().id();
    let mut reads: IndexMap<NodeId, Arc<dyn GraphNode>> = reads
        .into_iter()
        .map(|read| (read.core().id(), read))
        .collect();
    reads.swap_remove(&id);

    let fresh: Vec<Arc<dyn GraphNode>> = {
        let edges = node.core().edges.lock();
        reads
            .values()
            .filter(|read| !edges.producers.contains_key(&read.core().id()))
            .cloned()
            .collect()
    };
    for producer in &fresh {
        if !node.core().runtime().ptr_eq(producer.core().runtime()) {
            return Err(Error::ForeignRuntime);
        }
        check_acyclic(node, producer)?;
    }

    let stale: Vec<ProducerEdge> = {
        let mut edges = node.core().edges.lock();
        for edge in edges.producers.values_mut() {
            edge.tracked = reads.contains_key(&edge.node.core().id());
        }
        let stale_ids: Vec<NodeId> = edges
            .producers
            .iter()
            .filter(|(_, edge)| !edge.declared && !edge.tracked)
            .map(|(id, _)| *id)
            .collect();
        let stale = stale_ids
            .iter()
            .filter_map(|stale_id| edges.producers.swap_remove(stale_id))
            .collect();
        for producer in &fresh {
            edges.producers.insert(
                producer.core().id(),
                ProducerEdge {
                    node: producer.clone(),
                    declared: false,
                    tracked: true,
                },
            );
        }
        stale
    };

    for edge in &stale {
        unlink(edge, id);
    }
    for producer in &fresh {
        producer
            .core()
            .edges
            .lock()
            .consumers
            .insert(id, Arc::downgrade(node));
    }
    if !stale.is_empty() || !fresh.is_empty() {
        tracing::trace!(node = %id, added = fresh.len(), removed = stale.len(), "producer set changed");
    }
    // Stale producers may be released here, after every edge lock is gone.
    drop(stale);
    Ok(())
}
