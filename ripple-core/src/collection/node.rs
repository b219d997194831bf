//! Collection nodes.
//!
//! A collection node holds the materialized content and the delta history of
//! one collection. Changeable collections change only at commit; derived
//! collections own an [`Operator`] that turns their inputs' pending deltas
//! into their own deltas when the collection is pulled while outdated.
//!
//! A failing step has its error cached and reported by every pull until an
//! input changes. The step after that rebuilds the output from the inputs'
//! current content and emits the difference from what readers last saw.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::delta::Delta;
use super::history::History;
use super::reader::Reader;
use crate::cell::TrackingContext;
use crate::error::{Error, Result};
use crate::graph::{edges, AsNode, GraphNode, NodeCore, NodeId, NodeKind, NodeRef};
use crate::runtime::Runtime;

/// Turns input deltas into output deltas.
pub(crate) trait Operator<D: Delta>: Send {
    /// Drain the inputs and emit the corresponding changes into `out`.
    fn step(&mut self, out: &mut Sink<'_, D>) -> Result<()>;

    /// Forget all derived state and rewind the input readers, so the next
    /// step emits the whole output from the inputs' current content.
    fn reset(&mut self);
}

/// Output of one operator step.
///
/// Every emitted delta is applied to the content immediately, so operators
/// can consult the output as it stands after their earlier emissions.
pub(crate) struct Sink<'a, D: Delta> {
    content: &'a mut D::Content,
    emitted: Vec<D>,
}

impl<'a, D: Delta> Sink<'a, D> {
    pub(crate) fn new(content: &'a mut D::Content) -> Self {
        Self {
            content,
            emitted: Vec::new(),
        }
    }

    pub(crate) fn emit(&mut self, delta: D) {
        delta.apply(self.content);
        self.emitted.push(delta);
    }

    pub(crate) fn content(&self) -> &D::Content {
        self.content
    }

    pub(crate) fn finish(self) -> Vec<D> {
        self.emitted
    }
}

pub(crate) struct CollectionState<D: Delta> {
    pub(crate) content: D::Content,
    pub(crate) history: History<D>,
    /// Error of the last step, reported until an input changes.
    failure: Option<Error>,
    /// The operator's state no longer matches the content, so the next step
    /// rebuilds the output from scratch.
    stale: bool,
    /// An input could not be connected; the collection never computes.
    rejected: Option<Error>,
}

impl<D: Delta> CollectionState<D> {
    /// Apply `deltas` in order and log them for readers.
    pub(crate) fn publish(&mut self, deltas: Vec<D>) {
        for delta in &deltas {
            delta.apply(&mut self.content);
        }
        self.history.record(deltas);
    }
}

pub(crate) struct CollectionNode<D: Delta> {
    core: NodeCore,
    pub(crate) state: RwLock<CollectionState<D>>,
    /// `None` for changeable collections. Doubles as the compute mutex.
    operator: Option<Mutex<Box<dyn Operator<D>>>>,
}

impl<D: Delta> GraphNode for CollectionNode<D> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn bring_up_to_date(self: Arc<Self>) -> Result<()> {
        let _shape = self.core.runtime().shape_read();
        self.refresh()
    }
}

impl<D: Delta> CollectionNode<D> {
    fn new(
        runtime: &Runtime,
        kind: NodeKind,
        content: D::Content,
        operator: Option<Box<dyn Operator<D>>>,
    ) -> Self {
        Self {
            core: NodeCore::new(runtime, kind),
            state: RwLock::new(CollectionState {
                content,
                history: History::new(runtime.config().history_warning_threshold),
                failure: None,
                stale: false,
                rejected: None,
            }),
            operator: operator.map(Mutex::new),
        }
    }

    pub(crate) fn source(runtime: &Runtime, content: D::Content) -> Arc<Self> {
        Arc::new(Self::new(runtime, NodeKind::ChangeableCollection, content, None))
    }

    /// A derived collection reading `inputs` through `operator`.
    ///
    /// The edges to the inputs are declared, so they persist for the life of
    /// the collection.
    pub(crate) fn derived(
        runtime: &Runtime,
        operator: Box<dyn Operator<D>>,
        inputs: &[Arc<dyn GraphNode>],
    ) -> Arc<Self> {
        let node = Arc::new(Self::new(
            runtime,
            NodeKind::DerivedCollection,
            D::Content::default(),
            Some(operator),
        ));
        let erased: Arc<dyn GraphNode> = node.clone();

        let _shape = runtime.shape_read();
        for input in inputs {
            if let Err(err) = edges::connect(&erased, input, true) {
                tracing::warn!(node = %node.core.id(), error = %err, "collection input rejected");
                node.state.write().rejected = Some(err);
                break;
            }
        }
        node
    }

    /// Bring the content up to date. Must be called with the shape lock held.
    pub(crate) fn refresh(&self) -> Result<()> {
        let id = self.core.id();
        let Some(operator) = &self.operator else {
            return Ok(());
        };
        if TrackingContext::is_computing(id) {
            return Err(Error::Cycle {
                consumer: TrackingContext::current().unwrap_or(id),
                producer: id,
            });
        }

        let mut operator = operator.lock();
        let mut state = self.state.write();
        if let Some(rejected) = &state.rejected {
            return Err(rejected.clone());
        }
        if !self.core.is_outdated() {
            return match &state.failure {
                Some(failure) => Err(failure.clone()),
                None => Ok(()),
            };
        }

        edges::refresh_declared(self);

        let state = &mut *state;
        let rebuild = state.stale;
        if rebuild {
            operator.reset();
        }

        // Reads made by the operator go through declared edges.
        let ctx = TrackingContext::enter(id);
        let mut rebuilt = D::Content::default();
        let target = if rebuild {
            &mut rebuilt
        } else {
            &mut state.content
        };
        let mut sink = Sink::new(target);
        let stepped = panic::catch_unwind(AssertUnwindSafe(|| operator.step(&mut sink)));
        let emitted = sink.finish();
        drop(ctx);

        let outcome = match stepped {
            Ok(outcome) => outcome,
            Err(payload) if !self.core.runtime().config().catch_panics => {
                if !rebuild {
                    state.history.record(emitted);
                }
                state.stale = true;
                tracing::warn!(node = %id, "collection operator panicked");
                panic::resume_unwind(payload);
            }
            Err(payload) => Err(Error::from_panic(payload)),
        };

        match outcome {
            Ok(()) => {
                let count = if rebuild {
                    let deltas = D::diff(&state.content, &rebuilt);
                    let count = deltas.len();
                    state.history.record(deltas);
                    state.content = rebuilt;
                    count
                } else {
                    let count = emitted.len();
                    state.history.record(emitted);
                    count
                };
                state.stale = false;
                state.failure = None;
                self.core.take_outdated();
                tracing::trace!(node = %id, emitted = count, rebuilt = rebuild, "collection refreshed");
                Ok(())
            }
            Err(err) => {
                // Output already emitted stays, so readers keep matching the
                // content. The input deltas the step consumed are gone.
                if !rebuild {
                    state.history.record(emitted);
                }
                state.stale = true;
                state.failure = Some(err.clone());
                self.core.take_outdated();
                tracing::warn!(node = %id, error = %err, "collection operator failed");
                Err(err)
            }
        }
    }

    fn erased(self: &Arc<Self>) -> Arc<dyn GraphNode> {
        self.clone()
    }
}

/// A collection of deltas of type `D`.
///
/// Cloning the handle is cheap and shares the collection.
pub struct Collection<D: Delta> {
    pub(crate) node: Arc<CollectionNode<D>>,
}

/// A set of elements.
pub type SetCollection<T> = Collection<super::SetDelta<T>>;
/// An ordered list.
pub type ListCollection<T> = Collection<super::ListDelta<T>>;
/// A key-value map.
pub type MapCollection<K, V> = Collection<super::MapDelta<K, V>>;

impl<D: Delta> Collection<D> {
    pub(crate) fn from_node(node: Arc<CollectionNode<D>>) -> Self {
        Self { node }
    }

    /// Build a derived collection over `inputs`.
    pub(crate) fn derive<O>(runtime: &Runtime, operator: O, inputs: &[Arc<dyn GraphNode>]) -> Self
    where
        O: Operator<D> + 'static,
    {
        Self::from_node(CollectionNode::derived(runtime, Box::new(operator), inputs))
    }

    pub(crate) fn erased(&self) -> Arc<dyn GraphNode> {
        self.node.erased()
    }

    /// The collection's node identifier.
    pub fn id(&self) -> NodeId {
        self.node.core.id()
    }

    /// The runtime that owns this collection.
    pub fn runtime(&self) -> &Runtime {
        self.node.core.runtime()
    }

    /// Whether the collection has input changes it has not processed.
    pub fn is_outdated(&self) -> bool {
        self.node.core.is_outdated()
    }

    /// Register a new reader. Its first pull returns the whole content as
    /// additions.
    pub fn subscribe(&self) -> Reader<D> {
        let reader = self.node.state.write().history.register();
        tracing::trace!(node = %self.id(), reader, "reader subscribed");
        Reader::new(self.node.clone(), reader)
    }

    /// A copy of the up-to-date content.
    ///
    /// Inside a derivation the read is recorded as a dependency.
    pub fn snapshot(&self) -> Result<D::Content> {
        TrackingContext::track(&self.erased());
        let _shape = self.runtime().shape_read();
        self.node.refresh()?;
        let content = self.node.state.read().content.clone();
        Ok(content)
    }

    /// Number of registered readers, including those of derived collections.
    pub fn reader_count(&self) -> usize {
        self.node.state.read().history.readers()
    }

    /// Number of deltas held for readers that have not pulled them yet.
    pub fn retained_deltas(&self) -> usize {
        self.node.state.read().history.retained()
    }
}

impl<D: Delta> Clone for Collection<D> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<D: Delta> AsNode for Collection<D> {
    fn node(&self) -> NodeRef {
        NodeRef(self.erased())
    }
}

impl<D: Delta> fmt::Debug for Collection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.node.state.read();
        f.debug_struct("Collection")
            .field("id", &self.node.core.id())
            .field("kind", &self.node.core.kind())
            .field("outdated", &self.node.core.is_outdated())
            .field("len", &D::content_len(&state.content))
            .field("readers", &state.history.readers())
            .finish()
    }
}
