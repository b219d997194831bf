//! Lists
//!
//! Changeable lists and the list combinators. List edits are positional and
//! are emitted in staging order; indices of later edits refer to the list as
//! earlier edits of the same transaction left it.

use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

use super::delta::{Delta, ListDelta, Value};
use super::node::{Collection, CollectionNode, Operator, Sink};
use super::position::PositionIndex;
use super::reader::Reader;
use super::ListCollection;
use crate::error::{Error, Result};
use crate::graph::{AsNode, GraphNode, NodeRef};
use crate::runtime::Runtime;
use crate::transaction::{StagedWrite, Transaction};

// ============================================================================
// Changeable lists
// ============================================================================

enum ListEdit<T> {
    Insert(usize, T),
    Remove(usize),
    Set(usize, T),
}

impl<T> ListEdit<T> {
    /// Check the edit against a list of length `len`, returning the length
    /// after it.
    fn check(&self, len: usize) -> Result<usize> {
        let (index, ok, after) = match self {
            ListEdit::Insert(index, _) => (*index, *index <= len, len + 1),
            ListEdit::Remove(index) => (*index, *index < len, len.wrapping_sub(1)),
            ListEdit::Set(index, _) => (*index, *index < len, len),
        };
        if ok {
            Ok(after)
        } else {
            Err(Error::IndexOutOfBounds { index, len })
        }
    }
}

struct StagedList<T: Value> {
    node: Arc<CollectionNode<ListDelta<T>>>,
    edits: Vec<ListEdit<T>>,
    /// Length after the staged edits, as of staging time.
    len: usize,
}

impl<T: Value> StagedWrite for StagedList<T> {
    fn validate(&self) -> Result<()> {
        let committed = self.node.state.read().content.len();
        self.edits.iter().try_fold(committed, |len, edit| edit.check(len))?;
        Ok(())
    }

    fn apply(self: Box<Self>) -> Option<Arc<dyn GraphNode>> {
        let StagedList { node, edits, .. } = *self;
        if edits.is_empty() {
            return None;
        }
        {
            let mut state = node.state.write();
            let mut deltas = Vec::with_capacity(edits.len());
            for edit in edits {
                let delta = match edit {
                    ListEdit::Insert(index, value) => ListDelta::Insert { index, value },
                    ListEdit::Remove(index) => ListDelta::Remove {
                        index,
                        value: state.content[index].clone(),
                    },
                    ListEdit::Set(index, new) => ListDelta::Update {
                        index,
                        old: state.content[index].clone(),
                        new,
                    },
                };
                delta.apply(&mut state.content);
                deltas.push(delta);
            }
            state.history.record(deltas);
        }
        Some(node)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An ordered list written through transactions.
///
/// Dereferences to [`ListCollection`] for reading and combinators.
pub struct ChangeableList<T: Value> {
    collection: ListCollection<T>,
}

impl<T: Value> ChangeableList<T> {
    fn stage(&self, tx: &Transaction, edit: ListEdit<T>) -> Result<()> {
        let node = &self.collection.node;
        tx.stage(
            node.core(),
            || StagedList {
                node: node.clone(),
                edits: Vec::new(),
                len: node.state.read().content.len(),
            },
            |staged: &mut StagedList<T>| {
                staged.len = edit.check(staged.len)?;
                staged.edits.push(edit);
                Ok(())
            },
        )
    }

    /// Stage inserting `value` at `index`, shifting later elements.
    pub fn insert(&self, tx: &Transaction, index: usize, value: T) -> Result<()> {
        self.stage(tx, ListEdit::Insert(index, value))
    }

    /// Stage appending `value`.
    pub fn push(&self, tx: &Transaction, value: T) -> Result<()> {
        let len = self.len_in(tx);
        self.insert(tx, len, value)
    }

    /// Stage removing the element at `index`.
    pub fn remove(&self, tx: &Transaction, index: usize) -> Result<()> {
        self.stage(tx, ListEdit::Remove(index))
    }

    /// Stage replacing the element at `index`. Readers see an `Update`.
    pub fn set(&self, tx: &Transaction, index: usize, value: T) -> Result<()> {
        self.stage(tx, ListEdit::Set(index, value))
    }

    /// Length as seen from inside `tx`.
    pub fn len_in(&self, tx: &Transaction) -> usize {
        tx.peek::<StagedList<T>, _>(self.collection.id(), |staged| staged.map(|s| s.len))
            .unwrap_or_else(|| self.collection.node.state.read().content.len())
    }
}

impl Runtime {
    /// Create a changeable list holding `items` in order.
    pub fn changeable_list<T, I>(&self, items: I) -> ChangeableList<T>
    where
        T: Value,
        I: IntoIterator<Item = T>,
    {
        let content: Vec<T> = items.into_iter().collect();
        ChangeableList {
            collection: Collection::from_node(CollectionNode::source(self, content)),
        }
    }
}

impl<T: Value> Deref for ChangeableList<T> {
    type Target = ListCollection<T>;

    fn deref(&self) -> &ListCollection<T> {
        &self.collection
    }
}

impl<T: Value> Clone for ChangeableList<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
        }
    }
}

impl<T: Value> AsNode for ChangeableList<T> {
    fn node(&self) -> NodeRef {
        self.collection.node()
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<T: Value> Collection<ListDelta<T>> {
    /// Each element mapped through `f`, in the same order.
    ///
    /// An `Update` of the input stays an `Update` at the same position.
    pub fn map<U, F>(&self, f: F) -> ListCollection<U>
    where
        U: Value,
        F: Fn(&T) -> U + Send + 'static,
    {
        let op = ListMap {
            input: self.subscribe(),
            f,
        };
        Collection::derive(self.runtime(), op, &[self.erased()])
    }

    /// The elements satisfying `predicate`, in order.
    ///
    /// Input positions are translated to output positions in logarithmic
    /// time.
    pub fn filter<F>(&self, predicate: F) -> ListCollection<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let op = ListFilter {
            input: self.subscribe(),
            predicate,
            positions: PositionIndex::new(),
        };
        Collection::derive(self.runtime(), op, &[self.erased()])
    }

    /// This list followed by `other`.
    pub fn concat(&self, other: &ListCollection<T>) -> ListCollection<T> {
        let op = ListConcat {
            left: self.subscribe(),
            right: other.subscribe(),
            left_len: 0,
        };
        Collection::derive(self.runtime(), op, &[self.erased(), other.erased()])
    }
}

struct ListMap<T: Value, F> {
    input: Reader<ListDelta<T>>,
    f: F,
}

impl<T, U, F> Operator<ListDelta<U>> for ListMap<T, F>
where
    T: Value,
    U: Value,
    F: Fn(&T) -> U + Send + 'static,
{
    fn step(&mut self, out: &mut Sink<'_, ListDelta<U>>) -> Result<()> {
        for delta in self.input.pull()? {
            match delta {
                ListDelta::Insert { index, value } => {
                    let value = (self.f)(&value);
                    out.emit(ListDelta::Insert { index, value });
                }
                ListDelta::Remove { index, .. } => {
                    let value = out.content().get(index).cloned();
                    debug_assert!(value.is_some(), "mapped list has no element at {index}");
                    let Some(value) = value else { continue };
                    out.emit(ListDelta::Remove { index, value });
                }
                ListDelta::Update { index, new, .. } => {
                    let old = out.content().get(index).cloned();
                    debug_assert!(old.is_some(), "mapped list has no element at {index}");
                    let Some(old) = old else { continue };
                    let new = (self.f)(&new);
                    out.emit(ListDelta::Update { index, old, new });
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.input.rewind();
    }
}

struct ListFilter<T: Value, F> {
    input: Reader<ListDelta<T>>,
    predicate: F,
    /// One flag per input position: does the element pass?
    positions: PositionIndex,
}

impl<T, F> Operator<ListDelta<T>> for ListFilter<T, F>
where
    T: Value,
    F: Fn(&T) -> bool + Send + 'static,
{
    fn step(&mut self, out: &mut Sink<'_, ListDelta<T>>) -> Result<()> {
        for delta in self.input.pull()? {
            match delta {
                ListDelta::Insert { index, value } => {
                    let passes = (self.predicate)(&value);
                    let rank = self.positions.insert(index, passes);
                    if passes {
                        out.emit(ListDelta::Insert { index: rank, value });
                    }
                }
                ListDelta::Remove { index, value } => {
                    if let Some((true, rank)) = self.positions.remove(index) {
                        out.emit(ListDelta::Remove { index: rank, value });
                    }
                }
                ListDelta::Update { index, old, new } => {
                    let passes = (self.predicate)(&new);
                    match self.positions.set(index, passes) {
                        Some((true, rank)) if passes => {
                            out.emit(ListDelta::Update { index: rank, old, new });
                        }
                        Some((true, rank)) => {
                            out.emit(ListDelta::Remove { index: rank, value: old });
                        }
                        Some((false, rank)) if passes => {
                            out.emit(ListDelta::Insert { index: rank, value: new });
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.input.rewind();
        self.positions = PositionIndex::new();
    }
}

struct ListConcat<T: Value> {
    left: Reader<ListDelta<T>>,
    right: Reader<ListDelta<T>>,
    left_len: usize,
}

impl<T: Value> Operator<ListDelta<T>> for ListConcat<T> {
    fn step(&mut self, out: &mut Sink<'_, ListDelta<T>>) -> Result<()> {
        let left = self.left.pull()?;
        let right = self.right.pull()?;

        // Left edits never move the right part's relative positions, so they
        // go first and the right part is offset by the final left length.
        for delta in left {
            self.left_len = self.left_len.saturating_add_signed(delta.size_change());
            out.emit(delta);
        }
        for delta in right {
            let index = delta.index() + self.left_len;
            out.emit(delta.at(index));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.left.rewind();
        self.right.rewind();
        self.left_len = 0;
    }
}
