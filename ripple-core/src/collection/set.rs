//! Sets
//!
//! Changeable sets and the set combinators. Each combinator keeps just
//! enough state to translate one input delta into output deltas without
//! looking at the rest of its input:
//!
//! - `map` remembers each element's image and how many elements share it,
//!   so removing an element never calls the mapping function again
//! - `filter` remembers which elements passed
//! - `union` and `intersection` count in how many inputs an element is
//!   present
//! - `difference` remembers membership on both sides
//! - `group_by` is `map` pairing each element with its key

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use super::delta::{Element, SetDelta};
use super::node::{Collection, CollectionNode, Operator, Sink};
use super::reader::Reader;
use super::SetCollection;
use crate::error::Result;
use crate::graph::{AsNode, GraphNode, NodeRef};
use crate::runtime::Runtime;
use crate::transaction::{StagedWrite, Transaction};

// ============================================================================
// Changeable sets
// ============================================================================

/// Desired membership per element; only the net change is applied.
struct StagedSet<T: Element> {
    node: Arc<CollectionNode<SetDelta<T>>>,
    desired: IndexMap<T, bool>,
}

impl<T: Element> StagedWrite for StagedSet<T> {
    fn apply(self: Box<Self>) -> Option<Arc<dyn GraphNode>> {
        let StagedSet { node, desired } = *self;
        {
            let mut state = node.state.write();
            let deltas: Vec<SetDelta<T>> = desired
                .into_iter()
                .filter_map(|(value, present)| match (present, state.content.contains(&value)) {
                    (true, false) => Some(SetDelta::Add(value)),
                    (false, true) => Some(SetDelta::Remove(value)),
                    _ => None,
                })
                .collect();
            if deltas.is_empty() {
                return None;
            }
            state.publish(deltas);
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

/// A set written through transactions.
///
/// Dereferences to [`SetCollection`] for reading and combinators.
pub struct ChangeableSet<T: Element> {
    collection: SetCollection<T>,
}

impl<T: Element> ChangeableSet<T> {
    fn stage(&self, tx: &Transaction, value: T, present: bool) -> Result<()> {
        let node = &self.collection.node;
        tx.stage(
            node.core(),
            || StagedSet {
                node: node.clone(),
                desired: IndexMap::new(),
            },
            |staged: &mut StagedSet<T>| {
                staged.desired.insert(value, present);
                Ok(())
            },
        )
    }

    /// Stage adding `value`. Adding a present element changes nothing.
    pub fn insert(&self, tx: &Transaction, value: T) -> Result<()> {
        self.stage(tx, value, true)
    }

    /// Stage removing `value`. Removing an absent element changes nothing.
    pub fn remove(&self, tx: &Transaction, value: T) -> Result<()> {
        self.stage(tx, value, false)
    }

    /// Stage replacing `old` with `new`.
    pub fn replace(&self, tx: &Transaction, old: T, new: T) -> Result<()> {
        self.remove(tx, old)?;
        self.insert(tx, new)
    }

    /// Membership as seen from inside `tx`.
    pub fn contains_in(&self, tx: &Transaction, value: &T) -> bool {
        let staged = tx.peek::<StagedSet<T>, _>(self.collection.id(), |staged| {
            staged.and_then(|staged| staged.desired.get(value).copied())
        });
        staged.unwrap_or_else(|| self.collection.node.state.read().content.contains(value))
    }
}

impl Runtime {
    /// Create a changeable set holding `items`.
    pub fn changeable_set<T, I>(&self, items: I) -> ChangeableSet<T>
    where
        T: Element,
        I: IntoIterator<Item = T>,
    {
        let content: IndexSet<T> = items.into_iter().collect();
        ChangeableSet {
            collection: Collection::from_node(CollectionNode::source(self, content)),
        }
    }
}

impl<T: Element> Deref for ChangeableSet<T> {
    type Target = SetCollection<T>;

    fn deref(&self) -> &SetCollection<T> {
        &self.collection
    }
}

impl<T: Element> Clone for ChangeableSet<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
        }
    }
}

impl<T: Element> AsNode for ChangeableSet<T> {
    fn node(&self) -> NodeRef {
        self.collection.node()
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<T: Element> Collection<SetDelta<T>> {
    /// The set of images of the elements under `f`.
    ///
    /// `f` runs once per added element. Elements sharing an image are
    /// counted, so the image leaves the output only with the last of them.
    pub fn map<U, F>(&self, f: F) -> SetCollection<U>
    where
        U: Element,
        F: Fn(&T) -> U + Send + 'static,
    {
        let op = SetMap {
            input: self.subscribe(),
            f,
            images: HashMap::new(),
            counts: HashMap::new(),
        };
        Collection::derive(self.runtime(), op, &[self.erased()])
    }

    /// The elements satisfying `predicate`.
    pub fn filter<F>(&self, predicate: F) -> SetCollection<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let op = SetFilter {
            input: self.subscribe(),
            predicate,
            passing: HashSet::new(),
        };
        Collection::derive(self.runtime(), op, &[self.erased()])
    }

    /// Elements present in either set.
    pub fn union(&self, other: &SetCollection<T>) -> SetCollection<T> {
        self.counted(other, 1)
    }

    /// Elements present in both sets.
    pub fn intersection(&self, other: &SetCollection<T>) -> SetCollection<T> {
        self.counted(other, 2)
    }

    fn counted(&self, other: &SetCollection<T>, threshold: u8) -> SetCollection<T> {
        let op = SetCount {
            left: self.subscribe(),
            right: other.subscribe(),
            counts: HashMap::new(),
            threshold,
        };
        Collection::derive(self.runtime(), op, &[self.erased(), other.erased()])
    }

    /// Elements of this set that are not in `other`.
    pub fn difference(&self, other: &SetCollection<T>) -> SetCollection<T> {
        let op = SetDifference {
            left: self.subscribe(),
            right: other.subscribe(),
            in_left: HashSet::new(),
            in_right: HashSet::new(),
        };
        Collection::derive(self.runtime(), op, &[self.erased(), other.erased()])
    }

    /// Pair every element with its `key`, as a set of `(key, element)`.
    ///
    /// A group is the pairs sharing a key. Every input delta becomes exactly
    /// one output delta, however large its group is.
    pub fn group_by<K, F>(&self, key: F) -> SetCollection<(K, T)>
    where
        K: Element,
        F: Fn(&T) -> K + Send + 'static,
    {
        self.map(move |value| (key(value), value.clone()))
    }
}

struct SetMap<T: Element, U, F> {
    input: Reader<SetDelta<T>>,
    f: F,
    images: HashMap<T, U>,
    counts: HashMap<U, usize>,
}

impl<T, U, F> Operator<SetDelta<U>> for SetMap<T, U, F>
where
    T: Element,
    U: Element,
    F: Fn(&T) -> U + Send + 'static,
{
    fn step(&mut self, out: &mut Sink<'_, SetDelta<U>>) -> Result<()> {
        for delta in self.input.pull()? {
            match delta {
                SetDelta::Add(value) => {
                    if self.images.contains_key(&value) {
                        continue;
                    }
                    let image = (self.f)(&value);
                    self.images.insert(value, image.clone());
                    let count = self.counts.entry(image.clone()).or_insert(0);
                    *count += 1;
                    if *count == 1 {
                        out.emit(SetDelta::Add(image));
                    }
                }
                SetDelta::Remove(value) => {
                    let Some(image) = self.images.remove(&value) else {
                        continue;
                    };
                    if let Some(count) = self.counts.get_mut(&image) {
                        *count -= 1;
                        if *count == 0 {
                            self.counts.remove(&image);
                            out.emit(SetDelta::Remove(image));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.input.rewind();
        self.images.clear();
        self.counts.clear();
    }
}

struct SetFilter<T: Element, F> {
    input: Reader<SetDelta<T>>,
    predicate: F,
    passing: HashSet<T>,
}

impl<T, F> Operator<SetDelta<T>> for SetFilter<T, F>
where
    T: Element,
    F: Fn(&T) -> bool + Send + 'static,
{
    fn step(&mut self, out: &mut Sink<'_, SetDelta<T>>) -> Result<()> {
        for delta in self.input.pull()? {
            match delta {
                SetDelta::Add(value) => {
                    if !self.passing.contains(&value) && (self.predicate)(&value) {
                        self.passing.insert(value.clone());
                        out.emit(SetDelta::Add(value));
                    }
                }
                SetDelta::Remove(value) => {
                    if self.passing.remove(&value) {
                        out.emit(SetDelta::Remove(value));
                    }
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.input.rewind();
        self.passing.clear();
    }
}

/// Emits an element while it is present in at least `threshold` inputs.
struct SetCount<T: Element> {
    left: Reader<SetDelta<T>>,
    right: Reader<SetDelta<T>>,
    counts: HashMap<T, u8>,
    threshold: u8,
}

impl<T: Element> Operator<SetDelta<T>> for SetCount<T> {
    fn step(&mut self, out: &mut Sink<'_, SetDelta<T>>) -> Result<()> {
        let mut deltas = self.left.pull()?;
        deltas.extend(self.right.pull()?);

        for delta in deltas {
            match delta {
                SetDelta::Add(value) => {
                    let count = self.counts.entry(value.clone()).or_insert(0);
                    *count += 1;
                    if *count == self.threshold {
                        out.emit(SetDelta::Add(value));
                    }
                }
                SetDelta::Remove(value) => {
                    let Some(count) = self.counts.get_mut(&value) else {
                        continue;
                    };
                    if *count == self.threshold {
                        out.emit(SetDelta::Remove(value.clone()));
                    }
                    *count -= 1;
                    if *count == 0 {
                        self.counts.remove(&value);
                    }
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.left.rewind();
        self.right.rewind();
        self.counts.clear();
    }
}

struct SetDifference<T: Element> {
    left: Reader<SetDelta<T>>,
    right: Reader<SetDelta<T>>,
    in_left: HashSet<T>,
    in_right: HashSet<T>,
}

impl<T: Element> SetDifference<T> {
    fn present(&self, value: &T) -> bool {
        self.in_left.contains(value) && !self.in_right.contains(value)
    }
}

impl<T: Element> Operator<SetDelta<T>> for SetDifference<T> {
    fn step(&mut self, out: &mut Sink<'_, SetDelta<T>>) -> Result<()> {
        let left = self.left.pull()?;
        let right = self.right.pull()?;
        let tagged = left
            .into_iter()
            .map(|delta| (true, delta))
            .chain(right.into_iter().map(|delta| (false, delta)));

        for (from_left, delta) in tagged {
            let before = self.present(delta.element());
            let side = if from_left {
                &mut self.in_left
            } else {
                &mut self.in_right
            };
            let value = match delta {
                SetDelta::Add(value) => {
                    side.insert(value.clone());
                    value
                }
                SetDelta::Remove(value) => {
                    side.remove(&value);
                    value
                }
            };
            match (before, self.present(&value)) {
                (false, true) => out.emit(SetDelta::Add(value)),
                (true, false) => out.emit(SetDelta::Remove(value)),
                _ => {}
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.left.rewind();
        self.right.rewind();
        self.in_left.clear();
        self.in_right.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn set(items: &[i32]) -> IndexSet<i32> {
        items.iter().copied().collect()
    }

    #[test]
    fn staged_changes_consolidate_to_the_net_effect() {
        let rt = Runtime::new();
        let s = rt.changeable_set([1, 2]);
        let reader = s.subscribe();
        reader.pull().unwrap();

        let tx = rt.begin();
        s.insert(&tx, 3).unwrap();
        s.remove(&tx, 3).unwrap();
        s.insert(&tx, 1).unwrap();
        s.replace(&tx, 2, 4).unwrap();
        assert!(s.contains_in(&tx, &4));
        assert!(!s.contains_in(&tx, &2));
        tx.commit().unwrap();

        assert_eq!(
            reader.pull().unwrap(),
            vec![SetDelta::Remove(2), SetDelta::Add(4)]
        );
        assert_eq!(s.snapshot().unwrap(), set(&[1, 4]));
    }

    #[test]
    fn no_op_commits_do_not_outdate_consumers() {
        let rt = Runtime::new();
        let s = rt.changeable_set([1]);
        let doubled = s.map(|v| v * 2);
        doubled.snapshot().unwrap();

        rt.transact(|tx| s.insert(tx, 1)).unwrap();
        assert!(!doubled.is_outdated());
    }

    #[test]
    fn map_calls_f_once_per_added_element() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let s = rt.changeable_set([1, 2, 3]);
        let parity = {
            let calls = calls.clone();
            s.map(move |v| {
                calls.fetch_add(1, Ordering::SeqCst);
                v % 2
            })
        };

        assert_eq!(parity.snapshot().unwrap(), set(&[1, 0]));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // 3 still maps to 1, so the image stays.
        rt.transact(|tx| s.remove(tx, 1)).unwrap();
        assert_eq!(parity.snapshot().unwrap(), set(&[1, 0]));
        rt.transact(|tx| s.remove(tx, 3)).unwrap();
        assert_eq!(parity.snapshot().unwrap(), set(&[0]));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn union_intersection_and_difference() {
        let rt = Runtime::new();
        let a = rt.changeable_set([1, 2, 3]);
        let b = rt.changeable_set([3, 4]);
        let union = a.union(&b);
        let both = a.intersection(&b);
        let only_a = a.difference(&b);

        assert_eq!(union.snapshot().unwrap(), set(&[1, 2, 3, 4]));
        assert_eq!(both.snapshot().unwrap(), set(&[3]));
        assert_eq!(only_a.snapshot().unwrap(), set(&[1, 2]));

        rt.transact(|tx| {
            a.remove(tx, 3)?;
            b.insert(tx, 1)?;
            b.remove(tx, 4)
        })
        .unwrap();

        assert_eq!(union.snapshot().unwrap(), set(&[1, 2, 3]));
        assert_eq!(both.snapshot().unwrap(), set(&[1]));
        assert_eq!(only_a.snapshot().unwrap(), set(&[2]));
    }

    #[test]
    fn group_by_pairs_elements_with_keys() {
        let rt = Runtime::new();
        let words = rt.changeable_set(["apple", "avocado", "banana"]);
        let by_letter = words.group_by(|w| w.chars().next().unwrap_or(' '));
        let letters = by_letter.map(|(letter, _)| *letter);
        let reader = by_letter.subscribe();
        assert_eq!(reader.pull().unwrap().len(), 3);
        assert_eq!(letters.snapshot().unwrap(), IndexSet::from(['a', 'b']));

        rt.transact(|tx| {
            words.remove(tx, "banana")?;
            words.insert(tx, "apricot")
        })
        .unwrap();

        assert_eq!(
            reader.pull().unwrap(),
            vec![
                SetDelta::Remove(('b', "banana")),
                SetDelta::Add(('a', "apricot")),
            ]
        );
        assert_eq!(letters.snapshot().unwrap(), IndexSet::from(['a']));
    }

    #[test]
    fn group_by_work_does_not_grow_with_the_group() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let numbers = rt.changeable_set(0..5_000u32);
        let by_parity = {
            let calls = calls.clone();
            numbers.group_by(move |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                n % 2
            })
        };
        let reader = by_parity.subscribe();
        assert_eq!(reader.pull().unwrap().len(), 5_000);
        assert_eq!(calls.load(Ordering::SeqCst), 5_000);

        // One element joins a group of 2500: one key call, one delta.
        rt.transact(|tx| numbers.insert(tx, 5_000)).unwrap();
        assert_eq!(reader.pull().unwrap(), vec![SetDelta::Add((0, 5_000))]);
        assert_eq!(calls.load(Ordering::SeqCst), 5_001);

        rt.transact(|tx| numbers.remove(tx, 7)).unwrap();
        assert_eq!(reader.pull().unwrap(), vec![SetDelta::Remove((1, 7))]);
        assert_eq!(calls.load(Ordering::SeqCst), 5_001);
    }

    #[test]
    fn operators_recover_after_a_failed_step() {
        let rt = Runtime::new();
        let a = rt.changeable_set([1, 2, 3]);
        let b = rt.changeable_set([3]);
        let guarded = a.filter(|n| {
            assert!(*n < 100, "too large");
            n % 2 == 1
        });
        let only_a = guarded.difference(&b);
        let reader = only_a.subscribe();
        assert_eq!(reader.pull().unwrap(), vec![SetDelta::Add(1)]);

        rt.transact(|tx| a.insert(tx, 500)).unwrap();
        assert!(matches!(reader.pull(), Err(Error::Panicked(_))));

        rt.transact(|tx| {
            a.remove(tx, 500)?;
            a.insert(tx, 5)?;
            b.remove(tx, 3)
        })
        .unwrap();
        let mut replay = IndexSet::from([1]);
        crate::collection::apply_all(&mut replay, &reader.pull().unwrap());
        assert_eq!(replay.len(), 3);
        assert_eq!(replay, only_a.snapshot().unwrap());
        assert_eq!(replay, set(&[1, 3, 5]));
    }
}
