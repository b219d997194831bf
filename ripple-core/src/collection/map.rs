//! Maps
//!
//! Changeable maps and the map combinators.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexMap;

use super::delta::{Element, MapDelta, SetDelta, Value};
use super::node::{Collection, CollectionNode, Operator, Sink};
use super::reader::Reader;
use super::{MapCollection, SetCollection};
use crate::error::Result;
use crate::graph::{AsNode, GraphNode, NodeRef};
use crate::runtime::Runtime;
use crate::transaction::{StagedWrite, Transaction};

// ============================================================================
// Changeable maps
// ============================================================================

/// Desired binding per key; `None` removes.
struct StagedMap<K: Element, V: Value> {
    node: Arc<CollectionNode<MapDelta<K, V>>>,
    desired: IndexMap<K, Option<V>>,
}

impl<K, V> StagedWrite for StagedMap<K, V>
where
    K: Element,
    V: Value + PartialEq,
{
    fn apply(self: Box<Self>) -> Option<Arc<dyn GraphNode>> {
        let StagedMap { node, desired } = *self;
        {
            let mut state = node.state.write();
            let deltas: Vec<MapDelta<K, V>> = desired
                .into_iter()
                .filter_map(|(key, value)| match (state.content.get(&key), value) {
                    (None, Some(value)) => Some(MapDelta::Insert { key, value }),
                    (Some(old), None) => Some(MapDelta::Remove {
                        value: old.clone(),
                        key,
                    }),
                    (Some(old), Some(new)) if *old != new => Some(MapDelta::Update {
                        old: old.clone(),
                        key,
                        new,
                    }),
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

/// A key-value map written through transactions.
///
/// Dereferences to [`MapCollection`] for reading and combinators.
pub struct ChangeableMap<K: Element, V: Value> {
    collection: MapCollection<K, V>,
}

impl<K, V> ChangeableMap<K, V>
where
    K: Element,
    V: Value + PartialEq,
{
    fn stage(&self, tx: &Transaction, key: K, value: Option<V>) -> Result<()> {
        let node = &self.collection.node;
        tx.stage(
            node.core(),
            || StagedMap {
                node: node.clone(),
                desired: IndexMap::new(),
            },
            |staged: &mut StagedMap<K, V>| {
                staged.desired.insert(key, value);
                Ok(())
            },
        )
    }

    /// Stage binding `key` to `value`, replacing any previous binding.
    pub fn insert(&self, tx: &Transaction, key: K, value: V) -> Result<()> {
        self.stage(tx, key, Some(value))
    }

    /// Stage removing `key`. Removing an absent key changes nothing.
    pub fn remove(&self, tx: &Transaction, key: K) -> Result<()> {
        self.stage(tx, key, None)
    }

    /// The value bound to `key` as seen from inside `tx`.
    pub fn get_in(&self, tx: &Transaction, key: &K) -> Option<V> {
        let staged = tx.peek::<StagedMap<K, V>, _>(self.collection.id(), |staged| {
            staged.and_then(|staged| staged.desired.get(key).cloned())
        });
        match staged {
            Some(value) => value,
            None => self.collection.node.state.read().content.get(key).cloned(),
        }
    }
}

impl Runtime {
    /// Create a changeable map holding `entries`. Later duplicates of a key
    /// win.
    pub fn changeable_map<K, V, I>(&self, entries: I) -> ChangeableMap<K, V>
    where
        K: Element,
        V: Value + PartialEq,
        I: IntoIterator<Item = (K, V)>,
    {
        let content: IndexMap<K, V> = entries.into_iter().collect();
        ChangeableMap {
            collection: Collection::from_node(CollectionNode::source(self, content)),
        }
    }
}

impl<K: Element, V: Value> Deref for ChangeableMap<K, V> {
    type Target = MapCollection<K, V>;

    fn deref(&self) -> &MapCollection<K, V> {
        &self.collection
    }
}

impl<K: Element, V: Value> Clone for ChangeableMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
        }
    }
}

impl<K: Element, V: Value> AsNode for ChangeableMap<K, V> {
    fn node(&self) -> NodeRef {
        self.collection.node()
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<K: Element, V: Value> Collection<MapDelta<K, V>> {
    /// Every value mapped through `f`, under the same keys.
    ///
    /// An `Update` of the input stays an `Update` of the same key.
    pub fn map_values<U, F>(&self, f: F) -> MapCollection<K, U>
    where
        U: Value,
        F: Fn(&V) -> U + Send + 'static,
    {
        let op = MapValues {
            input: self.subscribe(),
            f,
        };
        Collection::derive(self.runtime(), op, &[self.erased()])
    }

    /// The entries satisfying `predicate`.
    pub fn filter<F>(&self, predicate: F) -> MapCollection<K, V>
    where
        F: Fn(&K, &V) -> bool + Send + 'static,
    {
        let op = MapFilter {
            input: self.subscribe(),
            predicate,
            passing: HashSet::new(),
        };
        Collection::derive(self.runtime(), op, &[self.erased()])
    }

    /// The set of keys.
    pub fn keys(&self) -> SetCollection<K> {
        let op = MapKeys {
            input: self.subscribe(),
        };
        Collection::derive(self.runtime(), op, &[self.erased()])
    }
}

impl<K: Element, V: Element> Collection<MapDelta<K, V>> {
    /// The set of distinct values. A value leaves the set when the last key
    /// bound to it does.
    pub fn values(&self) -> SetCollection<V> {
        let op = MapValueSet {
            input: self.subscribe(),
            counts: HashMap::new(),
        };
        Collection::derive(self.runtime(), op, &[self.erased()])
    }
}

struct MapValues<K: Element, V: Value, F> {
    input: Reader<MapDelta<K, V>>,
    f: F,
}

impl<K, V, U, F> Operator<MapDelta<K, U>> for MapValues<K, V, F>
where
    K: Element,
    V: Value,
    U: Value,
    F: Fn(&V) -> U + Send + 'static,
{
    fn step(&mut self, out: &mut Sink<'_, MapDelta<K, U>>) -> Result<()> {
        for delta in self.input.pull()? {
            match delta {
                MapDelta::Insert { key, value } => {
                    let value = (self.f)(&value);
                    out.emit(MapDelta::Insert { key, value });
                }
                MapDelta::Remove { key, .. } => {
                    let value = out.content().get(&key).cloned();
                    debug_assert!(value.is_some(), "mapped map has no value for a removed key");
                    let Some(value) = value else { continue };
                    out.emit(MapDelta::Remove { key, value });
                }
                MapDelta::Update { key, new, .. } => {
                    let old = out.content().get(&key).cloned();
                    debug_assert!(old.is_some(), "mapped map has no value for an updated key");
                    let Some(old) = old else { continue };
                    let new = (self.f)(&new);
                    out.emit(MapDelta::Update { key, old, new });
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.input.rewind();
    }
}

struct MapFilter<K: Element, V: Value, F> {
    input: Reader<MapDelta<K, V>>,
    predicate: F,
    passing: HashSet<K>,
}

impl<K, V, F> Operator<MapDelta<K, V>> for MapFilter<K, V, F>
where
    K: Element,
    V: Value,
    F: Fn(&K, &V) -> bool + Send + 'static,
{
    fn step(&mut self, out: &mut Sink<'_, MapDelta<K, V>>) -> Result<()> {
        for delta in self.input.pull()? {
            match delta {
                MapDelta::Insert { key, value } => {
                    if (self.predicate)(&key, &value) {
                        self.passing.insert(key.clone());
                        out.emit(MapDelta::Insert { key, value });
                    }
                }
                MapDelta::Remove { key, value } => {
                    if self.passing.remove(&key) {
                        out.emit(MapDelta::Remove { key, value });
                    }
                }
                MapDelta::Update { key, old, new } => {
                    let was = self.passing.contains(&key);
                    let now = (self.predicate)(&key, &new);
                    match (was, now) {
                        (true, true) => out.emit(MapDelta::Update { key, old, new }),
                        (true, false) => {
                            self.passing.remove(&key);
                            out.emit(MapDelta::Remove { key, value: old });
                        }
                        (false, true) => {
                            self.passing.insert(key.clone());
                            out.emit(MapDelta::Insert { key, value: new });
                        }
                        (false, false) => {}
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

struct MapKeys<K: Element, V: Value> {
    input: Reader<MapDelta<K, V>>,
}

impl<K: Element, V: Value> Operator<SetDelta<K>> for MapKeys<K, V> {
    fn step(&mut self, out: &mut Sink<'_, SetDelta<K>>) -> Result<()> {
        for delta in self.input.pull()? {
            match delta {
                MapDelta::Insert { key, .. } => out.emit(SetDelta::Add(key)),
                MapDelta::Remove { key, .. } => out.emit(SetDelta::Remove(key)),
                MapDelta::Update { .. } => {}
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.input.rewind();
    }
}

struct MapValueSet<K: Element, V: Element> {
    input: Reader<MapDelta<K, V>>,
    /// Number of keys bound to each value.
    counts: HashMap<V, usize>,
}

impl<K: Element, V: Element> MapValueSet<K, V> {
    fn retain(&mut self, value: V, out: &mut Sink<'_, SetDelta<V>>) {
        let count = self.counts.entry(value.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            out.emit(SetDelta::Add(value));
        }
    }

    fn release(&mut self, value: V, out: &mut Sink<'_, SetDelta<V>>) {
        let Some(count) = self.counts.get_mut(&value) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&value);
            out.emit(SetDelta::Remove(value));
        }
    }
}

impl<K: Element, V: Element> Operator<SetDelta<V>> for MapValueSet<K, V> {
    fn step(&mut self, out: &mut Sink<'_, SetDelta<V>>) -> Result<()> {
        for delta in self.input.pull()? {
            match delta {
                MapDelta::Insert { value, .. } => self.retain(value, out),
                MapDelta::Remove { value, .. } => self.release(value, out),
                MapDelta::Update { old, new, .. } => {
                    self.release(old, out);
                    self.retain(new, out);
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.input.rewind();
        self.counts.clear();
    }
}
