//! Delta types for collections.
//!
//! A delta describes one change to a collection's content. Applying every
//! delta a reader receives, in order, to an empty content reproduces the
//! collection's content at the time of the last pull.

use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// Bounds for set elements and map keys.
pub trait Element: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T> Element for T where T: Clone + Eq + Hash + Send + Sync + 'static {}

/// Bounds for list elements and map values.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

/// A change to a collection's content.
pub trait Delta: Clone + Send + Sync + 'static {
    /// The materialized content the deltas apply to.
    type Content: Clone + Default + Send + Sync + 'static;

    /// Apply this change to `content`.
    fn apply(&self, content: &mut Self::Content);

    /// The deltas that build `content` from an empty collection.
    fn bootstrap(content: &Self::Content) -> Vec<Self>;

    /// Deltas that turn `old` into `new`.
    ///
    /// Used when a derived collection is rebuilt from scratch; values are not
    /// compared, so elements present on both sides may be reported as
    /// updated.
    fn diff(old: &Self::Content, new: &Self::Content) -> Vec<Self>;

    /// How many elements this change adds (negative when it removes).
    fn size_change(&self) -> isize;

    /// Number of elements in `content`.
    fn content_len(content: &Self::Content) -> usize;
}

/// Apply `deltas` in order to `content`.
pub fn apply_all<D: Delta>(content: &mut D::Content, deltas: &[D]) {
    for delta in deltas {
        delta.apply(content);
    }
}

/// A membership change in a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetDelta<T> {
    /// The element joined the set.
    Add(T),
    /// The element left the set.
    Remove(T),
}

impl<T> SetDelta<T> {
    /// The element that changed.
    #[inline]
    pub fn element(&self) -> &T {
        match self {
            SetDelta::Add(value) | SetDelta::Remove(value) => value,
        }
    }

    /// Returns true for [`SetDelta::Add`].
    #[inline]
    pub fn is_add(&self) -> bool {
        matches!(self, SetDelta::Add(_))
    }

    /// Consume the delta, returning its element.
    #[inline]
    pub fn into_element(self) -> T {
        match self {
            SetDelta::Add(value) | SetDelta::Remove(value) => value,
        }
    }
}

impl<T: Element> Delta for SetDelta<T> {
    type Content = IndexSet<T>;

    fn apply(&self, content: &mut IndexSet<T>) {
        match self {
            SetDelta::Add(value) => {
                content.insert(value.clone());
            }
            SetDelta::Remove(value) => {
                content.swap_remove(value);
            }
        }
    }

    fn bootstrap(content: &IndexSet<T>) -> Vec<Self> {
        content.iter().cloned().map(SetDelta::Add).collect()
    }

    fn diff(old: &IndexSet<T>, new: &IndexSet<T>) -> Vec<Self> {
        let removed = old.difference(new).cloned().map(SetDelta::Remove);
        let added = new.difference(old).cloned().map(SetDelta::Add);
        removed.chain(added).collect()
    }

    fn size_change(&self) -> isize {
        if self.is_add() {
            1
        } else {
            -1
        }
    }

    fn content_len(content: &IndexSet<T>) -> usize {
        content.len()
    }
}

/// A positional change in a list.
///
/// Indices refer to the list as it is just before the delta is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListDelta<T> {
    /// `value` was inserted so that it now sits at `index`.
    Insert { index: usize, value: T },
    /// The element `value` at `index` was removed.
    Remove { index: usize, value: T },
    /// The element at `index` changed from `old` to `new`.
    Update { index: usize, old: T, new: T },
}

impl<T> ListDelta<T> {
    /// The position the delta applies to.
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            ListDelta::Insert { index, .. }
            | ListDelta::Remove { index, .. }
            | ListDelta::Update { index, .. } => *index,
        }
    }

    /// The same delta at another position.
    pub(crate) fn at(self, index: usize) -> Self {
        match self {
            ListDelta::Insert { value, .. } => ListDelta::Insert { index, value },
            ListDelta::Remove { value, .. } => ListDelta::Remove { index, value },
            ListDelta::Update { old, new, .. } => ListDelta::Update { index, old, new },
        }
    }
}

impl<T: Value> Delta for ListDelta<T> {
    type Content = Vec<T>;

    fn apply(&self, content: &mut Vec<T>) {
        match self {
            ListDelta::Insert { index, value } => content.insert(*index, value.clone()),
            ListDelta::Remove { index, .. } => {
                content.remove(*index);
            }
            ListDelta::Update { index, new, .. } => content[*index] = new.clone(),
        }
    }

    fn bootstrap(content: &Vec<T>) -> Vec<Self> {
        content
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, value)| ListDelta::Insert { index, value })
            .collect()
    }

    fn diff(old: &Vec<T>, new: &Vec<T>) -> Vec<Self> {
        let shared = old.len().min(new.len());
        let mut deltas: Vec<Self> = old
            .iter()
            .zip(new)
            .enumerate()
            .map(|(index, (old, new))| ListDelta::Update {
                index,
                old: old.clone(),
                new: new.clone(),
            })
            .collect();
        // Trim from the back so every index stays valid as deltas apply.
        for index in (shared..old.len()).rev() {
            deltas.push(ListDelta::Remove {
                index,
                value: old[index].clone(),
            });
        }
        for (index, value) in new.iter().enumerate().skip(shared) {
            deltas.push(ListDelta::Insert {
                index,
                value: value.clone(),
            });
        }
        deltas
    }

    fn size_change(&self) -> isize {
        match self {
            ListDelta::Insert { .. } => 1,
            ListDelta::Remove { .. } => -1,
            ListDelta::Update { .. } => 0,
        }
    }

    fn content_len(content: &Vec<T>) -> usize {
        content.len()
    }
}

/// A keyed change in a map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapDelta<K, V> {
    /// `key` was bound to `value`.
    Insert { key: K, value: V },
    /// `key`, bound to `value`, was removed.
    Remove { key: K, value: V },
    /// The value bound to `key` changed from `old` to `new`.
    Update { key: K, old: V, new: V },
}

impl<K, V> MapDelta<K, V> {
    /// The key that changed.
    #[inline]
    pub fn key(&self) -> &K {
        match self {
            MapDelta::Insert { key, .. }
            | MapDelta::Remove { key, .. }
            | MapDelta::Update { key, .. } => key,
        }
    }
}

impl<K: Element, V: Value> Delta for MapDelta<K, V> {
    type Content = IndexMap<K, V>;

    fn apply(&self, content: &mut IndexMap<K, V>) {
        match self {
            MapDelta::Insert { key, value } => {
                content.insert(key.clone(), value.clone());
            }
            MapDelta::Remove { key, .. } => {
                content.swap_remove(key);
            }
            MapDelta::Update { key, new, .. } => {
                content.insert(key.clone(), new.clone());
            }
        }
    }

    fn bootstrap(content: &IndexMap<K, V>) -> Vec<Self> {
        content
            .iter()
            .map(|(key, value)| MapDelta::Insert {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    fn diff(old: &IndexMap<K, V>, new: &IndexMap<K, V>) -> Vec<Self> {
        let mut deltas = Vec::new();
        for (key, value) in old {
            match new.get(key) {
                Some(rebound) => deltas.push(MapDelta::Update {
                    key: key.clone(),
                    old: value.clone(),
                    new: rebound.clone(),
                }),
                None => deltas.push(MapDelta::Remove {
                    key: key.clone(),
                    value: value.clone(),
                }),
            }
        }
        for (key, value) in new {
            if !old.contains_key(key) {
                deltas.push(MapDelta::Insert {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        deltas
    }

    fn size_change(&self) -> isize {
        match self {
            MapDelta::Insert { .. } => 1,
            MapDelta::Remove { .. } => -1,
            MapDelta::Update { .. } => 0,
        }
    }

    fn content_len(content: &IndexMap<K, V>) -> usize {
        content.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bootstrap_rebuilds_the_content() {
        let content: IndexSet<i32> = [3, 1, 2].into_iter().collect();
        let deltas = SetDelta::bootstrap(&content);
        assert!(deltas.iter().all(SetDelta::is_add));

        let mut rebuilt = IndexSet::new();
        apply_all(&mut rebuilt, &deltas);
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn list_deltas_are_positional() {
        let mut list = vec!['a', 'c'];
        apply_all(
            &mut list,
            &[
                ListDelta::Insert { index: 1, value: 'b' },
                ListDelta::Update { index: 0, old: 'a', new: 'A' },
                ListDelta::Remove { index: 2, value: 'c' },
            ],
        );
        assert_eq!(list, vec!['A', 'b']);
    }

    #[test]
    fn list_at_moves_a_delta() {
        let delta = ListDelta::Update { index: 4, old: 1, new: 2 };
        assert_eq!(delta.at(1), ListDelta::Update { index: 1, old: 1, new: 2 });
    }

    #[test]
    fn map_update_rebinds_the_key() {
        let mut map = IndexMap::new();
        apply_all(
            &mut map,
            &[
                MapDelta::Insert { key: "a", value: 1 },
                MapDelta::Update { key: "a", old: 1, new: 5 },
                MapDelta::Insert { key: "b", value: 2 },
                MapDelta::Remove { key: "b", value: 2 },
            ],
        );
        assert_eq!(map.len(), 1);
        assert_eq!(map["a"], 5);
    }

    #[test]
    fn diffs_turn_old_content_into_new() {
        let old: IndexSet<i32> = [1, 2, 3].into_iter().collect();
        let new: IndexSet<i32> = [2, 4].into_iter().collect();
        let mut set = old.clone();
        apply_all(&mut set, &SetDelta::diff(&old, &new));
        assert_eq!(set, new);

        let old = vec!['a', 'b', 'c', 'd'];
        let new = vec!['x', 'b'];
        let mut list = old.clone();
        apply_all(&mut list, &ListDelta::diff(&old, &new));
        assert_eq!(list, new);
        let mut list = new.clone();
        apply_all(&mut list, &ListDelta::diff(&new, &old));
        assert_eq!(list, old);

        let old: IndexMap<&str, i32> = [("a", 1), ("b", 2)].into_iter().collect();
        let new: IndexMap<&str, i32> = [("b", 3), ("c", 4)].into_iter().collect();
        let deltas = MapDelta::diff(&old, &new);
        assert!(deltas.contains(&MapDelta::Remove { key: "a", value: 1 }));
        assert!(deltas.contains(&MapDelta::Update { key: "b", old: 2, new: 3 }));
        let mut map = old.clone();
        apply_all(&mut map, &deltas);
        assert_eq!(map, new);
    }

    #[test]
    fn size_changes() {
        assert_eq!(SetDelta::Add(1).size_change(), 1);
        assert_eq!(ListDelta::Update { index: 0, old: 1, new: 2 }.size_change(), 0);
        assert_eq!(MapDelta::Remove { key: 1, value: () }.size_change(), -1);
    }

    #[test]
    fn deltas_serialize_as_tagged_enums() {
        let delta = MapDelta::Update { key: "k".to_string(), old: 1, new: 2 };
        let json = serde_json::to_string(&delta).unwrap();
        assert_eq!(json, r#"{"Update":{"key":"k","old":1,"new":2}}"#);

        let back: MapDelta<String, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, delta);
    }
}
