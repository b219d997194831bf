//! Folds
//!
//! Reduce a collection to an [`Adaptive`] scalar. The fold keeps a private
//! reader on the collection, so each recomputation costs only the deltas
//! since the previous one.

use super::delta::{Delta, Element, MapDelta, Value};
use super::node::Collection;
use crate::cell::Adaptive;

impl<D: Delta> Collection<D> {
    /// An adaptive cell holding `init` folded over every delta of the
    /// collection, in order.
    ///
    /// The first force folds the bootstrap of the current content. An
    /// unforced fold still holds its reader, so the collection retains the
    /// deltas it has not folded yet. If `step` panics, the panic is the
    /// cached result until the collection changes; the next recomputation
    /// folds the whole content again, starting from `init`.
    ///
    /// ```
    /// use ripple_core::{Runtime, SetDelta};
    ///
    /// let rt = Runtime::new();
    /// let scores = rt.changeable_set([3, 5]);
    /// let total = scores.fold(0, |sum, delta: &SetDelta<i32>| match delta {
    ///     SetDelta::Add(n) => *sum += n,
    ///     SetDelta::Remove(n) => *sum -= n,
    /// });
    /// assert_eq!(total.force().unwrap(), 8);
    ///
    /// rt.transact(|tx| scores.insert(tx, 10)).unwrap();
    /// assert_eq!(total.force().unwrap(), 18);
    /// ```
    pub fn fold<A, F>(&self, init: A, mut step: F) -> Adaptive<A>
    where
        A: Clone + Send + Sync + 'static,
        F: FnMut(&mut A, &D) + Send + 'static,
    {
        let reader = self.subscribe();
        let mut acc = init.clone();
        // False while a step is folding; stays false if the step panics.
        let mut complete = true;

        Adaptive::try_new(self.runtime(), move || {
            if !complete {
                reader.rewind();
                acc = init.clone();
                complete = true;
            }
            let deltas = reader.pull()?;
            complete = false;
            for delta in &deltas {
                step(&mut acc, delta);
            }
            complete = true;
            Ok(acc.clone())
        })
    }

    /// The number of elements, kept up to date from the deltas.
    pub fn len(&self) -> Adaptive<usize> {
        self.fold(0usize, |len, delta| {
            *len = len.saturating_add_signed(delta.size_change());
        })
    }
}

impl<K: Element, V: Value> Collection<MapDelta<K, V>> {
    /// The value bound to `key`, if any.
    pub fn get(&self, key: K) -> Adaptive<Option<V>> {
        self.fold(None, move |slot, delta| {
            if *delta.key() != key {
                return;
            }
            *slot = match delta {
                MapDelta::Insert { value, .. } => Some(value.clone()),
                MapDelta::Update { new, .. } => Some(new.clone()),
                MapDelta::Remove { .. } => None,
            };
        })
    }
}
