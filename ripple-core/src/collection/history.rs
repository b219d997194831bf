//! Per-reader delta history.
//!
//! Every collection keeps one shared log of the deltas it has emitted and
//! one cursor per registered reader. A reader's pending deltas are the log
//! suffix after its cursor. Entries behind every cursor are trimmed, so the
//! log holds exactly what the slowest reader still needs.
//!
//! A newly registered reader has no cursor. Its first drain returns a
//! bootstrap built from the content at that moment, which already includes
//! every earlier change, and places the cursor at the end of the log.

use std::collections::VecDeque;

use indexmap::IndexMap;

use super::delta::Delta;

/// Identifies one reader of one collection.
pub(crate) type ReaderId = u64;

pub(crate) struct History<D> {
    log: VecDeque<D>,
    /// Sequence number of `log[0]`.
    base: u64,
    /// `None` until the reader's first drain.
    cursors: IndexMap<ReaderId, Option<u64>>,
    next_reader: ReaderId,
    warning_threshold: Option<usize>,
    warned: bool,
}

impl<D: Delta> History<D> {
    pub(crate) fn new(warning_threshold: Option<usize>) -> Self {
        Self {
            log: VecDeque::new(),
            base: 0,
            cursors: IndexMap::new(),
            next_reader: 0,
            warning_threshold,
            warned: false,
        }
    }

    fn end(&self) -> u64 {
        self.base + self.log.len() as u64
    }

    pub(crate) fn register(&mut self) -> ReaderId {
        let id = self.next_reader;
        self.next_reader += 1;
        self.cursors.insert(id, None);
        id
    }

    pub(crate) fn unregister(&mut self, reader: ReaderId) {
        if self.cursors.swap_remove(&reader).is_some() {
            self.trim();
        }
    }

    /// Drop the reader's cursor so its next drain bootstraps again.
    pub(crate) fn rewind(&mut self, reader: ReaderId) {
        if let Some(cursor) = self.cursors.get_mut(&reader) {
            *cursor = None;
            self.trim();
        }
    }

    pub(crate) fn readers(&self) -> usize {
        self.cursors.len()
    }

    /// Number of deltas currently held in the log.
    pub(crate) fn retained(&self) -> usize {
        self.log.len()
    }

    /// Logged deltas the reader has not drained yet.
    pub(crate) fn pending(&self, reader: ReaderId) -> usize {
        match self.cursors.get(&reader) {
            Some(Some(cursor)) => (self.end() - cursor) as usize,
            _ => 0,
        }
    }

    /// Append deltas for every reader that has a cursor.
    pub(crate) fn record(&mut self, deltas: Vec<D>) {
        if deltas.is_empty() {
            return;
        }
        if !self.cursors.values().any(Option::is_some) {
            // Nobody will ever read these; later readers bootstrap instead.
            self.base += deltas.len() as u64;
            debug_assert!(self.log.is_empty());
            return;
        }
        self.log.extend(deltas);
        self.check_threshold();
    }

    /// Take the reader's pending deltas, bootstrapping from `content` on the
    /// first call.
    pub(crate) fn drain(&mut self, reader: ReaderId, content: &D::Content) -> Vec<D> {
        let end = self.end();
        let Some(cursor) = self.cursors.get_mut(&reader) else {
            return Vec::new();
        };

        let drained = match cursor.replace(end) {
            None => D::bootstrap(content),
            Some(from) => {
                let start = (from - self.base) as usize;
                self.log.range(start..).cloned().collect()
            }
        };
        self.trim();
        drained
    }

    fn trim(&mut self) {
        let oldest = self.cursors.values().flatten().min().copied();
        match oldest {
            Some(oldest) => {
                let drop = (oldest - self.base) as usize;
                self.log.drain(..drop);
                self.base = oldest;
            }
            None => {
                self.base = self.end();
                self.log.clear();
            }
        }
        self.check_threshold();
    }

    fn check_threshold(&mut self) {
        let Some(threshold) = self.warning_threshold else {
            return;
        };
        if self.log.len() > threshold {
            if !self.warned {
                self.warned = true;
                tracing::warn!(
                    retained = self.log.len(),
                    threshold,
                    readers = self.cursors.len(),
                    "delta history exceeds threshold; a reader is not pulling"
                );
            }
        } else {
            self.warned = false;
        }
    }
}
