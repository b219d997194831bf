//! Order-statistics index for list filtering.
//!
//! An implicit treap over the positions of the input list. Each position
//! carries a flag (does the element pass the filter?) and each subtree keeps
//! its size and its number of set flags, so translating an input position
//! into an output position is a rank query in expected O(log n).

type Link = Option<Box<Node>>;

struct Node {
    priority: u64,
    flag: bool,
    size: usize,
    count: usize,
    left: Link,
    right: Link,
}

impl Node {
    fn new(flag: bool, priority: u64) -> Box<Self> {
        Box::new(Self {
            priority,
            flag,
            size: 1,
            count: flag as usize,
            left: None,
            right: None,
        })
    }

    fn update(&mut self) {
        self.size = 1 + size(&self.left) + size(&self.right);
        self.count = self.flag as usize + count(&self.left) + count(&self.right);
    }
}

fn size(link: &Link) -> usize {
    link.as_ref().map_or(0, |node| node.size)
}

fn count(link: &Link) -> usize {
    link.as_ref().map_or(0, |node| node.count)
}

/// Split into the first `k` positions and the rest.
fn split(link: Link, k: usize) -> (Link, Link) {
    match link {
        None => (None, None),
        Some(mut node) => {
            let left_size = size(&node.left);
            if k <= left_size {
                let (l, r) = split(node.left.take(), k);
                node.left = r;
                node.update();
                (l, Some(node))
            } else {
                let (l, r) = split(node.right.take(), k - left_size - 1);
                node.right = l;
                node.update();
                (Some(node), r)
            }
        }
    }
}

fn merge(a: Link, b: Link) -> Link {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(mut a), Some(mut b)) => {
            if a.priority > b.priority {
                a.right = merge(a.right.take(), Some(b));
                a.update();
                Some(a)
            } else {
                b.left = merge(Some(a), b.left.take());
                b.update();
                Some(b)
            }
        }
    }
}

/// Flags indexed by position, with rank queries.
pub(crate) struct PositionIndex {
    root: Link,
    seed: u64,
}

impl PositionIndex {
    pub(crate) fn new() -> Self {
        Self {
            root: None,
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub(crate) fn len(&self) -> usize {
        size(&self.root)
    }

    /// Number of set flags.
    pub(crate) fn count(&self) -> usize {
        count(&self.root)
    }

    // xorshift64
    fn next_priority(&mut self) -> u64 {
        let mut x = self.seed;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed = x;
        x
    }

    /// Number of set flags before `pos`.
    pub(crate) fn rank(&self, pos: usize) -> usize {
        let mut rank = 0;
        let mut pos = pos;
        let mut link = &self.root;
        while let Some(node) = link {
            let left_size = size(&node.left);
            if pos <= left_size {
                link = &node.left;
            } else {
                rank += count(&node.left) + node.flag as usize;
                pos -= left_size + 1;
                link = &node.right;
            }
        }
        rank
    }

    pub(crate) fn get(&self, pos: usize) -> Option<bool> {
        let mut pos = pos;
        let mut link = &self.root;
        while let Some(node) = link {
            let left_size = size(&node.left);
            if pos < left_size {
                link = &node.left;
            } else if pos == left_size {
                return Some(node.flag);
            } else {
                pos -= left_size + 1;
                link = &node.right;
            }
        }
        None
    }

    /// Insert a flag at `pos`, returning its rank.
    pub(crate) fn insert(&mut self, pos: usize, flag: bool) -> usize {
        debug_assert!(pos <= self.len());
        let priority = self.next_priority();
        let (left, right) = split(self.root.take(), pos);
        let rank = count(&left);
        self.root = merge(merge(left, Some(Node::new(flag, priority))), right);
        rank
    }

    /// Remove the flag at `pos`, returning it and its rank.
    pub(crate) fn remove(&mut self, pos: usize) -> Option<(bool, usize)> {
        let (left, rest) = split(self.root.take(), pos);
        let (middle, right) = split(rest, 1);
        let rank = count(&left);
        let removed = middle.map(|node| (node.flag, rank));
        self.root = merge(left, right);
        removed
    }

    /// Replace the flag at `pos`, returning the old flag and the rank.
    pub(crate) fn set(&mut self, pos: usize, flag: bool) -> Option<(bool, usize)> {
        let (left, rest) = split(self.root.take(), pos);
        let (middle, right) = split(rest, 1);
        let rank = count(&left);
        let result = middle.map(|mut node| {
            let old = node.flag;
            node.flag = flag;
            node.update();
            (old, node)
        });
        let (old, middle) = match result {
            Some((old, node)) => (Some((old, rank)), Some(node)),
            None => (None, None),
        };
        self.root = merge(merge(left, middle), right);
        old
    }
}

impl Default for PositionIndex {
    fn default() -> Self {
        Self::new()
    }
}
