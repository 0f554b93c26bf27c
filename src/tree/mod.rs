// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod diff;
pub mod ingest;
pub mod range;

use crate::{
    coding::DecodeError,
    node::{Entries, Header, Node},
    store::Store,
    Slice, UserValue,
};
use std::ops::Bound;

/// Default number of entries per B-tree node.
pub const DEFAULT_CAPACITY: usize = 32;

/// An immutable, persistent, copy-on-write B-tree
///
/// A `Tree` is a small value: a store handle plus a root offset and some
/// counters. Mutating operations append the rewritten path to the store and
/// return a *new* `Tree`; the old one keeps describing the exact state it
/// always did, which is what makes snapshots free.
///
/// Nothing becomes visible to other readers of the same file until a
/// [`Header`] naming the new root is committed.
#[derive(Clone)]
pub struct Tree {
    store: Store,

    /// Offset of the root node
    root: u64,

    /// Live (non-tombstoned) entries reachable from the root
    size: u64,

    /// Write events since the last bulk load
    dirt: u64,

    capacity: usize,
}

/// Where a key's path ends while descending the tree.
struct Path {
    /// Branch entry lists from the root down, with the index descended into
    frames: Vec<(Entries, usize)>,

    /// The target leaf's entries
    leaf: Entries,
}

fn child_index(entries: &Entries, key: &[u8]) -> usize {
    // Largest separator <= key; the first child doubles as the sentinel
    // for keys below every separator
    entries
        .partition_point(|(sep, _)| sep.as_ref() <= key)
        .saturating_sub(1)
}

fn find_key(entries: &Entries, key: &[u8]) -> Result<usize, usize> {
    entries.binary_search_by(|(k, _)| k.as_ref().cmp(key))
}

impl Tree {
    /// Creates an empty tree in `store` by appending an empty leaf root.
    pub fn create(store: Store, capacity: usize) -> crate::Result<Self> {
        let root = store.put_node(&Node::Leaf(vec![]))?;

        Ok(Self {
            store,
            root,
            size: 0,
            dirt: 0,
            capacity,
        })
    }

    /// Reconstructs the tree a committed header points at.
    pub fn from_header(store: Store, header: Header, capacity: usize) -> Self {
        Self {
            store,
            root: header.location,
            size: header.size,
            dirt: header.dirt,
            capacity,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Offset of the root node.
    #[must_use]
    pub fn root_location(&self) -> u64 {
        self.root
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Write events since the last bulk load.
    #[must_use]
    pub fn dirt(&self) -> u64 {
        self.dirt
    }

    /// Fraction of the tree's storage a compaction could reclaim.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn dirt_factor(&self) -> f32 {
        if self.dirt == 0 {
            0.0
        } else {
            self.dirt as f32 / (self.size + self.dirt) as f32
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn corrupt(what: &'static str) -> crate::Error {
        crate::Error::Decode(DecodeError::InvalidHeader(what))
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<UserValue>> {
        let mut node = self.store.get_node(self.root)?;

        loop {
            match &*node {
                Node::Branch(entries) => {
                    let Some((_, child)) = entries.get(child_index(entries, key)) else {
                        return Err(Self::corrupt("branch node has no children"));
                    };
                    node = self.store.get_node(*child)?;
                }
                Node::Leaf(entries) => {
                    return match find_key(entries, key) {
                        Ok(idx) => {
                            // Unwrap cannot fail, binary_search returned the index
                            #[allow(clippy::expect_used)]
                            let (_, loc) = entries.get(idx).expect("index is in bounds");
                            self.resolve_terminal(*loc)
                        }
                        Err(_) => Ok(None),
                    };
                }
                _ => return Err(Self::corrupt("expected an index node")),
            }
        }
    }

    /// Returns `true` if the key maps to a live value.
    pub fn contains_key(&self, key: &[u8]) -> crate::Result<bool> {
        self.get(key).map(|x| x.is_some())
    }

    /// Reads the terminal node behind a leaf entry.
    fn resolve_terminal(&self, loc: u64) -> crate::Result<Option<UserValue>> {
        match &*self.store.get_node(loc)? {
            Node::Value(bytes) => Ok(Some(bytes.clone())),
            Node::Tombstone => Ok(None),
            _ => Err(Self::corrupt("expected a terminal node")),
        }
    }

    /// Returns `true` if some node or terminal on the path to `key` sits at
    /// an offset greater than `mark`.
    ///
    /// Because the file is append-only, a path that never rises above `mark`
    /// proves the entry is byte-identical to what a root from back then saw.
    /// The reverse does not hold, so `true` only means "cannot rule a change
    /// out".
    pub fn modified_since(&self, key: &[u8], mark: u64) -> crate::Result<bool> {
        let mut loc = self.root;

        loop {
            if loc <= mark {
                return Ok(false);
            }

            match &*self.store.get_node(loc)? {
                Node::Branch(entries) => {
                    let Some((_, child)) = entries.get(child_index(entries, key)) else {
                        return Err(Self::corrupt("branch node has no children"));
                    };
                    loc = *child;
                }
                Node::Leaf(entries) => {
                    return match find_key(entries, key) {
                        Ok(idx) => {
                            #[allow(clippy::expect_used)]
                            let (_, loc) = entries.get(idx).expect("index is in bounds");
                            Ok(*loc > mark)
                        }
                        // The key is absent from the rewritten leaf; it may
                        // have been removed, so no proof is possible
                        Err(_) => Ok(true),
                    };
                }
                _ => return Err(Self::corrupt("expected an index node")),
            }
        }
    }

    /// Inserts or replaces a key, returning the updated tree.
    pub fn insert(&self, key: Slice, value: Slice) -> crate::Result<Self> {
        self.put_terminal(key, Node::Value(value))
    }

    /// Inserts a key that must not currently map to a value.
    ///
    /// Nothing is appended when the key exists; a tombstoned key counts as
    /// absent.
    pub fn insert_new(&self, key: Slice, value: Slice) -> crate::Result<Self> {
        if self.contains_key(&key)? {
            return Err(crate::Error::AlreadyExists);
        }

        self.insert(key, value)
    }

    /// Logically deletes a key by pointing its leaf entry at a tombstone.
    ///
    /// Used instead of [`Tree::remove`] while a compaction is running, so
    /// the deletion stays observable to the compactor's diff.
    pub fn mark_removed(&self, key: Slice) -> crate::Result<Self> {
        if !self.contains_key(&key)? {
            return Ok(self.clone());
        }

        self.put_terminal(key, Node::Tombstone)
    }

    fn put_terminal(&self, key: Slice, terminal: Node) -> crate::Result<Self> {
        let path = self.path_to_leaf(&key)?;
        let mut leaf = path.leaf;

        let displaced = match find_key(&leaf, &key) {
            Ok(idx) => leaf.get(idx).map(|(_, loc)| *loc),
            Err(_) => None,
        };

        let was_live = match displaced {
            Some(loc) => self.resolve_terminal(loc)?.is_some(),
            None => false,
        };
        let is_live = matches!(terminal, Node::Value(_));

        let terminal_loc = self.store.put_node(&terminal)?;

        match find_key(&leaf, &key) {
            Ok(idx) => {
                if let Some(slot) = leaf.get_mut(idx) {
                    *slot = (key, terminal_loc);
                }
            }
            Err(idx) => leaf.insert(idx, (key, terminal_loc)),
        }

        let root = self.rebalance(path.frames, leaf, true)?;

        let mut size = self.size;
        if is_live && !was_live {
            size += 1;
        } else if !is_live && was_live {
            size -= 1;
        }

        Ok(Self {
            store: self.store.clone(),
            root,
            size,
            dirt: self.dirt + 1,
            capacity: self.capacity,
        })
    }

    /// Physically removes a key's leaf entry.
    ///
    /// Removing an absent key is a no-op that appends nothing.
    pub fn remove(&self, key: &[u8]) -> crate::Result<Self> {
        let path = self.path_to_leaf(key)?;
        let mut leaf = path.leaf;

        let Ok(idx) = find_key(&leaf, key) else {
            return Ok(self.clone());
        };

        let (_, terminal_loc) = leaf.remove(idx);
        let was_live = self.resolve_terminal(terminal_loc)?.is_some();

        let root = self.rebalance(path.frames, leaf, true)?;

        Ok(Self {
            store: self.store.clone(),
            root,
            size: if was_live { self.size - 1 } else { self.size },
            dirt: self.dirt + 1,
            capacity: self.capacity,
        })
    }

    /// Produces an empty tree rooted at a fresh empty leaf.
    pub fn clear(&self) -> crate::Result<Self> {
        let root = self.store.put_node(&Node::Leaf(vec![]))?;

        Ok(Self {
            store: self.store.clone(),
            root,
            size: 0,
            dirt: self.dirt + 1,
            capacity: self.capacity,
        })
    }

    /// Appends a header naming this tree's root, which atomically publishes
    /// it to recovery. Returns the header's location.
    pub fn commit(&self) -> crate::Result<u64> {
        self.store.put_header(&Header {
            size: self.size,
            location: self.root,
            dirt: self.dirt,
        })
    }

    /// Lazily iterates `(key, value)` pairs within the given bounds.
    #[must_use]
    pub fn range(&self, lo: Bound<Slice>, hi: Bound<Slice>) -> range::Range {
        range::Range::new(self.clone(), lo, hi)
    }

    fn path_to_leaf(&self, key: &[u8]) -> crate::Result<Path> {
        let mut frames = vec![];
        let mut node = self.store.get_node(self.root)?;

        loop {
            match &*node {
                Node::Branch(entries) => {
                    let idx = child_index(entries, key);
                    let Some((_, child)) = entries.get(idx) else {
                        return Err(Self::corrupt("branch node has no children"));
                    };
                    let child = *child;

                    frames.push((entries.clone(), idx));
                    node = self.store.get_node(child)?;
                }
                Node::Leaf(entries) => {
                    return Ok(Path {
                        frames,
                        leaf: entries.clone(),
                    });
                }
                _ => return Err(Self::corrupt("expected an index node")),
            }
        }
    }

    /// Minimum entry count of a non-root node.
    fn min_entries(&self) -> usize {
        (self.capacity + 1) / 2
    }

    fn write_level(&self, entries: Entries, is_leaf: bool) -> crate::Result<(Slice, u64)> {
        #[allow(clippy::expect_used)]
        let sep = entries.first().expect("node is not empty").0.clone();

        let node = if is_leaf {
            Node::Leaf(entries)
        } else {
            Node::Branch(entries)
        };

        Ok((sep, self.store.put_node(&node)?))
    }

    /// Writes the modified entry lists back to the store bottom-up,
    /// splitting and merging along the way, and returns the new root
    /// location.
    fn rebalance(
        &self,
        mut frames: Vec<(Entries, usize)>,
        entries: Entries,
        leaf_level: bool,
    ) -> crate::Result<u64> {
        let mut current = entries;
        let mut is_leaf = leaf_level;

        while let Some((mut parent, idx)) = frames.pop() {
            let (splice_from, replacement) = if current.len() > self.capacity {
                // Overflow: split in half
                let right = current.split_off(current.len() / 2);

                (
                    idx,
                    vec![
                        self.write_level(current, is_leaf)?,
                        self.write_level(right, is_leaf)?,
                    ],
                )
            } else if current.is_empty() {
                // The node lost its last entry; unlink it entirely
                (idx, vec![])
            } else if current.len() < self.min_entries() && idx > 0 {
                // Underflow: merge into the left sibling, re-splitting if
                // the concatenation overflows. Both slots get respliced.
                let Some(&(_, left_loc)) = parent.get(idx - 1) else {
                    return Err(Self::corrupt("missing left sibling"));
                };

                let mut merged = self.store.get_node(left_loc)?.entries().clone();
                merged.append(&mut current);

                let replacement = if merged.len() > self.capacity {
                    let right = merged.split_off(merged.len() / 2);

                    vec![
                        self.write_level(merged, is_leaf)?,
                        self.write_level(right, is_leaf)?,
                    ]
                } else {
                    vec![self.write_level(merged, is_leaf)?]
                };

                (idx - 1, replacement)
            } else {
                (idx, vec![self.write_level(current, is_leaf)?])
            };

            parent.splice(splice_from..=idx, replacement);

            current = parent;
            is_leaf = false;
        }

        self.write_root(current, is_leaf)
    }

    fn write_root(&self, mut entries: Entries, is_leaf: bool) -> crate::Result<u64> {
        if entries.len() > self.capacity {
            // Grow a new root on top
            let right = entries.split_off(entries.len() / 2);

            let children = vec![
                self.write_level(entries, is_leaf)?,
                self.write_level(right, is_leaf)?,
            ];

            return self.store.put_node(&Node::Branch(children));
        }

        if !is_leaf {
            if entries.is_empty() {
                // Every child vanished; the tree is empty now
                return self.store.put_node(&Node::Leaf(vec![]));
            }

            if entries.len() == 1 {
                // A branch root with a single child carries no information;
                // its child (written further down, possibly collapsible
                // itself) becomes the root
                #[allow(clippy::expect_used)]
                let (_, mut root) = *entries.first().expect("checked length");

                loop {
                    match &*self.store.get_node(root)? {
                        Node::Branch(children) if children.len() == 1 => {
                            #[allow(clippy::expect_used)]
                            let (_, child) = children.first().expect("checked length");
                            root = *child;
                        }
                        _ => return Ok(root),
                    }
                }
            }
        }

        let node = if is_leaf {
            Node::Leaf(entries)
        } else {
            Node::Branch(entries)
        };

        self.store.put_node(&node)
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tree(root={}, size={}, dirt={})",
            self.root, self.size, self.dirt
        )
    }
}
