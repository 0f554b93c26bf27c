// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::DecodeError,
    node::Node,
    tree::Tree,
    KvPair, Slice,
};
use std::{collections::VecDeque, ops::Bound};

/// Calculates the exclusive upper bound of a prefix scan.
///
/// All-0xFF prefixes have no finite upper bound.
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Bound<Slice> {
    let mut end = prefix.to_vec();

    while let Some(byte) = end.last_mut() {
        if *byte < 255 {
            *byte += 1;
            return Bound::Excluded(end.into());
        }

        end.pop();
    }

    Bound::Unbounded
}

/// Converts a prefix to range bounds.
pub(crate) fn prefix_to_bounds(prefix: &[u8]) -> (Bound<Slice>, Bound<Slice>) {
    if prefix.is_empty() {
        return (Bound::Unbounded, Bound::Unbounded);
    }

    (Bound::Included(prefix.into()), prefix_upper_bound(prefix))
}

fn key_above_lower(key: &Slice, lo: &Bound<Slice>) -> bool {
    match lo {
        Bound::Included(l) => key >= l,
        Bound::Excluded(l) => key > l,
        Bound::Unbounded => true,
    }
}

fn key_below_upper(key: &Slice, hi: &Bound<Slice>) -> bool {
    match hi {
        Bound::Included(h) => key <= h,
        Bound::Excluded(h) => key < h,
        Bound::Unbounded => true,
    }
}

struct Frame {
    entries: VecDeque<(Slice, u64)>,
    is_leaf: bool,
}

/// Directional cursor over the entries of one root within bounds
///
/// Subtrees whose separator interval cannot intersect the bounds are pruned
/// when their parent is expanded; the leaf level filters exactly.
struct Walker {
    tree: Tree,
    lo: Bound<Slice>,
    hi: Bound<Slice>,
    descending: bool,
    stack: Vec<Frame>,
    initialized: bool,
}

impl Walker {
    fn new(tree: Tree, lo: Bound<Slice>, hi: Bound<Slice>, descending: bool) -> Self {
        Self {
            tree,
            lo,
            hi,
            descending,
            stack: vec![],
            initialized: false,
        }
    }

    fn push_node(&mut self, loc: u64) -> crate::Result<()> {
        let node = self.tree.store().get_node(loc)?;

        let frame = match &*node {
            Node::Branch(entries) => {
                let mut kept = VecDeque::with_capacity(entries.len());

                for (idx, (sep, child)) in entries.iter().enumerate() {
                    // The child covers [sep, next sep); the first child is
                    // the sentinel and is unbounded below
                    let below_upper = idx == 0 || key_below_upper(sep, &self.hi);

                    let above_lower = match entries.get(idx + 1) {
                        Some((next_sep, _)) => match &self.lo {
                            Bound::Included(l) | Bound::Excluded(l) => next_sep > l,
                            Bound::Unbounded => true,
                        },
                        // Last child is unbounded above
                        None => true,
                    };

                    if below_upper && above_lower {
                        kept.push_back((sep.clone(), *child));
                    }
                }

                Frame {
                    entries: kept,
                    is_leaf: false,
                }
            }
            Node::Leaf(entries) => Frame {
                entries: entries
                    .iter()
                    .filter(|(key, _)| {
                        key_above_lower(key, &self.lo) && key_below_upper(key, &self.hi)
                    })
                    .cloned()
                    .collect(),
                is_leaf: true,
            },
            _ => {
                return Err(crate::Error::Decode(DecodeError::InvalidHeader(
                    "expected an index node",
                )))
            }
        };

        self.stack.push(frame);

        Ok(())
    }

    fn next_kv(&mut self) -> Option<crate::Result<KvPair>> {
        if !self.initialized {
            self.initialized = true;
            fail_iter!(self.push_node(self.tree.root_location()));
        }

        loop {
            let frame = self.stack.last_mut()?;
            let is_leaf = frame.is_leaf;

            let item = if self.descending {
                frame.entries.pop_back()
            } else {
                frame.entries.pop_front()
            };

            let Some((key, loc)) = item else {
                self.stack.pop();
                continue;
            };

            if is_leaf {
                match fail_iter!(self.tree.resolve_terminal(loc)) {
                    Some(value) => return Some(Ok((key, value))),
                    // Tombstone
                    None => continue,
                }
            }

            fail_iter!(self.push_node(loc));
        }
    }
}

/// Lazy, bound-pruned iterator over the live `(key, value)` pairs of one root
///
/// The iterator owns its root, so it is unaffected by writes committed while
/// it runs. Both iteration ends are lazy: a purely forward scan never touches
/// the machinery for the reverse direction.
pub struct Range {
    tree: Tree,
    lo: Bound<Slice>,
    hi: Bound<Slice>,

    front: Option<Walker>,
    back: Option<Walker>,

    /// Last key handed out by the front/back, to detect the cursors meeting
    front_key: Option<Slice>,
    back_key: Option<Slice>,

    exhausted: bool,
}

impl Range {
    pub(crate) fn new(tree: Tree, lo: Bound<Slice>, hi: Bound<Slice>) -> Self {
        Self {
            tree,
            lo,
            hi,
            front: None,
            back: None,
            front_key: None,
            back_key: None,
            exhausted: false,
        }
    }
}

impl Iterator for Range {
    type Item = crate::Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        if self.front.is_none() {
            self.front = Some(Walker::new(
                self.tree.clone(),
                self.lo.clone(),
                self.hi.clone(),
                false,
            ));
        }

        #[allow(clippy::expect_used)]
        let walker = self.front.as_mut().expect("was initialized above");

        match walker.next_kv() {
            None => {
                self.exhausted = true;
                None
            }
            Some(Err(e)) => {
                self.exhausted = true;
                Some(Err(e))
            }
            Some(Ok((key, value))) => {
                // Meeting the back cursor means the range is drained
                if let Some(back_key) = &self.back_key {
                    if key >= *back_key {
                        self.exhausted = true;
                        return None;
                    }
                }

                self.front_key = Some(key.clone());
                Some(Ok((key, value)))
            }
        }
    }
}

impl DoubleEndedIterator for Range {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        if self.back.is_none() {
            self.back = Some(Walker::new(
                self.tree.clone(),
                self.lo.clone(),
                self.hi.clone(),
                true,
            ));
        }

        #[allow(clippy::expect_used)]
        let walker = self.back.as_mut().expect("was initialized above");

        match walker.next_kv() {
            None => {
                self.exhausted = true;
                None
            }
            Some(Err(e)) => {
                self.exhausted = true;
                Some(Err(e))
            }
            Some(Ok((key, value))) => {
                if let Some(front_key) = &self.front_key {
                    if key <= *front_key {
                        self.exhausted = true;
                        return None;
                    }
                }

                self.back_key = Some(key.clone());
                Some(Ok((key, value)))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::{cache::Cache, store::Store};
    use std::sync::Arc;
    use test_log::test;

    fn seeded_tree(folder: &std::path::Path, count: u32) -> crate::Result<Tree> {
        let cache = Arc::new(Cache::with_capacity(10_000));
        let store = Store::open(folder.join("0.cub"), cache)?;
        let mut tree = Tree::create(store, 4)?;

        for i in 0..count {
            tree = tree.insert(key(i), key(i))?;
        }

        Ok(tree)
    }

    fn key(n: u32) -> Slice {
        Slice::from(format!("{n:04}"))
    }

    fn collect_keys(range: Range) -> crate::Result<Vec<Slice>> {
        range.map(|kv| kv.map(|(k, _)| k)).collect()
    }

    #[test]
    fn range_full_scan() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let tree = seeded_tree(folder.path(), 50)?;

        let keys = collect_keys(tree.range(Bound::Unbounded, Bound::Unbounded))?;

        assert_eq!(50, keys.len());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        Ok(())
    }

    #[test]
    fn range_rev_scan() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let tree = seeded_tree(folder.path(), 50)?;

        let keys = tree
            .range(Bound::Unbounded, Bound::Unbounded)
            .rev()
            .map(|kv| kv.map(|(k, _)| k))
            .collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(50, keys.len());
        assert!(keys.windows(2).all(|w| w[0] > w[1]));

        Ok(())
    }

    #[test]
    fn range_bounds() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let tree = seeded_tree(folder.path(), 50)?;

        let keys = collect_keys(tree.range(
            Bound::Included(key(10)),
            Bound::Included(key(20)),
        ))?;
        assert_eq!((10..=20).map(key).collect::<Vec<_>>(), keys);

        let keys = collect_keys(tree.range(
            Bound::Excluded(key(10)),
            Bound::Excluded(key(20)),
        ))?;
        assert_eq!((11..=19).map(key).collect::<Vec<_>>(), keys);

        Ok(())
    }

    #[test]
    fn range_empty_window() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let tree = seeded_tree(folder.path(), 50)?;

        let keys = collect_keys(tree.range(
            Bound::Excluded(key(10)),
            Bound::Excluded(key(11)),
        ))?;
        assert!(keys.is_empty());

        Ok(())
    }

    #[test]
    fn range_skips_tombstones() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let mut tree = seeded_tree(folder.path(), 10)?;

        tree = tree.mark_removed(key(3))?;
        tree = tree.mark_removed(key(7))?;

        let keys = collect_keys(tree.range(Bound::Unbounded, Bound::Unbounded))?;

        assert_eq!(8, keys.len());
        assert!(!keys.contains(&key(3)));
        assert!(!keys.contains(&key(7)));

        Ok(())
    }

    #[test]
    fn range_double_ended_meet() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let tree = seeded_tree(folder.path(), 10)?;

        let mut range = tree.range(Bound::Unbounded, Bound::Unbounded);

        let mut seen = vec![];

        loop {
            let Some(kv) = (if seen.len() % 2 == 0 {
                range.next()
            } else {
                range.next_back()
            }) else {
                break;
            };

            seen.push(kv?.0);
        }

        seen.sort();

        assert_eq!((0..10).map(key).collect::<Vec<_>>(), seen);

        Ok(())
    }

    #[test]
    fn range_unaffected_by_later_writes() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let tree = seeded_tree(folder.path(), 10)?;

        let range = tree.range(Bound::Unbounded, Bound::Unbounded);

        // Write through a newer tree sharing the store
        let newer = tree.insert(key(999), key(999))?;
        let _ = newer.remove(&key(0))?;

        let keys = collect_keys(range)?;
        assert_eq!((0..10).map(key).collect::<Vec<_>>(), keys);

        Ok(())
    }

    #[test]
    fn prefix_bounds() {
        assert_eq!(
            Bound::Excluded(Slice::from([b'a', b'c'])),
            prefix_upper_bound(b"ab"),
        );

        assert_eq!(
            Bound::Excluded(Slice::from([b'b'])),
            prefix_upper_bound(&[b'a', 0xFF]),
        );

        assert_eq!(Bound::Unbounded, prefix_upper_bound(&[0xFF, 0xFF]));

        assert_eq!(
            (Bound::Unbounded, Bound::Unbounded),
            prefix_to_bounds(b""),
        );
    }

    #[test]
    fn range_on_empty_tree() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let tree = seeded_tree(folder.path(), 0)?;

        assert!(tree
            .range(Bound::Unbounded, Bound::Unbounded)
            .next()
            .is_none());

        Ok(())
    }
}
