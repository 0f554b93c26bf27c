// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    node::{Entries, Node},
    store::Store,
    tree::Tree,
    Slice,
};

/// Bottom-up bulk loader
///
/// Builds a maximally dense tree from a pre-sorted stream by packing
/// `capacity` entries per node and carrying each finished node's first key
/// into the level above. Compaction and backups are bulk loads of a live
/// stream into a fresh store.
pub struct Ingestion {
    store: Store,
    capacity: usize,

    /// One pending entry list per tree level, leaf level first
    levels: Vec<Entries>,

    count: u64,
}

impl Ingestion {
    /// Starts a bulk load into `store`, which must be blank.
    pub fn new(store: Store, capacity: usize) -> crate::Result<Self> {
        if !store.is_blank() {
            return Err(crate::Error::NotEmpty);
        }

        Ok(Self {
            store,
            capacity,
            levels: vec![vec![]],
            count: 0,
        })
    }

    /// Appends the next key-value pair; keys must arrive in strictly
    /// ascending order.
    pub fn write(&mut self, key: Slice, value: Slice) -> crate::Result<()> {
        let terminal_loc = self.store.put_node(&Node::Value(value))?;

        self.push(0, (key, terminal_loc))?;
        self.count += 1;

        Ok(())
    }

    fn push(&mut self, level: usize, entry: (Slice, u64)) -> crate::Result<()> {
        if self.levels.len() == level {
            self.levels.push(vec![]);
        }

        #[allow(clippy::expect_used)]
        let entries = self.levels.get_mut(level).expect("level exists");
        entries.push(entry);

        if entries.len() == self.capacity {
            self.flush(level)?;
        }

        Ok(())
    }

    fn flush(&mut self, level: usize) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let entries = std::mem::take(self.levels.get_mut(level).expect("level exists"));

        let Some((sep, _)) = entries.first() else {
            return Ok(());
        };
        let sep = sep.clone();

        let node = if level == 0 {
            Node::Leaf(entries)
        } else {
            Node::Branch(entries)
        };
        let loc = self.store.put_node(&node)?;

        self.push(level + 1, (sep, loc))
    }

    /// Writes out all partially filled nodes and returns the finished tree
    /// with `dirt = 0`.
    pub fn finish(mut self) -> crate::Result<Tree> {
        let mut level = 0;

        let root = loop {
            let is_top = level == self.levels.len() - 1;

            #[allow(clippy::expect_used)]
            let entries = std::mem::take(self.levels.get_mut(level).expect("level exists"));

            if is_top {
                // A single carried entry at the top already names the root
                if level > 0 && entries.len() == 1 {
                    #[allow(clippy::expect_used)]
                    let (_, loc) = entries.first().expect("checked length");
                    break *loc;
                }

                let node = if level == 0 {
                    Node::Leaf(entries)
                } else {
                    Node::Branch(entries)
                };
                break self.store.put_node(&node)?;
            }

            if let Some((sep, _)) = entries.first() {
                let sep = sep.clone();

                let node = if level == 0 {
                    Node::Leaf(entries)
                } else {
                    Node::Branch(entries)
                };
                let loc = self.store.put_node(&node)?;

                // May cascade a flush that grows the level list
                self.push(level + 1, (sep, loc))?;
            }

            level += 1;
        };

        Ok(Tree::from_header(
            self.store,
            crate::node::Header {
                size: self.count,
                location: root,
                dirt: 0,
            },
            self.capacity,
        ))
    }
}
