// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{coding::DecodeError, node::Node, tree::Tree, Slice, UserValue};
use std::collections::VecDeque;

/// A single update observed between two roots
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiffTerminal {
    /// The key was written with this value
    Value(UserValue),

    /// The key was deleted
    Tombstone,
}

/// Enumerates the updates between two roots sharing one append-only store
///
/// Every `(key, terminal)` of `to` whose terminal sits above the `from`
/// root's offset is an update that happened after `from` was written: the
/// store is append-only and trees are copy-on-write, so offsets double as
/// modification timestamps. Subtrees at offsets at or below the mark are
/// pruned wholesale.
///
/// Yields in ascending key order; tombstones are included, that is the
/// point.
pub struct Diff {
    to: Tree,
    mark: u64,
    stack: Vec<VecDeque<(Slice, u64, bool)>>,
    initialized: bool,
}

impl Diff {
    /// Creates a diff of the updates applied after `from` was the root.
    ///
    /// # Panics
    ///
    /// Panics if the trees do not share a store; diffing across files is
    /// meaningless and a bug.
    #[must_use]
    pub fn new(to: Tree, from: &Tree) -> Self {
        assert_eq!(
            to.store().id(),
            from.store().id(),
            "diffed trees must share a store",
        );

        Self {
            mark: from.root_location(),
            to,
            stack: vec![],
            initialized: false,
        }
    }

    fn push_node(&mut self, loc: u64) -> crate::Result<()> {
        let node = self.to.store().get_node(loc)?;

        let frame = match &*node {
            Node::Branch(entries) => entries
                .iter()
                .filter(|(_, child)| *child > self.mark)
                .map(|(sep, child)| (sep.clone(), *child, false))
                .collect(),
            Node::Leaf(entries) => entries
                .iter()
                .filter(|(_, terminal)| *terminal > self.mark)
                .map(|(key, terminal)| (key.clone(), *terminal, true))
                .collect(),
            _ => {
                return Err(crate::Error::Decode(DecodeError::InvalidHeader(
                    "expected an index node",
                )))
            }
        };

        self.stack.push(frame);

        Ok(())
    }
}

impl Iterator for Diff {
    type Item = crate::Result<(Slice, DiffTerminal)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            self.initialized = true;

            let root = self.to.root_location();
            if root <= self.mark {
                // Nothing happened since `from`
                return None;
            }

            fail_iter!(self.push_node(root));
        }

        loop {
            let frame = self.stack.last_mut()?;

            let Some((key, loc, is_terminal)) = frame.pop_front() else {
                self.stack.pop();
                continue;
            };

            if is_terminal {
                let terminal = match &*fail_iter!(self.to.store().get_node(loc)) {
                    Node::Value(bytes) => DiffTerminal::Value(bytes.clone()),
                    Node::Tombstone => DiffTerminal::Tombstone,
                    _ => {
                        return Some(Err(crate::Error::Decode(DecodeError::InvalidHeader(
                            "expected a terminal node",
                        ))))
                    }
                };

                return Some(Ok((key, terminal)));
            }

            fail_iter!(self.push_node(loc));
        }
    }
}
