// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    db::Iter,
    slice::slice_bound,
    snapshot::Snapshot,
    tree::Tree,
    Slice, UserKey, UserValue,
};
use std::{collections::HashMap, ops::RangeBounds};

/// The result of re-reading a key through [`Transaction::refetch`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Refetch {
    /// The entry provably did not change since the snapshot was taken; the
    /// snapshot's value is still good
    Unchanged,

    /// The entry may have changed; this is its current value
    Changed(Option<UserValue>),
}

/// The writer's view of the database during [`crate::Database::transaction`]
///
/// A transaction owns a private root derived from the root that was current
/// when it acquired the writer slot. Writes rewrite that private root;
/// reads observe them immediately. Nothing is visible outside until the
/// callback returns `Ok` and the engine commits.
///
/// The transaction only exists as a `&mut` borrow inside the callback, so
/// it cannot leak out of its scope.
pub struct Transaction {
    tree: Tree,

    /// Whether a compaction was running when the transaction started;
    /// deletions then leave tombstones so the compactor can observe them
    compacting: bool,

    recompact: bool,

    cancelled: bool,
}

impl Transaction {
    pub(crate) fn new(tree: Tree, compacting: bool) -> Self {
        Self {
            tree,
            compacting,
            recompact: false,
            cancelled: false,
        }
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub(crate) fn wants_recompact(&self) -> bool {
        self.recompact
    }

    /// Retrieves the value for a key, observing the transaction's own
    /// uncommitted writes.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<UserValue>> {
        self.tree.get(key.as_ref())
    }

    /// Returns `true` if the transaction's view contains the key.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<bool> {
        self.tree.contains_key(key.as_ref())
    }

    /// Retrieves the values of multiple keys, as a map of the present
    /// entries.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn get_multi<K: Into<Slice>, I: IntoIterator<Item = K>>(
        &self,
        keys: I,
    ) -> crate::Result<HashMap<UserKey, UserValue>> {
        let mut entries = HashMap::new();

        for key in keys {
            let key = key.into();

            if let Some(value) = self.tree.get(&key)? {
                entries.insert(key, value);
            }
        }

        Ok(entries)
    }

    /// Returns the number of live entries in the transaction's view.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    /// Returns `true` if the transaction's view holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the transaction's view in ascending key order.
    #[must_use]
    pub fn iter(&self) -> Iter {
        self.range::<&[u8], _>(..)
    }

    /// Iterates over a range of keys in the transaction's view.
    #[must_use]
    pub fn range<K: AsRef<[u8]>, R: RangeBounds<K>>(&self, range: R) -> Iter {
        let lo = slice_bound(range.start_bound());
        let hi = slice_bound(range.end_bound());

        Iter::new(self.tree.range(lo, hi), None, None)
    }

    /// Iterates over all keys starting with the given prefix, in the
    /// transaction's view.
    #[must_use]
    pub fn prefix<K: AsRef<[u8]>>(&self, prefix: K) -> Iter {
        let (lo, hi) = crate::tree::range::prefix_to_bounds(prefix.as_ref());

        Iter::new(self.tree.range(lo, hi), None, None)
    }

    /// Inserts or replaces a key-value pair.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn insert<K: Into<Slice>, V: Into<Slice>>(&mut self, key: K, value: V) -> crate::Result<()> {
        self.tree = self.tree.insert(key.into(), value.into())?;
        Ok(())
    }

    /// Inserts a key-value pair, failing if the key already has a value.
    ///
    /// # Errors
    ///
    /// Will return `Err(Error::AlreadyExists)` if the key is present, or if
    /// an IO error occurs.
    pub fn insert_new<K: Into<Slice>, V: Into<Slice>>(
        &mut self,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        self.tree = self.tree.insert_new(key.into(), value.into())?;
        Ok(())
    }

    /// Removes a key. Removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn remove<K: Into<Slice>>(&mut self, key: K) -> crate::Result<()> {
        let key = key.into();

        self.tree = if self.compacting {
            self.tree.mark_removed(key)?
        } else {
            self.tree.remove(&key)?
        };

        Ok(())
    }

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn clear(&mut self) -> crate::Result<()> {
        self.tree = self.tree.clear()?;

        if self.compacting {
            // Compacting pre-clear data would resurrect it; the engine
            // restarts the compaction after this commits
            self.recompact = true;
        }

        Ok(())
    }

    /// Discards the transaction's writes while still returning the
    /// callback's value.
    ///
    /// After cancelling, further writes are pointless (they stay
    /// uncommitted) but reads keep working.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Re-reads a key, proving it unchanged relative to `snapshot` when
    /// possible.
    ///
    /// If no node on the path from the transaction's root down to the key
    /// sits above the snapshot's root offset, the entry cannot differ from
    /// what the snapshot sees and no terminal has to be read at all.
    /// Otherwise the current value is fetched. `Changed` may be returned
    /// for an entry that is in fact unchanged; the reverse never happens.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn refetch<K: AsRef<[u8]>>(
        &self,
        key: K,
        snapshot: &Snapshot,
    ) -> crate::Result<Refetch> {
        let key = key.as_ref();

        if self.tree.store().id() == snapshot.tree().store().id()
            && !self
                .tree
                .modified_since(key, snapshot.tree().root_location())?
        {
            return Ok(Refetch::Unchanged);
        }

        Ok(Refetch::Changed(self.tree.get(key)?))
    }
}
