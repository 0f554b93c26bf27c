// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    db::{
        inner::{DbInner, ReaderGuard},
        Iter,
    },
    slice::slice_bound,
    tree::Tree,
    Slice, UserKey, UserValue,
};
use std::{
    collections::HashMap,
    ops::RangeBounds,
    sync::Arc,
};

/// A point-in-time read view of the database
///
/// A snapshot is pinned to the root that was current when it was opened:
/// commits made afterwards are invisible through it, and the file its root
/// lives in is protected from cleanup for as long as the snapshot (or any
/// iterator opened through it) is alive.
///
/// A snapshot opened with a finite time-to-live expires on its own; every
/// operation on an expired (or released) snapshot fails with
/// [`crate::Error::ExpiredSnapshot`]. An iterator that is already running
/// keeps its file pinned, but also notices the expiry on the next element.
///
/// Snapshots do not persist across restarts.
///
/// # Examples
///
/// ```
/// # let folder = tempfile::tempdir()?;
/// use cub::Config;
///
/// let db = Config::new(&folder).open()?;
///
/// db.insert("a", "1")?;
/// let snapshot = db.snapshot(None);
///
/// db.insert("a", "2")?;
/// db.insert("b", "3")?;
///
/// assert_eq!(Some("1".into()), snapshot.get("a")?);
/// assert_eq!(None, snapshot.get("b")?);
/// assert_eq!(1, snapshot.len()?);
/// #
/// # Ok::<(), cub::Error>(())
/// ```
pub struct Snapshot {
    db: Arc<DbInner>,
    tree: Tree,
    id: u64,
}

impl Snapshot {
    pub(crate) fn new(db: Arc<DbInner>, tree: Tree, id: u64) -> Self {
        Self { db, tree, id }
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Checks that the snapshot is still live and pins its file for the
    /// duration of one read.
    fn extend(&self) -> crate::Result<ReaderGuard> {
        if !self.db.readers.is_live(self.id) {
            return Err(crate::Error::ExpiredSnapshot);
        }

        let id = self
            .db
            .readers
            .register(self.tree.store().path().to_path_buf(), None);

        Ok(ReaderGuard {
            db: self.db.clone(),
            id,
        })
    }

    /// Retrieves the value for a key, as of this snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired or an IO error occurs.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<UserValue>> {
        let _extension = self.extend()?;
        self.tree.get(key.as_ref())
    }

    /// Returns `true` if the snapshot contains the key.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired or an IO error occurs.
    pub fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<bool> {
        let _extension = self.extend()?;
        self.tree.contains_key(key.as_ref())
    }

    /// Retrieves the values of multiple keys, as a map of the present
    /// entries.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired or an IO error occurs.
    pub fn get_multi<K: Into<Slice>, I: IntoIterator<Item = K>>(
        &self,
        keys: I,
    ) -> crate::Result<HashMap<UserKey, UserValue>> {
        let _extension = self.extend()?;

        let mut entries = HashMap::new();

        for key in keys {
            let key = key.into();

            if let Some(value) = self.tree.get(&key)? {
                entries.insert(key, value);
            }
        }

        Ok(entries)
    }

    /// Returns the number of live entries, as of this snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired.
    pub fn len(&self) -> crate::Result<u64> {
        let _extension = self.extend()?;
        Ok(self.tree.len())
    }

    /// Returns `true` if the snapshot holds no live entries.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired.
    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Iterates over the snapshot in ascending key order.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired.
    pub fn iter(&self) -> crate::Result<Iter> {
        self.range::<&[u8], _>(..)
    }

    /// Iterates over a range of keys in ascending key order, as of this
    /// snapshot.
    ///
    /// The iterator pins the snapshot's file until it is dropped, so it
    /// survives cleanup after a compaction; an expiring time-to-live still
    /// surfaces as an error on the next element.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired.
    pub fn range<K: AsRef<[u8]>, R: RangeBounds<K>>(&self, range: R) -> crate::Result<Iter> {
        let extension = self.extend()?;

        let lo = slice_bound(range.start_bound());
        let hi = slice_bound(range.end_bound());

        Ok(Iter::new(
            self.tree.range(lo, hi),
            Some((self.db.clone(), self.id)),
            Some(extension),
        ))
    }

    /// Iterates over all keys starting with the given prefix, as of this
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired.
    pub fn prefix<K: AsRef<[u8]>>(&self, prefix: K) -> crate::Result<Iter> {
        let extension = self.extend()?;

        let (lo, hi) = crate::tree::range::prefix_to_bounds(prefix.as_ref());

        Ok(Iter::new(
            self.tree.range(lo, hi),
            Some((self.db.clone(), self.id)),
            Some(extension),
        ))
    }

    /// Returns the first key-value pair, as of this snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired or an IO error occurs.
    pub fn first_key_value(&self) -> crate::Result<Option<crate::KvPair>> {
        self.iter()?.next().transpose()
    }

    /// Returns the last key-value pair, as of this snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the snapshot expired or an IO error occurs.
    pub fn last_key_value(&self) -> crate::Result<Option<crate::KvPair>> {
        self.iter()?.next_back().transpose()
    }

    /// Releases the snapshot. Dropping it does the same; releasing twice is
    /// fine.
    pub fn release(self) {}
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        log::trace!("Releasing snapshot {}", self.id);

        self.db.readers.release(self.id);
        self.db.on_reader_released();
    }
}
