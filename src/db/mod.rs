// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod inner;
pub mod readers;
pub mod writer_queue;

use crate::{
    cache::Cache,
    cleanup, compaction,
    config::{AutoCompact, Config},
    db::inner::{DbInner, ReaderGuard},
    file,
    slice::slice_bound,
    snapshot::Snapshot,
    store::Store,
    transaction::Transaction,
    tree::{ingest::Ingestion, range::Range, Tree},
    KvPair, Slice, UserKey, UserValue,
};
use std::{
    collections::HashMap,
    ops::{Bound, RangeBounds},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering::Release},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

/// Iterator over a range of key-value pairs
///
/// Returned by the `iter`/`range` family on [`Database`], [`Snapshot`] and
/// [`Transaction`]. The iterator owns the root it was created from, so
/// concurrent commits do not affect it.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Iter {
    inner: Range,

    /// For snapshot-bound iterators: the snapshot to check for expiry
    /// before every element
    liveness: Option<(Arc<DbInner>, u64)>,

    /// Keeps the snapshot's file pinned for as long as the iterator lives
    _extension: Option<ReaderGuard>,

    dead: bool,
}

impl Iter {
    pub(crate) fn new(
        inner: Range,
        liveness: Option<(Arc<DbInner>, u64)>,
        extension: Option<ReaderGuard>,
    ) -> Self {
        Self {
            inner,
            liveness,
            _extension: extension,
            dead: false,
        }
    }

    fn check_liveness(&mut self) -> crate::Result<()> {
        if let Some((db, id)) = &self.liveness {
            if !db.readers.is_live(*id) {
                self.dead = true;
                return Err(crate::Error::ExpiredSnapshot);
            }
        }

        Ok(())
    }
}

impl Iterator for Iter {
    type Item = crate::Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dead {
            return None;
        }

        if let Err(e) = self.check_liveness() {
            return Some(Err(e));
        }

        self.inner.next()
    }
}

impl DoubleEndedIterator for Iter {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.dead {
            return None;
        }

        if let Err(e) = self.check_liveness() {
            return Some(Err(e));
        }

        self.inner.next_back()
    }
}

/// An embedded, single-file key-value database
///
/// Keys and values are opaque byte sequences; keys are ordered by unsigned
/// lexicographic comparison. All data lives in one append-only file inside
/// the configured directory, indexed by a copy-on-write B-tree: readers get
/// stable MVCC snapshots for free, writers serialize through a single FIFO
/// writer slot, and a background compaction reclaims space from superseded
/// entries.
///
/// Cloning a `Database` is cheap and yields a handle to the same engine.
/// Dropping the last handle closes it: a running compaction is signalled to
/// stop, and a final datasync is issued if `auto_file_sync` is on.
///
/// # Examples
///
/// ```
/// # let folder = tempfile::tempdir()?;
/// use cub::Config;
///
/// let db = Config::new(&folder).open()?;
///
/// db.insert("key", "value")?;
/// assert_eq!(Some("value".into()), db.get("key")?);
///
/// db.remove("key")?;
/// assert_eq!(None, db.get("key")?);
/// #
/// # Ok::<(), cub::Error>(())
/// ```
#[derive(Clone)]
pub struct Database(pub(crate) Arc<DbInner>);

impl Database {
    pub(crate) fn open(config: Config) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let cache = Arc::new(Cache::with_capacity(config.cache_capacity));

        let (_, data_path) = file::latest_data_file(&config.path)?
            .unwrap_or_else(|| (0, config.path.join(file::data_file_name(0))));

        log::debug!("Opening database at {:?}", config.path);

        let store = Store::open(&data_path, cache.clone())?;

        let tree = match store.latest_header()? {
            Some((loc, header)) => {
                log::debug!("Recovered header at {loc}: {header:?}");
                Tree::from_header(store, header, config.tree_capacity)
            }
            None => {
                log::debug!("No usable header, initializing an empty database");

                let tree = Tree::create(store, config.tree_capacity)?;
                tree.commit()?;

                if config.auto_file_sync {
                    tree.store().sync()?;
                }

                tree
            }
        };

        let inner = Arc::new(DbInner {
            path: config.path,
            cache,
            current: RwLock::new(tree),
            writer_queue: writer_queue::WriterQueue::default(),
            readers: readers::ReaderTable::default(),
            compaction: Mutex::new(None),
            cleanup_pending: AtomicBool::new(false),
            auto_compact: Mutex::new(config.auto_compact),
            auto_file_sync: AtomicBool::new(config.auto_file_sync),
            tree_capacity: config.tree_capacity,
        });

        // Orphans of crashed compactions and superseded data files; nothing
        // can pin them this early
        if let Err(e) = cleanup::remove_stale_compaction_files(&inner.path, None) {
            log::warn!("Startup cleanup failed: {e:?}");
        }
        if let Err(e) = cleanup::remove_superseded_files(&inner.path, &data_path) {
            log::warn!("Startup cleanup failed: {e:?}");
        }

        Ok(Self(inner))
    }

    /// Returns the data directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// Returns the path of the live database file.
    ///
    /// Changes whenever a compaction finishes.
    #[must_use]
    pub fn current_data_file(&self) -> std::path::PathBuf {
        self.0.current().store().path().to_path_buf()
    }

    /// Retrieves the value for a key from the current root.
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert("a", "1")?;
    ///
    /// assert_eq!(Some("1".into()), db.get("a")?);
    /// assert_eq!(None, db.get("b")?);
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<UserValue>> {
        self.0.current().get(key.as_ref())
    }

    /// Returns `true` if the database contains the key.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<bool> {
        self.0.current().contains_key(key.as_ref())
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
        let tree = self.0.current();
        let mut entries = HashMap::new();

        for key in keys {
            let key = key.into();

            if let Some(value) = tree.get(&key)? {
                entries.insert(key, value);
            }
        }

        Ok(entries)
    }

    /// Returns the number of live entries.
    ///
    /// This is O(1): the count is part of every commit.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.0.current().len()
    }

    /// Returns `true` if the database holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the entire database in ascending key order.
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert("a", "1")?;
    /// db.insert("b", "2")?;
    ///
    /// assert_eq!(2, db.iter().count());
    /// assert_eq!(1, db.iter().rev().skip(1).count());
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    #[must_use]
    pub fn iter(&self) -> Iter {
        self.range::<&[u8], _>(..)
    }

    /// Iterates over a range of keys in ascending key order.
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert("a", "1")?;
    /// db.insert("f", "2")?;
    /// db.insert("g", "3")?;
    ///
    /// assert_eq!(2, db.range("a"..="f").count());
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    #[must_use]
    pub fn range<K: AsRef<[u8]>, R: RangeBounds<K>>(&self, range: R) -> Iter {
        let lo = slice_bound(range.start_bound());
        let hi = slice_bound(range.end_bound());

        Iter::new(self.0.current().range(lo, hi), None, None)
    }

    /// Iterates over all keys starting with the given prefix, in ascending
    /// key order.
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert("a", "1")?;
    /// db.insert("ab", "2")?;
    /// db.insert("b", "3")?;
    ///
    /// assert_eq!(2, db.prefix("a").count());
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    #[must_use]
    pub fn prefix<K: AsRef<[u8]>>(&self, prefix: K) -> Iter {
        let (lo, hi) = crate::tree::range::prefix_to_bounds(prefix.as_ref());

        Iter::new(self.0.current().range(lo, hi), None, None)
    }

    /// Returns the first key-value pair; its key is the minimum key.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn first_key_value(&self) -> crate::Result<Option<KvPair>> {
        self.iter().next().transpose()
    }

    /// Returns the last key-value pair; its key is the maximum key.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn last_key_value(&self) -> crate::Result<Option<KvPair>> {
        self.iter().next_back().transpose()
    }

    /// Inserts a key-value pair, committing it as its own transaction.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn insert<K: Into<Slice>, V: Into<Slice>>(&self, key: K, value: V) -> crate::Result<()> {
        let (key, value) = (key.into(), value.into());
        self.transaction(move |tx| tx.insert(key, value))
    }

    /// Inserts a key-value pair, failing if the key already has a value.
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert_new("a", "1")?;
    ///
    /// assert!(matches!(
    ///     db.insert_new("a", "2"),
    ///     Err(cub::Error::AlreadyExists)
    /// ));
    /// assert_eq!(Some("1".into()), db.get("a")?);
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Will return `Err(Error::AlreadyExists)` if the key is present, or if
    /// an IO error occurs.
    pub fn insert_new<K: Into<Slice>, V: Into<Slice>>(
        &self,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        let (key, value) = (key.into(), value.into());
        self.transaction(move |tx| tx.insert_new(key, value))
    }

    /// Removes a key. Removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn remove<K: Into<Slice>>(&self, key: K) -> crate::Result<()> {
        let key = key.into();
        self.transaction(move |tx| tx.remove(key))
    }

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn clear(&self) -> crate::Result<()> {
        self.transaction(Transaction::clear)
    }

    /// Inserts multiple key-value pairs in one atomic transaction.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn insert_multi<K: Into<Slice>, V: Into<Slice>, I: IntoIterator<Item = (K, V)>>(
        &self,
        pairs: I,
    ) -> crate::Result<()> {
        self.insert_and_remove_multi(pairs, std::iter::empty::<Slice>())
    }

    /// Removes multiple keys in one atomic transaction.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn remove_multi<K: Into<Slice>, I: IntoIterator<Item = K>>(
        &self,
        keys: I,
    ) -> crate::Result<()> {
        self.insert_and_remove_multi(std::iter::empty::<(Slice, Slice)>(), keys)
    }

    /// Applies a mixed batch of inserts and removes in one atomic
    /// transaction: either all of it is visible, or none of it.
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert("a", "1")?;
    ///
    /// db.insert_and_remove_multi([("b", "2"), ("c", "3")], ["a"])?;
    ///
    /// assert_eq!(None, db.get("a")?);
    /// assert_eq!(2, db.len());
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn insert_and_remove_multi<K, V, K2, I, I2>(&self, pairs: I, keys: I2) -> crate::Result<()>
    where
        K: Into<Slice>,
        V: Into<Slice>,
        K2: Into<Slice>,
        I: IntoIterator<Item = (K, V)>,
        I2: IntoIterator<Item = K2>,
    {
        self.transaction(move |tx| {
            for (key, value) in pairs {
                tx.insert(key, value)?;
            }

            for key in keys {
                tx.remove(key)?;
            }

            Ok(())
        })
    }

    /// Atomically reads a set of keys and applies the updates the callback
    /// derives from them.
    ///
    /// The callback receives a map of the present entries and returns a
    /// result value, pairs to insert and keys to remove; the whole
    /// read-modify-write runs inside one transaction.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the callback fails.
    pub fn get_and_update_multi<K, T, F>(
        &self,
        keys: impl IntoIterator<Item = K>,
        f: F,
    ) -> crate::Result<T>
    where
        K: Into<Slice>,
        F: FnOnce(
            HashMap<UserKey, UserValue>,
        ) -> crate::Result<(T, Vec<(Slice, Slice)>, Vec<Slice>)>,
    {
        self.transaction(move |tx| {
            let mut entries = HashMap::new();

            for key in keys {
                let key = key.into();

                if let Some(value) = tx.get(&key)? {
                    entries.insert(key, value);
                }
            }

            let (result, puts, removes) = f(entries)?;

            for (key, value) in puts {
                tx.insert(key, value)?;
            }

            for key in removes {
                tx.remove(key)?;
            }

            Ok(result)
        })
    }

    /// Atomically updates a single key, returning its previous value.
    ///
    /// The callback maps the current value to the new one; `None` removes
    /// the key.
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert("counter", "1")?;
    ///
    /// let previous = db.get_and_update("counter", |_| Some("2"))?;
    ///
    /// assert_eq!(Some("1".into()), previous);
    /// assert_eq!(Some("2".into()), db.get("counter")?);
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn get_and_update<K, V, F>(&self, key: K, f: F) -> crate::Result<Option<UserValue>>
    where
        K: Into<Slice>,
        V: Into<Slice>,
        F: FnOnce(Option<UserValue>) -> Option<V>,
    {
        let key = key.into();

        self.transaction(move |tx| {
            let previous = tx.get(&key)?;

            match f(previous.clone()) {
                Some(value) => tx.insert(key, value)?,
                None => tx.remove(key)?,
            }

            Ok(previous)
        })
    }

    /// Runs a write transaction.
    ///
    /// The callback gets exclusive write access: it holds the single writer
    /// slot, handed out in FIFO order. Returning `Ok` commits everything
    /// the callback wrote, atomically; returning `Err` (or panicking)
    /// discards it. Either way the slot is released and the next queued
    /// writer proceeds against the then-current root.
    ///
    /// Reads inside the transaction observe its own uncommitted writes.
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert("balance", "100")?;
    ///
    /// db.transaction(|tx| {
    ///     tx.insert("balance", "50")?;
    ///     tx.insert("audit", "spent 50")?;
    ///     Ok(())
    /// })?;
    ///
    /// assert_eq!(Some("50".into()), db.get("balance")?);
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Will return `Err` if the callback fails or an IO error occurs
    /// during commit.
    pub fn transaction<T, F>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut Transaction) -> crate::Result<T>,
    {
        let slot = self.0.writer_queue.acquire();

        let mut tx = Transaction::new(self.0.current(), self.0.compacting());

        // An error (or unwind) drops the slot guard and with it the
        // transaction's private root; nothing was published
        let result = f(&mut tx)?;

        if tx.is_cancelled() {
            return Ok(result);
        }

        self.0.commit(tx.tree())?;

        let recompact = tx.wants_recompact();
        drop(slot);

        if recompact {
            // The tree was cleared mid-compaction; compacting the old data
            // would resurrect it, so start over on the now-empty tree
            if let Err(e) = compaction::halt(&self.0) {
                log::debug!("Recompaction: no compaction to halt: {e:?}");
            }
            if let Err(e) = compaction::start(&self.0) {
                log::warn!("Recompaction failed to start: {e:?}");
            }
        } else {
            self.maybe_auto_compact();
        }

        Ok(result)
    }

    fn maybe_auto_compact(&self) {
        #[allow(clippy::expect_used)]
        let policy = *self.0.auto_compact.lock().expect("lock is poisoned");

        let AutoCompact::Enabled {
            min_writes,
            min_dirt_factor,
        } = policy
        else {
            return;
        };

        let tree = self.0.current();

        if tree.dirt() >= min_writes && tree.dirt_factor() >= min_dirt_factor {
            match compaction::start(&self.0) {
                Ok(()) => log::debug!(
                    "Auto-compaction started (dirt={}, dirt factor={})",
                    tree.dirt(),
                    tree.dirt_factor(),
                ),
                Err(crate::Error::PendingCompaction) => {}
                Err(e) => log::warn!("Auto-compaction failed to start: {e:?}"),
            }
        }
    }

    /// Opens a read view of the current root.
    ///
    /// The snapshot observes none of the commits that happen after this
    /// call. With a finite time-to-live the snapshot expires by itself;
    /// with `None` it lives until released (or dropped).
    ///
    /// # Examples
    ///
    /// ```
    /// # let folder = tempfile::tempdir()?;
    /// # use cub::Config;
    /// let db = Config::new(&folder).open()?;
    ///
    /// db.insert("k", "1")?;
    /// let snapshot = db.snapshot(None);
    /// db.insert("k", "2")?;
    ///
    /// assert_eq!(Some("1".into()), snapshot.get("k")?);
    /// assert_eq!(Some("2".into()), db.get("k")?);
    /// #
    /// # Ok::<(), cub::Error>(())
    /// ```
    #[must_use]
    pub fn snapshot(&self, ttl: Option<Duration>) -> Snapshot {
        let tree = self.0.current();
        let id = self
            .0
            .readers
            .register(tree.store().path().to_path_buf(), ttl);

        log::trace!("Opening snapshot {id}");

        Snapshot::new(self.0.clone(), tree, id)
    }

    /// Runs a callback against a snapshot of the current root, releasing
    /// the snapshot on every exit path.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the callback fails.
    pub fn with_snapshot<T, F>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Snapshot) -> crate::Result<T>,
    {
        let snapshot = self.snapshot(None);
        f(&snapshot)
    }

    /// Requests a compaction of the current root into a fresh file.
    ///
    /// Returns as soon as the background worker is spawned. Once the worker
    /// has caught up with concurrent writes, the compacted file atomically
    /// replaces the live one and superseded files are cleaned up.
    ///
    /// # Errors
    ///
    /// Will return `Err(Error::PendingCompaction)` if a compaction is
    /// already running.
    pub fn compact(&self) -> crate::Result<()> {
        compaction::start(&self.0)
    }

    /// Cancels the in-progress compaction.
    ///
    /// # Errors
    ///
    /// Will return `Err(Error::NoCompactionRunning)` if none is running.
    pub fn halt_compaction(&self) -> crate::Result<()> {
        compaction::halt(&self.0)
    }

    /// Returns `true` while a compaction is running.
    #[must_use]
    pub fn compacting(&self) -> bool {
        self.0.compacting()
    }

    /// Replaces the automatic compaction policy.
    pub fn set_auto_compact(&self, policy: AutoCompact) {
        #[allow(clippy::expect_used)]
        {
            *self.0.auto_compact.lock().expect("lock is poisoned") = policy;
        }
    }

    /// Sets whether every commit is followed by a datasync.
    pub fn set_auto_file_sync(&self, enabled: bool) {
        self.0.auto_file_sync.store(enabled, Release);
    }

    /// Issues an explicit datasync on the live database file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn file_sync(&self) -> crate::Result<()> {
        self.0.current().store().sync()
    }

    /// Writes a compact copy of the current root into a fresh database
    /// directory at `path`.
    ///
    /// The backup is a consistent snapshot: commits that happen while it
    /// runs are not included. The target directory must not exist yet.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the target exists.
    pub fn back_up<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        std::fs::create_dir(path)?;

        let tree = self.0.current();

        log::debug!("Backing up {} entries to {path:?}", tree.len());

        let store = Store::open(path.join(file::data_file_name(0)), self.0.cache.clone())?;
        let mut ingestion = Ingestion::new(store, self.0.tree_capacity)?;

        for kv in tree.range(Bound::Unbounded, Bound::Unbounded) {
            let (key, value) = kv?;
            ingestion.write(key, value)?;
        }

        let backup = ingestion.finish()?;
        backup.commit()?;
        backup.store().sync()?;

        Ok(())
    }
}
