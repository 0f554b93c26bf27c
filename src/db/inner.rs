// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::Cache,
    cleanup,
    compaction::RunningCompaction,
    config::AutoCompact,
    db::{readers::ReaderTable, writer_queue::WriterQueue},
    file,
    node::Header,
    store::Store,
    tree::Tree,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{
            AtomicBool,
            Ordering::{Acquire, Release},
        },
        Arc, Mutex, RwLock,
    },
};

/// The engine state shared by database handles, snapshots and workers
///
/// The source of truth is `current`: the latest committed root. Writers
/// serialize through `writer_queue` and replace it on commit; readers clone
/// it and go their way.
pub struct DbInner {
    /// Data directory
    pub path: PathBuf,

    pub cache: Arc<Cache>,

    /// The latest committed root
    pub current: RwLock<Tree>,

    /// FIFO queue for the single writer slot
    pub writer_queue: WriterQueue,

    /// Snapshot table; pins files against cleanup
    pub readers: ReaderTable,

    /// The running compaction, if any
    pub compaction: Mutex<Option<RunningCompaction>>,

    /// Set when cleanup had to be deferred because a snapshot still pins a
    /// superseded file
    pub cleanup_pending: AtomicBool,

    pub auto_compact: Mutex<AutoCompact>,

    pub auto_file_sync: AtomicBool,

    pub tree_capacity: usize,
}

impl DbInner {
    /// Clones the current root.
    pub fn current(&self) -> Tree {
        #[allow(clippy::expect_used)]
        let guard = self.current.read().expect("lock is poisoned");

        guard.clone()
    }

    pub fn compacting(&self) -> bool {
        #[allow(clippy::expect_used)]
        let guard = self.compaction.lock().expect("lock is poisoned");

        guard.is_some()
    }

    /// Publishes a writer's root: appends the header and installs the tree
    /// as current.
    ///
    /// Must be called while holding the writer slot. If the header append
    /// (or the configured datasync) fails, the previous root stays in
    /// place.
    pub fn commit(&self, tree: &Tree) -> crate::Result<()> {
        tree.commit()?;

        if self.auto_file_sync.load(Acquire) {
            tree.store().sync()?;
        }

        #[allow(clippy::expect_used)]
        {
            *self.current.write().expect("lock is poisoned") = tree.clone();
        }

        Ok(())
    }

    /// Installs a finished compaction: syncs the target, renames it to a
    /// live `.cub` file, reopens it and replaces the current root.
    ///
    /// Must be called while holding the writer slot, with the current root
    /// equal to the compaction source.
    pub fn finalize_compaction(&self, compacted: Tree) -> crate::Result<()> {
        let target = compacted.store().clone();
        target.sync()?;

        let compact_path = target.path().to_path_buf();

        let counter = compact_path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(file::parse_file_name)
            .map(|(counter, _)| counter);

        let Some(counter) = counter else {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a compaction target: {compact_path:?}"),
            )));
        };

        let data_path = self.path.join(file::data_file_name(counter));

        std::fs::rename(&compact_path, &data_path)?;
        file::fsync_directory(&self.path)?;

        // The renamed file is reopened under its new identity; the worker's
        // old handle evaporates with its tree clones
        let store = Store::open(&data_path, self.cache.clone())?;

        let tree = Tree::from_header(
            store,
            Header {
                size: compacted.len(),
                location: compacted.root_location(),
                dirt: compacted.dirt(),
            },
            self.tree_capacity,
        );

        #[allow(clippy::expect_used)]
        {
            *self.current.write().expect("lock is poisoned") = tree;
        }

        // Clear the engine-side slot, unless a halt raced us and a newer
        // compaction owns it by now
        #[allow(clippy::expect_used)]
        {
            let mut slot = self.compaction.lock().expect("lock is poisoned");

            if slot
                .as_ref()
                .is_some_and(|running| running.target_path == compact_path)
            {
                *slot = None;
            }
        }

        log::debug!("Live database file is now {data_path:?}");

        self.request_cleanup();

        Ok(())
    }

    /// Sweeps superseded files, unless a snapshot still pins one; then the
    /// sweep re-arms and runs when the last such snapshot goes away.
    pub fn request_cleanup(&self) {
        let current_path = self.current().store().path().to_path_buf();

        if self.readers.pins_other_than(&current_path) {
            log::trace!("Deferring cleanup, superseded files are still pinned");
            self.cleanup_pending.store(true, Release);
            return;
        }

        self.cleanup_pending.store(false, Release);

        let folder = self.path.clone();

        std::thread::spawn(move || {
            if let Err(e) = cleanup::remove_superseded_files(&folder, &current_path) {
                log::warn!("Cleanup of {folder:?} failed: {e:?}");
            }
        });
    }

    /// Called whenever a reader reference goes away.
    pub fn on_reader_released(&self) {
        if self.cleanup_pending.load(Acquire) {
            self.request_cleanup();
        }
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        log::trace!("Closing database at {:?}", self.path);

        if let Ok(mut slot) = self.compaction.lock() {
            if let Some(running) = slot.take() {
                running.stop.send();
            }
        }

        if self.auto_file_sync.load(Acquire) {
            if let Ok(tree) = self.current.read() {
                if let Err(e) = tree.store().sync() {
                    log::warn!("Final sync failed: {e:?}");
                }
            }
        }
    }
}

/// An ephemeral reader reference; releases itself on drop
///
/// Held by snapshot reads (and their iterators) so that the file a
/// snapshot's root lives in stays pinned for the duration of the read even
/// if the snapshot's time-to-live runs out mid-way.
pub struct ReaderGuard {
    pub db: Arc<DbInner>,
    pub id: u64,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.db.readers.release(self.id);
        self.db.on_reader_released();
    }
}
