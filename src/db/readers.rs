// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rustc_hash::FxHashMap;
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

struct ReaderEntry {
    /// The database file this reader's root lives in; pins the file
    /// against cleanup
    path: PathBuf,

    /// Expiry for snapshots with a finite time-to-live
    deadline: Option<Instant>,
}

impl ReaderEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Default)]
struct TableInner {
    next_id: u64,
    entries: FxHashMap<u64, ReaderEntry>,
}

/// The snapshot table: live reader references and the files they pin
///
/// Expired entries are not reaped by a timer but opportunistically, on
/// every registration, release and pin query; an expired snapshot is
/// indistinguishable from a released one from then on.
#[derive(Default)]
pub struct ReaderTable {
    inner: Mutex<TableInner>,
}

impl ReaderTable {
    /// Registers a reader of `path`, returning its reference ID.
    pub fn register(&self, path: PathBuf, ttl: Option<Duration>) -> u64 {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let now = Instant::now();
        inner.entries.retain(|_, entry| !entry.is_expired(now));

        let id = inner.next_id;
        inner.next_id += 1;

        inner.entries.insert(
            id,
            ReaderEntry {
                path,
                deadline: ttl.map(|ttl| now + ttl),
            },
        );

        log::trace!("Registered reader {id}, ttl={ttl:?}");

        id
    }

    /// Drops a reader reference. Idempotent.
    pub fn release(&self, id: u64) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if inner.entries.remove(&id).is_some() {
            log::trace!("Released reader {id}");
        }
    }

    /// Returns `true` if the reference exists and has not expired.
    pub fn is_live(&self, id: u64) -> bool {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let now = Instant::now();

        match inner.entries.get(&id) {
            Some(entry) if entry.is_expired(now) => {
                inner.entries.remove(&id);
                log::trace!("Reader {id} expired");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Returns `true` if any live reader pins a file other than `current`.
    ///
    /// While that is the case, cleanup of superseded files must wait.
    pub fn pins_other_than(&self, current: &Path) -> bool {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let now = Instant::now();
        inner.entries.retain(|_, entry| !entry.is_expired(now));

        inner.entries.values().any(|entry| entry.path != current)
    }
}
