// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Online compaction
//!
//! Compaction bulk-loads the live entries of the current root into a fresh
//! `.compact` file, catches up with whatever was committed meanwhile, and
//! atomically takes over as the live database file. Readers and writers
//! keep running the whole time; the only rendezvous is that the final
//! root comparison and installation happen under the writer slot.

pub mod worker;

use crate::{cleanup, db::inner::DbInner, file, store::Store};
use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

/// Cooperative cancellation flag shared between the engine and a worker
///
/// The worker polls it between items and between catch-up rounds, so a
/// halt takes effect promptly without interrupting a write mid-record.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn send(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// The engine-side handle of a running compaction
pub struct RunningCompaction {
    pub stop: StopSignal,

    /// Path of the `.compact` file the worker writes into; identifies the
    /// worker, so a finished one never clears the slot of its successor
    pub target_path: PathBuf,
}

/// Spawns a compaction of the current root.
///
/// # Errors
///
/// Fails with `PendingCompaction` if one is already running.
pub fn start(db: &Arc<DbInner>) -> crate::Result<()> {
    #[allow(clippy::expect_used)]
    let mut slot = db.compaction.lock().expect("lock is poisoned");

    if slot.is_some() {
        return Err(crate::Error::PendingCompaction);
    }

    // Claim a counter before sweeping leftovers, so the name of a stale
    // target (whose halted worker may still be winding down) is never
    // reused
    let counter = file::next_file_counter(&db.path)?;

    cleanup::remove_stale_compaction_files(&db.path, None)?;

    let target_path = db.path.join(file::compact_file_name(counter));
    let target = Store::open(&target_path, db.cache.clone())?;

    let stop = StopSignal::default();
    let source = db.current();

    log::debug!(
        "Starting compaction of {} entries into {target_path:?}",
        source.len(),
    );

    {
        let db = Arc::downgrade(db);
        let stop = stop.clone();

        std::thread::spawn(move || worker::run(&db, target, source, &stop));
    }

    *slot = Some(RunningCompaction { stop, target_path });

    Ok(())
}

/// Cancels the running compaction, leaving the current root untouched.
///
/// The worker abandons its target file at the next cancellation point and
/// removes it; the engine-side slot is free immediately.
///
/// # Errors
///
/// Fails with `NoCompactionRunning` if none is running.
pub fn halt(db: &DbInner) -> crate::Result<()> {
    #[allow(clippy::expect_used)]
    let Some(running) = db.compaction.lock().expect("lock is poisoned").take() else {
        return Err(crate::Error::NoCompactionRunning);
    };

    log::debug!("Halting compaction into {:?}", running.target_path);
    running.stop.send();

    Ok(())
}
