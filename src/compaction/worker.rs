// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::StopSignal;
use crate::{
    db::inner::DbInner,
    store::Store,
    tree::{
        diff::{Diff, DiffTerminal},
        ingest::Ingestion,
        Tree,
    },
};
use std::{
    ops::Bound,
    path::Path,
    sync::Weak,
};

/// How often the worker polls the stop signal, in processed items.
const STOP_CHECK_INTERVAL: usize = 1_000;

enum Outcome {
    /// The compacted file took over as the live database file
    Finalized,

    /// Halted, or the database was dropped mid-flight
    Abandoned,
}

/// Compaction worker entry point; runs on its own thread.
///
/// Holds only a weak handle to the engine, so dropping the last database
/// handle mid-compaction abandons the work instead of keeping the engine
/// alive forever.
pub fn run(db: &Weak<DbInner>, target: Store, source: Tree, stop: &StopSignal) {
    let target_path = target.path().to_path_buf();

    match run_inner(db, &target, source, stop) {
        Ok(Outcome::Finalized) => {
            log::debug!("Compaction into {target_path:?} finished");
        }
        Ok(Outcome::Abandoned) => {
            log::debug!("Compaction into {target_path:?} abandoned");
            abandon(db, target, &target_path);
        }
        Err(e) => {
            log::error!("Compaction into {target_path:?} failed: {e:?}");
            abandon(db, target, &target_path);
        }
    }
}

/// Clears this worker's engine-side slot and deletes the unfinished target.
fn abandon(db: &Weak<DbInner>, target: Store, target_path: &Path) {
    if let Some(db) = db.upgrade() {
        #[allow(clippy::expect_used)]
        let mut slot = db.compaction.lock().expect("lock is poisoned");

        // A halt may have cleared the slot already, and a newer compaction
        // may own it by now
        if slot
            .as_ref()
            .is_some_and(|running| running.target_path == target_path)
        {
            *slot = None;
        }
    }

    // Close the file handle before unlinking
    drop(target);

    if let Err(e) = std::fs::remove_file(target_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove {target_path:?}: {e:?}");
        }
    }
}

fn run_inner(
    db: &Weak<DbInner>,
    target: &Store,
    mut source: Tree,
    stop: &StopSignal,
) -> crate::Result<Outcome> {
    // Phase 1: bulk-load the source root's live stream
    let mut ingestion = Ingestion::new(target.clone(), source.capacity())?;

    for (idx, kv) in source.range(Bound::Unbounded, Bound::Unbounded).enumerate() {
        let (key, value) = kv?;
        ingestion.write(key, value)?;

        if idx % STOP_CHECK_INTERVAL == 0 && stop.is_stopped() {
            return Ok(Outcome::Abandoned);
        }
    }

    let mut compacted = ingestion.finish()?;
    compacted.commit()?;

    log::debug!(
        "Bulk-loaded {} entries into {:?}",
        compacted.len(),
        target.path(),
    );

    // Phase 2: catch up with writes committed while we were busy, until a
    // round ends with no new commits
    loop {
        if stop.is_stopped() {
            return Ok(Outcome::Abandoned);
        }

        let Some(db) = db.upgrade() else {
            return Ok(Outcome::Abandoned);
        };

        // Holding the writer slot pins the current root: nothing can commit
        // between the comparison and the installation below
        let slot = db.writer_queue.acquire();

        // A halt that raced the slot acquisition still wins
        if stop.is_stopped() {
            return Ok(Outcome::Abandoned);
        }

        let current = db.current();

        if current.root_location() == source.root_location()
            && current.store().id() == source.store().id()
        {
            db.finalize_compaction(compacted)?;
            drop(slot);

            return Ok(Outcome::Finalized);
        }

        let latest = current;
        drop(slot);

        log::trace!(
            "Catch-up round: {} -> {}",
            source.root_location(),
            latest.root_location(),
        );

        for (idx, entry) in Diff::new(latest.clone(), &source).enumerate() {
            let (key, terminal) = entry?;

            compacted = match terminal {
                DiffTerminal::Value(value) => compacted.insert(key, value)?,
                DiffTerminal::Tombstone => compacted.remove(&key)?,
            };

            if idx % STOP_CHECK_INTERVAL == 0 && stop.is_stopped() {
                return Ok(Outcome::Abandoned);
            }
        }

        compacted.commit()?;
        source = latest;
    }
}
