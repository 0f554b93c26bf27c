mod common;

use common::{files_with_ext, wait_for};
use cub::{AutoCompact, Config, Error};
use test_log::test;

fn key(n: u32) -> String {
    format!("{n:06}")
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .expect("path has a file name")
        .to_string_lossy()
        .into_owned()
}

/// Waits until no compaction is running and no `.compact` file is left.
fn wait_for_quiescence(db: &cub::Database) {
    wait_for("compaction to finish", || {
        !db.compacting() && files_with_ext(db.path(), "compact").is_empty()
    });
}

#[test]
fn compaction_convergence() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .auto_compact(AutoCompact::Disabled)
        .open()?;

    for i in 0..2_000u32 {
        db.insert(key(i), format!("value-{i}"))?;
    }
    for i in (0..2_000u32).step_by(2) {
        db.remove(key(i))?;
    }

    let before = db.iter().collect::<cub::Result<Vec<_>>>()?;

    db.compact()?;
    wait_for_quiescence(&db);

    let after = db.iter().collect::<cub::Result<Vec<_>>>()?;

    assert_eq!(before, after);
    assert_eq!(1_000, db.len());
    assert_eq!(Some("value-1".into()), db.get(key(1))?);
    assert_eq!(None, db.get(key(2))?);

    Ok(())
}

#[test]
fn compaction_file_turnover() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .auto_compact(AutoCompact::Disabled)
        .open()?;

    for i in 0..500u32 {
        db.insert(key(i), "x")?;
    }

    assert_eq!(vec!["0.cub"], files_with_ext(db.path(), "cub"));
    assert_eq!("0.cub", file_name(&db.current_data_file()));

    db.compact()?;
    wait_for_quiescence(&db);

    // Cleanup leaves exactly the new file; its counter went up by one
    wait_for("old file cleanup", || {
        files_with_ext(db.path(), "cub") == vec!["1.cub".to_owned()]
    });

    assert_eq!("1.cub", file_name(&db.current_data_file()));

    // The compacted file shrank: it holds only live data
    assert_eq!(500, db.len());

    Ok(())
}

#[test]
fn compaction_with_concurrent_writes() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .auto_compact(AutoCompact::Disabled)
        .open()?;

    for i in 0..2_000u32 {
        db.insert(key(i), "before")?;
    }

    db.compact()?;

    // Writes racing the compaction, including deletes
    for i in 0..500u32 {
        db.insert(key(i), "after")?;
    }
    for i in 1_500..1_600u32 {
        db.remove(key(i))?;
    }

    wait_for_quiescence(&db);

    assert_eq!(Some("after".into()), db.get(key(0))?);
    assert_eq!(Some("before".into()), db.get(key(1_000))?);
    assert_eq!(None, db.get(key(1_550))?);
    assert_eq!(1_900, db.len());
    assert_eq!(1_900, db.iter().count());

    Ok(())
}

#[test]
fn compaction_pending_and_halt_errors() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .auto_compact(AutoCompact::Disabled)
        .open()?;

    assert!(matches!(
        db.halt_compaction(),
        Err(Error::NoCompactionRunning)
    ));

    for i in 0..20_000u32 {
        db.insert(key(i), key(i))?;
    }

    db.compact()?;

    // The worker is busy bulk-loading 20k entries; a second request fails
    assert!(matches!(db.compact(), Err(Error::PendingCompaction)));

    db.halt_compaction()?;
    assert!(!db.compacting());

    // The target is abandoned and removed; the data is untouched
    wait_for("compact file removal", || {
        files_with_ext(db.path(), "compact").is_empty()
    });

    assert_eq!(20_000, db.len());
    assert_eq!(vec!["0.cub"], files_with_ext(db.path(), "cub"));

    Ok(())
}

#[test]
fn compaction_cleanup_waits_for_snapshot() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .auto_compact(AutoCompact::Disabled)
        .open()?;

    for i in 0..500u32 {
        db.insert(key(i), "v1")?;
    }

    let snapshot = db.snapshot(None);

    db.compact()?;
    wait_for_quiescence(&db);

    // The old file is pinned by the snapshot
    assert_eq!(
        vec!["0.cub", "1.cub"],
        files_with_ext(db.path(), "cub"),
    );
    assert_eq!(500, snapshot.iter()?.count());

    snapshot.release();

    wait_for("deferred cleanup", || {
        files_with_ext(db.path(), "cub") == vec!["1.cub".to_owned()]
    });

    Ok(())
}

#[test]
fn compaction_auto_trigger() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .auto_compact(AutoCompact::Enabled {
            min_writes: 50,
            min_dirt_factor: 0.5,
        })
        .open()?;

    // Overwrite the same few keys over and over; the dirt factor rises
    // quickly and compaction kicks in by itself
    for i in 0..200u32 {
        db.insert(key(i % 10), key(i))?;
    }

    wait_for("auto-compaction", || {
        files_with_ext(db.path(), "cub")
            .first()
            .is_some_and(|name| name != "0.cub")
    });

    wait_for_quiescence(&db);
    assert_eq!(10, db.len());

    Ok(())
}

#[test]
fn compaction_clear_restarts() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .auto_compact(AutoCompact::Disabled)
        .open()?;

    for i in 0..20_000u32 {
        db.insert(key(i), "x")?;
    }

    db.compact()?;

    // Clearing while the compactor runs restarts it on the empty tree,
    // instead of resurrecting the cleared data
    db.clear()?;

    wait_for_quiescence(&db);

    assert!(db.is_empty());
    assert_eq!(0, db.iter().count());

    // And the database stays usable
    db.insert("k", "v")?;
    assert_eq!(Some("v".into()), db.get("k")?);

    Ok(())
}

#[test]
fn compaction_back_up() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let backup_folder = tempfile::tempdir()?;

    let db = Config::new(&folder).open()?;

    for i in 0..300u32 {
        db.insert(key(i), format!("value-{i}"))?;
    }
    for i in 0..100u32 {
        db.remove(key(i))?;
    }

    let target = backup_folder.path().join("backup");
    db.back_up(&target)?;

    // Backing up into an existing directory is refused
    assert!(db.back_up(&target).is_err());

    let copy = Config::new(&target).open()?;

    assert_eq!(200, copy.len());
    assert_eq!(None, copy.get(key(50))?);
    assert_eq!(Some("value-150".into()), copy.get(key(150))?);

    assert_eq!(
        db.iter().collect::<cub::Result<Vec<_>>>()?,
        copy.iter().collect::<cub::Result<Vec<_>>>()?,
    );

    Ok(())
}
