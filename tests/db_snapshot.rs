mod common;

use cub::{Config, Error, Refetch};
use std::time::Duration;
use test_log::test;

#[test]
fn snapshot_isolation() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert("k", "1")?;
    let snapshot = db.snapshot(None);
    db.insert("k", "2")?;

    assert_eq!(Some("2".into()), db.get("k")?);
    assert_eq!(Some("1".into()), snapshot.get("k")?);

    Ok(())
}

#[test]
fn snapshot_stable_iteration() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    for i in 0..100u32 {
        db.insert(format!("{i:04}"), "x")?;
    }

    let snapshot = db.snapshot(None);

    for i in 0..100u32 {
        db.remove(format!("{i:04}"))?;
    }
    db.insert("zzz", "y")?;

    assert_eq!(100, snapshot.iter()?.count());
    assert_eq!(100, snapshot.len()?);
    assert_eq!(1, db.len());

    Ok(())
}

#[test]
fn snapshot_expiry() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert("k", "1")?;

    let snapshot = db.snapshot(Some(Duration::from_millis(50)));
    assert_eq!(Some("1".into()), snapshot.get("k")?);

    std::thread::sleep(Duration::from_millis(100));

    assert!(matches!(snapshot.get("k"), Err(Error::ExpiredSnapshot)));
    assert!(matches!(snapshot.len(), Err(Error::ExpiredSnapshot)));
    assert!(matches!(snapshot.iter(), Err(Error::ExpiredSnapshot)));

    Ok(())
}

#[test]
fn snapshot_expiry_mid_iteration() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    for i in 0..10u32 {
        db.insert(format!("{i:04}"), "x")?;
    }

    let snapshot = db.snapshot(Some(Duration::from_millis(50)));
    let mut iter = snapshot.iter()?;

    assert!(iter.next().transpose()?.is_some());

    std::thread::sleep(Duration::from_millis(100));

    assert!(matches!(iter.next(), Some(Err(Error::ExpiredSnapshot))));
    assert!(iter.next().is_none());

    Ok(())
}

#[test]
fn snapshot_with_snapshot_scoped() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert("k", "1")?;

    let value = db.with_snapshot(|snapshot| {
        db.insert("k", "2")?;
        snapshot.get("k")
    })?;

    assert_eq!(Some("1".into()), value);

    Ok(())
}

#[test]
fn snapshot_release_then_reads_fail() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert("k", "1")?;

    let snapshot = db.snapshot(None);
    let mut iter = snapshot.range("a"..="z")?;

    snapshot.release();

    // The iterator notices the released snapshot
    assert!(matches!(iter.next(), Some(Err(Error::ExpiredSnapshot))));

    Ok(())
}

#[test]
fn snapshot_get_multi() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert_multi([("a", "1"), ("b", "2")])?;
    let snapshot = db.snapshot(None);
    db.remove("a")?;

    let entries = snapshot.get_multi(["a", "b", "missing"])?;
    assert_eq!(2, entries.len());

    Ok(())
}

#[test]
fn snapshot_refetch() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    for i in 0..100u32 {
        db.insert(format!("{i:04}"), "x")?;
    }

    let snapshot = db.snapshot(None);

    db.insert("0099", "changed")?;

    db.transaction(|tx| {
        // Far away from the rewritten path: provably unchanged
        assert_eq!(Refetch::Unchanged, tx.refetch("0000", &snapshot)?);

        // The touched key cannot be proven unchanged
        assert_eq!(
            Refetch::Changed(Some("changed".into())),
            tx.refetch("0099", &snapshot)?,
        );

        Ok(())
    })?;

    Ok(())
}
