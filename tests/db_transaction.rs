mod common;

use cub::{Config, Error};
use std::sync::Arc;
use test_log::test;

#[test]
fn transaction_commit() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    let result = db.transaction(|tx| {
        tx.insert("x", "9")?;
        Ok("ok")
    })?;

    assert_eq!("ok", result);
    assert_eq!(Some("9".into()), db.get("x")?);

    Ok(())
}

#[test]
fn transaction_error_discards() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert("x", "9")?;

    let result: cub::Result<()> = db.transaction(|tx| {
        tx.insert("x", "changed")?;
        tx.insert("y", "new")?;
        Err(Error::Io(std::io::Error::other("callback failed")))
    });

    assert!(result.is_err());

    // Nothing of the failed transaction is visible
    assert_eq!(Some("9".into()), db.get("x")?);
    assert_eq!(None, db.get("y")?);

    // And the writer slot is free again
    db.insert("z", "1")?;
    assert_eq!(Some("1".into()), db.get("z")?);

    Ok(())
}

#[test]
fn transaction_panic_releases_writer_slot() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert("x", "9")?;

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _: cub::Result<()> = db.transaction(|tx| {
            tx.insert("x", "changed")?;
            panic!("boom");
        });
    }));

    assert!(caught.is_err());
    assert_eq!(Some("9".into()), db.get("x")?);

    // Subsequent writers proceed
    db.insert("after", "1")?;
    assert_eq!(Some("1".into()), db.get("after")?);

    Ok(())
}

#[test]
fn transaction_cancel_keeps_result() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    let result = db.transaction(|tx| {
        tx.insert("x", "9")?;
        tx.cancel();
        Ok(42)
    })?;

    assert_eq!(42, result);
    assert_eq!(None, db.get("x")?);

    Ok(())
}

#[test]
fn transaction_reads_own_writes() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert("a", "old")?;

    db.transaction(|tx| {
        tx.insert("a", "new")?;
        tx.insert("b", "1")?;
        tx.remove("a")?;

        assert_eq!(None, tx.get("a")?);
        assert_eq!(Some("1".into()), tx.get("b")?);
        assert_eq!(1, tx.len());
        assert_eq!(1, tx.iter().count());

        Ok(())
    })?;

    assert_eq!(None, db.get("a")?);

    Ok(())
}

#[test]
fn transaction_insert_new() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert_new("a", "1")?;

    assert!(matches!(
        db.insert_new("a", "2"),
        Err(Error::AlreadyExists)
    ));
    assert_eq!(Some("1".into()), db.get("a")?);

    db.remove("a")?;
    db.insert_new("a", "3")?;
    assert_eq!(Some("3".into()), db.get("a")?);

    Ok(())
}

#[test]
fn transaction_get_and_update_multi() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert_multi([("a", "1"), ("b", "2")])?;

    let seen = db.get_and_update_multi(["a", "b", "c"], |entries| {
        let seen = entries.len();

        Ok((
            seen,
            vec![("c".into(), "3".into())],
            vec!["a".into()],
        ))
    })?;

    assert_eq!(2, seen);
    assert_eq!(None, db.get("a")?);
    assert_eq!(Some("2".into()), db.get("b")?);
    assert_eq!(Some("3".into()), db.get("c")?);

    Ok(())
}

#[test]
fn transaction_writers_serialize() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Arc::new(Config::new(&folder).open()?);

    db.insert("counter", "0")?;

    let threads = (0..4)
        .map(|_| {
            let db = db.clone();

            std::thread::spawn(move || {
                for _ in 0..25 {
                    db.transaction(|tx| {
                        let current = tx
                            .get("counter")?
                            .map(|value| {
                                String::from_utf8_lossy(&value)
                                    .parse::<u64>()
                                    .expect("counter should be numeric")
                            })
                            .unwrap_or_default();

                        tx.insert("counter", (current + 1).to_string())?;
                        Ok(())
                    })
                    .expect("transaction should succeed");
                }
            })
        })
        .collect::<Vec<_>>();

    for thread in threads {
        thread.join().expect("thread should not panic");
    }

    assert_eq!(Some("100".into()), db.get("counter")?);

    Ok(())
}
