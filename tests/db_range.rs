mod common;

use cub::Config;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use test_log::test;

fn key(n: u32) -> String {
    format!("{n:06}")
}

#[test]
fn range_ascending_order() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    let mut rng = StdRng::seed_from_u64(7);
    let mut keys = (0..500u32).collect::<Vec<_>>();
    keys.shuffle(&mut rng);

    for &i in &keys {
        db.insert(key(i), "x")?;
    }

    let scanned = db
        .iter()
        .map(|kv| kv.map(|(k, _)| k))
        .collect::<cub::Result<Vec<_>>>()?;

    assert_eq!(500, scanned.len());
    assert!(scanned.windows(2).all(|w| w[0] < w[1]));

    Ok(())
}

#[test]
fn range_descending_order() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    for i in 0..100u32 {
        db.insert(key(i), "x")?;
    }

    let scanned = db
        .iter()
        .rev()
        .map(|kv| kv.map(|(k, _)| k))
        .collect::<cub::Result<Vec<_>>>()?;

    assert_eq!(100, scanned.len());
    assert!(scanned.windows(2).all(|w| w[0] > w[1]));

    Ok(())
}

#[test]
fn range_bounds() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    for i in 0..100u32 {
        db.insert(key(i), "x")?;
    }

    assert_eq!(11, db.range(key(10)..=key(20)).count());
    assert_eq!(10, db.range(key(10)..key(20)).count());
    assert_eq!(90, db.range(key(10)..).count());
    assert_eq!(10, db.range(..key(10)).count());
    assert_eq!(0, db.range(key(777)..).count());

    Ok(())
}

#[test]
fn range_bounds_between_keys() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert_multi([("aa", "1"), ("cc", "2"), ("ee", "3")])?;

    // Bounds that fall between stored keys
    let hits = db
        .range("b".."d")
        .collect::<cub::Result<Vec<_>>>()?;

    assert_eq!(vec![("cc".into(), "2".into())], hits);

    Ok(())
}

#[test]
fn range_double_ended() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    for i in 0..10u32 {
        db.insert(key(i), "x")?;
    }

    let mut iter = db.iter();

    assert_eq!(key(0).as_bytes(), &*iter.next().expect("front")?.0);
    assert_eq!(key(9).as_bytes(), &*iter.next_back().expect("back")?.0);
    assert_eq!(key(8).as_bytes(), &*iter.next_back().expect("back")?.0);
    assert_eq!(key(1).as_bytes(), &*iter.next().expect("front")?.0);

    // 6 items remain between the cursors
    assert_eq!(6, iter.count());

    Ok(())
}

#[test]
fn range_prefix() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    db.insert_multi([
        ("user:1", "alice"),
        ("user:2", "bob"),
        ("user:3", "carol"),
        ("group:1", "admins"),
    ])?;

    assert_eq!(3, db.prefix("user:").count());
    assert_eq!(1, db.prefix("group:").count());
    assert_eq!(4, db.prefix("").count());
    assert_eq!(0, db.prefix("nothing").count());

    let last = db.prefix("user:").next_back().expect("prefix has items")?;
    assert_eq!(("user:3".into(), "carol".into()), last);

    Ok(())
}

#[test]
fn range_first_and_last() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).open()?;

    assert_eq!(None, db.first_key_value()?);
    assert_eq!(None, db.last_key_value()?);

    db.insert_multi([("5", "e"), ("3", "c"), ("9", "i")])?;

    assert_eq!(Some(("3".into(), "c".into())), db.first_key_value()?);
    assert_eq!(Some(("9".into(), "i".into())), db.last_key_value()?);

    Ok(())
}

#[test]
fn range_matches_model() -> cub::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder).tree_capacity(8).open()?;
    let mut model = std::collections::BTreeMap::new();

    let mut rng = StdRng::seed_from_u64(42);
    let mut keys = (0..300u32).collect::<Vec<_>>();
    keys.shuffle(&mut rng);

    for &i in &keys {
        db.insert(key(i), key(i * 2))?;
        model.insert(key(i), key(i * 2));
    }

    for &i in keys.iter().take(100) {
        db.remove(key(i))?;
        model.remove(&key(i));
    }

    let expected = model
        .range(key(50)..key(250))
        .map(|(k, v)| (k.as_str().into(), v.as_str().into()))
        .collect::<Vec<(cub::Slice, cub::Slice)>>();

    let actual = db
        .range(key(50)..key(250))
        .collect::<cub::Result<Vec<_>>>()?;

    assert_eq!(expected, actual);

    Ok(())
}
