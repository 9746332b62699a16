//! SHALE - Store Facade Tests

use std::ops::ControlFlow;

use shale::config::Config;
use shale::error::ShaleError;
use shale::store::Store;

fn open_store(dir: &std::path::Path, buckets: &[&str]) -> Store {
    Store::open(Config::new(dir.join("store.db")), buckets).unwrap()
}

fn fill(store: &Store, bucket: &str, n: usize) {
    for i in 1..=n {
        store
            .add(bucket, format!("{i:02}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
}

#[test]
fn test_select_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), &["log"]);
    fill(&store, "log", 10);

    let mut seen = Vec::new();
    store
        .select("log", 3, 2, |k, _| seen.push(String::from_utf8(k.to_vec()).unwrap()))
        .unwrap();
    assert_eq!(seen, ["08", "07", "06"]);

    let mut all = 0;
    store.select("log", 0, 0, |_, _| all += 1).unwrap();
    assert_eq!(all, 10);

    let mut none = 0;
    store.select("missing", 5, 0, |_, _| none += 1).unwrap();
    assert_eq!(none, 0);
}

#[test]
fn test_typed_accessors() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), &["cfg"]);

    store.set_int("cfg", "retries", -3).unwrap();
    store.set_int64("cfg", "offset", i64::MIN).unwrap();
    store.set_uint64("cfg", "size", u64::MAX).unwrap();
    store.set_string("cfg", "name", "shale").unwrap();
    store.set_bool("cfg", "enabled", true).unwrap();
    store.set_bool("cfg", "verbose", false).unwrap();

    assert_eq!(store.int("cfg", "retries").unwrap(), -3);
    assert_eq!(store.int64("cfg", "offset").unwrap(), i64::MIN);
    assert_eq!(store.uint64("cfg", "size").unwrap(), u64::MAX);
    assert_eq!(store.string("cfg", "name").unwrap(), "shale");
    assert!(store.bool("cfg", "enabled").unwrap());
    assert!(!store.bool("cfg", "verbose").unwrap());
    assert_eq!(store.get("cfg", b"verbose").unwrap(), Some(b"0".to_vec()));

    // Absent keys read as zero values.
    assert_eq!(store.int("cfg", "absent").unwrap(), 0);
    assert_eq!(store.uint64("cfg", "absent").unwrap(), 0);
    assert_eq!(store.string("cfg", "absent").unwrap(), "");
    assert!(!store.bool("cfg", "absent").unwrap());

    // A string is not an integer.
    assert!(matches!(
        store.uint64("cfg", "name"),
        Err(ShaleError::InvalidValue { expected: 8, found: 5 })
    ));
}

#[test]
fn test_reset_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), &["tmp"]);
    fill(&store, "tmp", 20);

    store.reset_bucket("tmp").unwrap();
    assert!(store.has_bucket("tmp").unwrap());
    assert_eq!(store.count("tmp").unwrap(), 0);

    store.add("tmp", b"again", b"1").unwrap();
    assert_eq!(store.count("tmp").unwrap(), 1);
}

#[test]
fn test_iterate_until_break() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), &["b"]);
    fill(&store, "b", 10);

    let mut seen = Vec::new();
    store
        .iterate("b", |k, _| {
            seen.push(k.to_vec());
            if k == b"03" {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
    assert_eq!(seen, [b"01".to_vec(), b"02".to_vec(), b"03".to_vec()]);
}

#[test]
fn test_iterate_count_and_all() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), &["b"]);
    fill(&store, "b", 6);

    let mut first = Vec::new();
    store
        .iterate_count("b", 2, |_, v| first.push(v.to_vec()))
        .unwrap();
    assert_eq!(first, [b"v1".to_vec(), b"v2".to_vec()]);

    let mut zero = 0;
    store.iterate_count("b", 0, |_, _| zero += 1).unwrap();
    assert_eq!(zero, 0);

    let mut total = 0;
    store.all("b", |_, _| total += 1).unwrap();
    assert_eq!(total, 6);
}

#[test]
fn test_list_keeps_request_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), &["b"]);
    store.add("b", b"x", b"1").unwrap();
    store.add("b", b"y", b"2").unwrap();

    let values = store.list("b", &["y", "missing", "x"]).unwrap();
    assert_eq!(values, [Some(b"2".to_vec()), None, Some(b"1".to_vec())]);
    assert!(store.list("nope", &["x"]).unwrap().is_empty());
}

#[test]
fn test_counters_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path(), &[]);
        assert_eq!(store.next("orders").unwrap(), 1);
        assert_eq!(store.next("orders").unwrap(), 2);
        assert_eq!(store.next("invoices").unwrap(), 1);
        store.close().unwrap();
    }

    let store = open_store(dir.path(), &[]);
    assert_eq!(store.next("orders").unwrap(), 3);
    assert_eq!(store.next("invoices").unwrap(), 2);
}
