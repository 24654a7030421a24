//! Range-delete correctness, including the cross-SST scenario: a range
//! tombstone flushed into one table must shadow puts flushed earlier
//! into another, and survive reopen.

use tempfile::TempDir;

use crate::engine::tests::helpers::*;

fn key(i: usize) -> Vec<u8> {
    format!("key{i:02}").into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value{i:02}").into_bytes()
}

#[test]
fn range_delete_hides_keys_in_memtable() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    for i in 0..10 {
        db.put(key(i), value(i)).unwrap();
    }
    db.delete_range(key(3), key(7)).unwrap();

    for i in 0..10 {
        let expected = if (3..7).contains(&i) { None } else { Some(value(i)) };
        assert_eq!(db.get(key(i)).unwrap(), expected, "key{i:02}");
    }
    db.close().unwrap();
}

#[test]
fn cross_sst_range_delete() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());

    // Puts land in the first SST.
    for i in 0..10 {
        db.put(key(i), value(i)).unwrap();
    }
    db.flush().unwrap();

    // The tombstone lands in a second SST with higher sequences.
    db.delete_range(key(3), key(7)).unwrap();
    db.flush().unwrap();

    let stats = db.stats();
    assert!(stats.files_per_level[0] >= 2, "expected two L0 tables");

    assert_eq!(db.get(key(2)).unwrap(), Some(value(2)));
    assert_eq!(db.get(key(6)).unwrap(), None);
    assert_eq!(db.get(key(7)).unwrap(), Some(value(7)));

    let expected: Vec<Vec<u8>> = [0, 1, 2, 7, 8, 9].iter().map(|&i| key(i)).collect();
    assert_eq!(collect_keys(&db), expected);

    // Close, reopen: same results.
    let db = reopen(db, tmp.path(), manual_options());
    assert_eq!(db.get(key(2)).unwrap(), Some(value(2)));
    assert_eq!(db.get(key(6)).unwrap(), None);
    assert_eq!(db.get(key(7)).unwrap(), Some(value(7)));
    assert_eq!(collect_keys(&db), expected);
    db.close().unwrap();
}

#[test]
fn range_delete_law_over_every_key_in_range() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    for i in 0..50 {
        db.put(key(i), value(i)).unwrap();
    }
    db.delete_range(key(10), key(40)).unwrap();

    for i in 0..50 {
        let got = db.get(key(i)).unwrap();
        if (10..40).contains(&i) {
            assert_eq!(got, None, "key{i:02} inside [10, 40) must be gone");
        } else {
            assert_eq!(got, Some(value(i)), "key{i:02} outside the range survives");
        }
    }
    db.close().unwrap();
}

#[test]
fn writes_after_range_delete_are_visible() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    db.put(key(5), value(5)).unwrap();
    db.delete_range(key(0), key(9)).unwrap();
    assert_eq!(db.get(key(5)).unwrap(), None);

    // A newer put wins over the older tombstone.
    db.put(key(5), b"resurrected").unwrap();
    assert_eq!(db.get(key(5)).unwrap(), Some(b"resurrected".to_vec()));
    db.close().unwrap();
}

#[test]
fn empty_and_inverted_ranges_are_noops() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    for i in 0..5 {
        db.put(key(i), value(i)).unwrap();
    }
    db.delete_range(key(2), key(2)).unwrap();
    db.delete_range(key(4), key(1)).unwrap();

    for i in 0..5 {
        assert_eq!(db.get(key(i)).unwrap(), Some(value(i)));
    }
    db.close().unwrap();
}

#[test]
fn overlapping_range_deletes_compose() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), memtable_only_options());

    for i in 0..10 {
        db.put(key(i), value(i)).unwrap();
    }
    db.delete_range(key(1), key(5)).unwrap();
    db.delete_range(key(3), key(8)).unwrap();

    for i in 0..10 {
        let expected = if (1..8).contains(&i) { None } else { Some(value(i)) };
        assert_eq!(db.get(key(i)).unwrap(), expected, "key{i:02}");
    }
    db.close().unwrap();
}

#[test]
fn range_delete_survives_compaction() {
    let tmp = TempDir::new().unwrap();
    let db = open_db(tmp.path(), manual_options());

    for i in 0..10 {
        db.put(key(i), value(i)).unwrap();
    }
    db.flush().unwrap();
    db.delete_range(key(3), key(7)).unwrap();
    db.flush().unwrap();

    db.compact_range(None, None).unwrap();

    let expected: Vec<Vec<u8>> = [0, 1, 2, 7, 8, 9].iter().map(|&i| key(i)).collect();
    assert_eq!(collect_keys(&db), expected);
    assert_eq!(db.get(key(4)).unwrap(), None);
    db.close().unwrap();
}
