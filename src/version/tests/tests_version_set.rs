//! VersionSet tests: create/recover, log_and_apply, counters, level
//! invariants, and file lookup.

use std::sync::Arc;

use tempfile::TempDir;

use crate::keys::{BytewiseComparator, ComparatorRef, InternalKey, ValueType};
use crate::version::{FileMetaData, VersionEdit, VersionError, VersionSet};

fn cmp() -> ComparatorRef {
    Arc::new(BytewiseComparator)
}

fn meta(number: u64, lo: &str, hi: &str, smallest_seq: u64, largest_seq: u64) -> Arc<FileMetaData> {
    Arc::new(FileMetaData::new(
        number,
        1024,
        InternalKey::new(lo.as_bytes().to_vec(), largest_seq, ValueType::Value),
        InternalKey::new(hi.as_bytes().to_vec(), smallest_seq, ValueType::Value),
        smallest_seq,
        largest_seq,
        0,
    ))
}

#[test]
fn create_writes_current_and_manifest() {
    let tmp = TempDir::new().unwrap();
    let set = VersionSet::create(tmp.path(), cmp()).unwrap();

    assert!(tmp.path().join("CURRENT").exists());
    assert!(tmp.path().join("MANIFEST-000001").exists());
    assert_eq!(set.last_sequence(), 0);
    assert_eq!(set.current().num_files(0), 0);
    assert_eq!(set.column_families(), &[(0, "default".to_string())]);
}

#[test]
fn recover_missing_database_fails() {
    let tmp = TempDir::new().unwrap();
    let err = VersionSet::recover(tmp.path(), cmp()).unwrap_err();
    assert!(matches!(err, VersionError::DatabaseNotFound(_)));
}

#[test]
fn log_and_apply_publishes_new_version() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    let mut edit = VersionEdit {
        last_sequence: Some(10),
        ..VersionEdit::default()
    };
    edit.add_file(0, meta(5, "a", "m", 1, 10));
    set.log_and_apply(edit).unwrap();

    let current = set.current();
    assert_eq!(current.num_files(0), 1);
    assert_eq!(set.last_sequence(), 10);
}

#[test]
fn state_survives_recovery() {
    let tmp = TempDir::new().unwrap();
    {
        let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();
        let mut edit = VersionEdit {
            last_sequence: Some(42),
            log_number: Some(3),
            ..VersionEdit::default()
        };
        edit.add_file(0, meta(5, "a", "m", 1, 42));
        edit.add_file(1, meta(6, "n", "z", 1, 30));
        set.log_and_apply(edit).unwrap();
    }

    let mut set = VersionSet::recover(tmp.path(), cmp()).unwrap();
    assert_eq!(set.last_sequence(), 42);
    assert_eq!(set.log_number(), 3);
    let current = set.current();
    assert_eq!(current.num_files(0), 1);
    assert_eq!(current.num_files(1), 1);
    // Numbers at or below recovered files are never reissued.
    assert!(set.next_file_number() > 6);
}

#[test]
fn deleted_files_disappear_from_the_next_version() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    let mut add = VersionEdit::default();
    add.add_file(1, meta(5, "a", "f", 1, 5));
    add.add_file(1, meta(6, "g", "m", 6, 9));
    set.log_and_apply(add).unwrap();
    assert_eq!(set.current().num_files(1), 2);

    let mut del = VersionEdit::default();
    del.delete_file(1, 5);
    set.log_and_apply(del).unwrap();
    assert_eq!(set.current().num_files(1), 1);
    assert_eq!(set.current().level_files(1)[0].number, 6);
}

#[test]
fn last_sequence_never_decreases() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    set.set_last_sequence(100);
    set.set_last_sequence(50);
    assert_eq!(set.last_sequence(), 100);

    let edit = VersionEdit {
        last_sequence: Some(10),
        ..VersionEdit::default()
    };
    set.log_and_apply(edit).unwrap();
    assert_eq!(set.last_sequence(), 100, "edit must not roll the counter back");
}

#[test]
fn file_numbers_are_monotonic() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    let a = set.next_file_number();
    let b = set.next_file_number();
    assert!(b > a);

    set.mark_file_number_used(1000);
    assert!(set.next_file_number() > 1000);
}

#[test]
fn overlapping_l1_files_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    let mut edit = VersionEdit::default();
    edit.add_file(1, meta(5, "a", "m", 1, 5));
    edit.add_file(1, meta(6, "h", "z", 6, 9));
    let err = set.log_and_apply(edit).unwrap_err();
    assert!(matches!(err, VersionError::Corrupt(_)));
}

#[test]
fn l0_orders_newest_first_and_may_overlap() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    let mut edit = VersionEdit::default();
    edit.add_file(0, meta(5, "a", "z", 1, 5));
    edit.add_file(0, meta(9, "a", "z", 6, 9));
    set.log_and_apply(edit).unwrap();

    let numbers: Vec<u64> = set
        .current()
        .level_files(0)
        .iter()
        .map(|f| f.number)
        .collect();
    assert_eq!(numbers, vec![9, 5]);
}

#[test]
fn files_for_key_walks_levels() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    let mut edit = VersionEdit::default();
    edit.add_file(0, meta(10, "a", "z", 20, 29));
    edit.add_file(1, meta(5, "a", "f", 1, 5));
    edit.add_file(1, meta(6, "g", "m", 6, 9));
    set.log_and_apply(edit).unwrap();

    let version = set.current();
    let hits = version.files_for_key(b"c");
    let numbers: Vec<u64> = hits.iter().map(|(_, f)| f.number).collect();
    assert_eq!(numbers, vec![10, 5]);

    let hits = version.files_for_key(b"h");
    let numbers: Vec<u64> = hits.iter().map(|(_, f)| f.number).collect();
    assert_eq!(numbers, vec![10, 6]);

    // Between L1 files: only the L0 file can hold it.
    let version = set.current();
    let hits = version.files_for_key(b"zz");
    assert!(hits.is_empty());
}

#[test]
fn overlapping_files_uses_bounds() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    let mut edit = VersionEdit::default();
    edit.add_file(1, meta(5, "a", "f", 1, 5));
    edit.add_file(1, meta(6, "g", "m", 6, 9));
    edit.add_file(1, meta(7, "n", "t", 10, 12));
    set.log_and_apply(edit).unwrap();

    let version = set.current();
    let hit = |lo: &[u8], hi: &[u8]| -> Vec<u64> {
        version
            .overlapping_files(1, Some(lo), Some(hi))
            .iter()
            .map(|f| f.number)
            .collect()
    };

    assert_eq!(hit(b"b", b"c"), vec![5]);
    assert_eq!(hit(b"e", b"h"), vec![5, 6]);
    assert_eq!(hit(b"a", b"z"), vec![5, 6, 7]);
    assert!(hit(b"u", b"z").is_empty());
}

#[test]
fn live_versions_tracked_while_referenced() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::create(tmp.path(), cmp()).unwrap();

    let old = set.current();
    let mut edit = VersionEdit::default();
    edit.add_file(0, meta(5, "a", "z", 1, 5));
    set.log_and_apply(edit).unwrap();

    assert!(set.num_live_versions() >= 2, "old version still referenced");
    drop(old);
    assert_eq!(set.num_live_versions(), 1);
}

#[test]
fn comparator_mismatch_rejected_on_recover() {
    struct Renamed;
    impl crate::keys::Comparator for Renamed {
        fn name(&self) -> &str {
            "test.Renamed"
        }
        fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
            a.cmp(b)
        }
    }

    let tmp = TempDir::new().unwrap();
    {
        let _set = VersionSet::create(tmp.path(), cmp()).unwrap();
    }
    let err = VersionSet::recover(tmp.path(), Arc::new(Renamed)).unwrap_err();
    assert!(matches!(err, VersionError::IncompatibleFormat(_)));
}
