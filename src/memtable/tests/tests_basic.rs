//! Memtable basics: versioned adds, visibility by sequence, the flush
//! snapshot, and the immutable flag.

use std::ops::Bound;
use std::sync::Arc;

use crate::keys::{BytewiseComparator, ComparatorRef, ValueType};
use crate::memtable::{Memtable, MemtableError};

fn cmp() -> ComparatorRef {
    Arc::new(BytewiseComparator)
}

#[test]
fn empty_table_reports_empty() {
    let mem = Memtable::new(cmp());
    assert!(mem.is_empty());
    assert_eq!(mem.count(), 0);
    assert_eq!(mem.approximate_memory_usage(), 0);
    assert!(!mem.has_range_tombstones());
    assert_eq!(mem.max_seq().unwrap(), None);
}

#[test]
fn version_map_key_is_the_reversed_trailer() {
    use std::cmp::Reverse;

    use crate::keys::{pack_trailer, unpack_trailer};

    // The version map sorts on `Reverse(trailer)`; newer sequences and
    // higher type tags must come first, and the packing must be
    // reversible so nothing is lost in the map key.
    let newer = pack_trailer(9, ValueType::Value);
    let older = pack_trailer(5, ValueType::Value);
    let older_high_tag = pack_trailer(5, ValueType::SingleDeletion);

    assert!(Reverse(newer) < Reverse(older));
    assert!(Reverse(older_high_tag) < Reverse(older));
    assert_eq!(unpack_trailer(newer), Some((9, ValueType::Value)));
    assert_eq!(
        unpack_trailer(older_high_tag),
        Some((5, ValueType::SingleDeletion))
    );
}

#[test]
fn point_versions_newest_first() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::Value, b"k", b"v1").unwrap();
    mem.add(5, ValueType::Value, b"k", b"v2").unwrap();
    mem.add(9, ValueType::Deletion, b"k", b"").unwrap();

    let versions = mem.point_versions(b"k", u64::MAX).unwrap();
    let seqs: Vec<u64> = versions.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![9, 5, 1]);
    assert_eq!(versions[0].kind, ValueType::Deletion);
    assert_eq!(versions[2].value, b"v1");
}

#[test]
fn upper_seq_filters_invisible_versions() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::Value, b"k", b"v1").unwrap();
    mem.add(5, ValueType::Value, b"k", b"v2").unwrap();

    let versions = mem.point_versions(b"k", 3).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].seq, 1);
    assert_eq!(versions[0].value, b"v1");
}

#[test]
fn scan_versions_ordered_by_internal_key() {
    let mem = Memtable::new(cmp());
    mem.add(2, ValueType::Value, b"b", b"vb").unwrap();
    mem.add(1, ValueType::Value, b"a", b"va1").unwrap();
    mem.add(3, ValueType::Value, b"a", b"va2").unwrap();
    mem.add(4, ValueType::Value, b"c", b"vc").unwrap();

    let records = mem
        .scan_versions(Bound::Unbounded, Bound::Unbounded, u64::MAX)
        .unwrap();
    let view: Vec<(&[u8], u64)> = records
        .iter()
        .map(|r| (r.user_key.as_slice(), r.entry.seq))
        .collect();
    // User keys ascending, sequences descending within a key.
    assert_eq!(
        view,
        vec![
            (b"a".as_slice(), 3),
            (b"a".as_slice(), 1),
            (b"b".as_slice(), 2),
            (b"c".as_slice(), 4),
        ]
    );
}

#[test]
fn scan_respects_bounds() {
    let mem = Memtable::new(cmp());
    for (seq, key) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
        mem.add(seq, ValueType::Value, key.as_bytes(), b"v").unwrap();
    }

    let records = mem
        .scan_versions(
            Bound::Included(b"b".as_slice()),
            Bound::Excluded(b"d".as_slice()),
            u64::MAX,
        )
        .unwrap();
    let keys: Vec<&[u8]> = records.iter().map(|r| r.user_key.as_slice()).collect();
    assert_eq!(keys, vec![b"b".as_slice(), b"c".as_slice()]);
}

#[test]
fn flush_snapshot_contains_every_version() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::Value, b"k", b"v1").unwrap();
    mem.add(2, ValueType::Value, b"k", b"v2").unwrap();
    mem.add_range_tombstone(3, b"a", b"z").unwrap();

    let (records, tombstones) = mem.iter_for_flush().unwrap();
    assert_eq!(records.len(), 2, "both versions must flush");
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].seq, 3);

    // Flushing must not consume the table.
    assert_eq!(mem.count(), 2);
}

#[test]
fn immutable_rejects_all_writes() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::Value, b"k", b"v").unwrap();
    mem.mark_immutable();
    assert!(mem.is_immutable());

    let err = mem.add(2, ValueType::Value, b"k", b"v2").unwrap_err();
    assert!(matches!(err, MemtableError::Immutable));
    let err = mem.add_range_tombstone(3, b"a", b"z").unwrap_err();
    assert!(matches!(err, MemtableError::Immutable));

    // Reads still work.
    assert_eq!(mem.point_versions(b"k", u64::MAX).unwrap().len(), 1);
}

#[test]
fn max_seq_tracks_points_and_tombstones() {
    let mem = Memtable::new(cmp());
    mem.add(4, ValueType::Value, b"k", b"v").unwrap();
    assert_eq!(mem.max_seq().unwrap(), Some(4));

    mem.add_range_tombstone(9, b"a", b"z").unwrap();
    assert_eq!(mem.max_seq().unwrap(), Some(9));
}

#[test]
fn memory_usage_grows_with_inserts() {
    let mem = Memtable::new(cmp());
    let before = mem.approximate_memory_usage();
    mem.add(1, ValueType::Value, b"key", &vec![0u8; 100]).unwrap();
    assert!(mem.approximate_memory_usage() > before + 100);
}

#[test]
fn concurrent_readers_during_writes() {
    let mem = Arc::new(Memtable::new(cmp()));

    let writer = {
        let mem = mem.clone();
        std::thread::spawn(move || {
            for seq in 1..=500u64 {
                let key = format!("key-{:03}", seq % 50);
                mem.add(seq, ValueType::Value, key.as_bytes(), b"value")
                    .unwrap();
            }
        })
    };

    for _ in 0..100 {
        // Results vary while the writer runs; the reads must simply
        // never fail or tear.
        let _ = mem.point_versions(b"key-001", u64::MAX).unwrap();
    }
    writer.join().unwrap();

    assert_eq!(mem.count(), 500);
}
