//! Merge-operand collection: the walk stops at a base put, a point
//! tombstone, or exhaustion, and respects the visibility bound.

use std::sync::Arc;

use crate::keys::{BytewiseComparator, ComparatorRef, ValueType};
use crate::memtable::Memtable;

fn cmp() -> ComparatorRef {
    Arc::new(BytewiseComparator)
}

#[test]
fn operands_collect_until_base_put() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::Value, b"k", b"base").unwrap();
    mem.add(2, ValueType::Merge, b"k", b"+1").unwrap();
    mem.add(3, ValueType::Merge, b"k", b"+2").unwrap();

    let lookup = mem.collect_merge_operands(b"k", u64::MAX).unwrap();
    assert!(lookup.found_base);
    assert!(!lookup.deleted);
    assert_eq!(lookup.base_value.as_deref(), Some(b"base".as_slice()));
    // Newest first.
    assert_eq!(lookup.operands, vec![b"+2".to_vec(), b"+1".to_vec()]);
}

#[test]
fn walk_stops_at_point_tombstone() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::Value, b"k", b"old").unwrap();
    mem.add(2, ValueType::Deletion, b"k", b"").unwrap();
    mem.add(3, ValueType::Merge, b"k", b"+1").unwrap();

    let lookup = mem.collect_merge_operands(b"k", u64::MAX).unwrap();
    assert!(lookup.deleted);
    assert!(!lookup.found_base);
    assert_eq!(lookup.base_value, None);
    assert_eq!(lookup.operands, vec![b"+1".to_vec()]);
}

#[test]
fn single_delete_also_terminates() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::SingleDeletion, b"k", b"").unwrap();
    mem.add(2, ValueType::Merge, b"k", b"+1").unwrap();

    let lookup = mem.collect_merge_operands(b"k", u64::MAX).unwrap();
    assert!(lookup.deleted);
    assert_eq!(lookup.operands, vec![b"+1".to_vec()]);
}

#[test]
fn exhaustion_leaves_no_base_and_no_delete() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::Merge, b"k", b"+1").unwrap();
    mem.add(2, ValueType::Merge, b"k", b"+2").unwrap();

    let lookup = mem.collect_merge_operands(b"k", u64::MAX).unwrap();
    assert!(!lookup.found_base);
    assert!(!lookup.deleted);
    assert_eq!(lookup.operands, vec![b"+2".to_vec(), b"+1".to_vec()]);
}

#[test]
fn upper_seq_hides_newer_records() {
    let mem = Memtable::new(cmp());
    mem.add(1, ValueType::Value, b"k", b"base").unwrap();
    mem.add(2, ValueType::Merge, b"k", b"+1").unwrap();
    mem.add(9, ValueType::Deletion, b"k", b"").unwrap();

    // At seq 5 the delete is invisible.
    let lookup = mem.collect_merge_operands(b"k", 5).unwrap();
    assert!(lookup.found_base);
    assert!(!lookup.deleted);
    assert_eq!(lookup.operands, vec![b"+1".to_vec()]);
}

#[test]
fn missing_key_yields_default() {
    let mem = Memtable::new(cmp());
    let lookup = mem.collect_merge_operands(b"absent", u64::MAX).unwrap();
    assert!(!lookup.found_base);
    assert!(!lookup.deleted);
    assert!(lookup.operands.is_empty());
    assert_eq!(lookup.base_value, None);
}
