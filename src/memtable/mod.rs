//! # Memtable Module
//!
//! ## Design Invariants
//!
//! - The memtable orders entries by internal key: user key ascending
//!   (per the injected comparator), then sequence descending, then type
//!   descending. Every version that consumed a sequence is retained —
//!   resolution is deferred to read time and compaction.
//! - Deletes are tombstone entries, never physical removal.
//! - Range tombstones live in a side store and logically delete keys in
//!   `[start, end)` with lower sequences.
//! - Once [`mark_immutable`](Memtable::mark_immutable) is called, every
//!   further write is rejected.
//!
//! ## Concurrency
//!
//! Interior `RwLock`: readers proceed concurrently; the single writer is
//! serialized by the engine lock on the write path. The engine shares
//! the table via `Arc`, so in-flight readers outlive a flush.
//!
//! ## Flush Semantics
//!
//! [`iter_for_flush`](Memtable::iter_for_flush) snapshots **all** point
//! versions in internal-key order plus every range tombstone — exactly
//! the stream the SSTable writer requires. It never mutates state.

#[cfg(test)]
mod tests;

use std::{
    cmp::{Ordering, Reverse},
    collections::BTreeMap,
    ops::Bound,
    sync::{
        RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering},
    },
};

use thiserror::Error;
use tracing::{error, trace};

use crate::keys::{ComparatorRef, HexKey, SequenceNumber, ValueType, pack_trailer};
use crate::tombstone::{FragmentedRangeTombstones, RangeTombstone};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Write attempted after the switch to immutable.
    #[error("Memtable is immutable")]
    Immutable,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Entry types
// ------------------------------------------------------------------------------------------------

/// One stored version of a user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemtableEntry {
    /// Sequence number of this version.
    pub seq: SequenceNumber,

    /// Record kind (`Value`, `Deletion`, `SingleDeletion`, `Merge`).
    pub kind: ValueType,

    /// Value bytes; empty for tombstones.
    pub value: Vec<u8>,
}

/// A `(user_key, version)` pair emitted by scans and the flush iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemtableRecord {
    /// The user key.
    pub user_key: Vec<u8>,

    /// The version.
    pub entry: MemtableEntry,
}

/// Result of [`Memtable::collect_merge_operands`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeLookup {
    /// The base put value, if the walk reached one.
    pub base_value: Option<Vec<u8>>,

    /// Merge operands, newest first.
    pub operands: Vec<Vec<u8>>,

    /// `true` if a base put terminated the walk.
    pub found_base: bool,

    /// `true` if a point tombstone terminated the walk.
    pub deleted: bool,
}

// ------------------------------------------------------------------------------------------------
// Comparator-ordered key wrapper
// ------------------------------------------------------------------------------------------------

/// BTreeMap key ordered by the injected user comparator.
///
/// Carries a comparator handle so `Ord` can delegate to it; the handle
/// is a pointer clone, not a comparator copy.
struct MemKey {
    cmp: ComparatorRef,
    bytes: Vec<u8>,
}

impl MemKey {
    fn new(cmp: &ComparatorRef, bytes: Vec<u8>) -> Self {
        Self {
            cmp: cmp.clone(),
            bytes,
        }
    }
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp.compare(&self.bytes, &other.bytes) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for MemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemKey({})", HexKey(&self.bytes))
    }
}

// ------------------------------------------------------------------------------------------------
// Memtable core
// ------------------------------------------------------------------------------------------------

/// Internal shared state, protected by the `RwLock`.
struct MemtableInner {
    /// Point entries grouped by user key, versions ordered by
    /// descending trailer (sequence desc, then type desc).
    tree: BTreeMap<MemKey, BTreeMap<Reverse<u64>, MemtableEntry>>,

    /// Range tombstones in insertion order.
    range_tombstones: Vec<RangeTombstone>,
}

/// The in-memory write buffer of the storage engine.
///
/// Owned by the engine and shared with readers and the flush job via
/// `Arc`. The engine appends to the WAL before applying batches here.
pub struct Memtable {
    /// Thread-safe container for entries and tombstones.
    inner: RwLock<MemtableInner>,

    /// User-key comparator.
    cmp: ComparatorRef,

    /// Approximate in-memory footprint in bytes.
    approximate_size: AtomicUsize,

    /// Number of point entries.
    entry_count: AtomicUsize,

    /// Flipped on handoff; rejects all further writes.
    immutable: AtomicBool,
}

impl Memtable {
    /// Creates an empty memtable ordering keys with `cmp`.
    pub fn new(cmp: ComparatorRef) -> Self {
        Self {
            inner: RwLock::new(MemtableInner {
                tree: BTreeMap::new(),
                range_tombstones: Vec::new(),
            }),
            cmp,
            approximate_size: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            immutable: AtomicBool::new(false),
        }
    }

    /// Inserts one point entry composed of `(user_key, seq, kind)`.
    pub fn add(
        &self,
        seq: SequenceNumber,
        kind: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) -> Result<(), MemtableError> {
        if self.is_immutable() {
            return Err(MemtableError::Immutable);
        }

        trace!(seq, %kind, key = %HexKey(user_key), "memtable add");

        let entry = MemtableEntry {
            seq,
            kind,
            value: value.to_vec(),
        };
        let record_size = std::mem::size_of::<MemtableEntry>() + user_key.len() + value.len();

        let mut guard = self.inner.write().map_err(|_| {
            error!("RwLock poisoned during add");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        guard
            .tree
            .entry(MemKey::new(&self.cmp, user_key.to_vec()))
            .or_default()
            .insert(Reverse(pack_trailer(seq, kind)), entry);

        self.approximate_size
            .fetch_add(record_size, AtomicOrdering::Relaxed);
        self.entry_count.fetch_add(1, AtomicOrdering::Relaxed);

        Ok(())
    }

    /// Inserts a range tombstone covering `[start, end)` into the side
    /// store.
    pub fn add_range_tombstone(
        &self,
        seq: SequenceNumber,
        start: &[u8],
        end: &[u8],
    ) -> Result<(), MemtableError> {
        if self.is_immutable() {
            return Err(MemtableError::Immutable);
        }

        trace!(seq, start = %HexKey(start), end = %HexKey(end), "memtable add range tombstone");

        let record_size = std::mem::size_of::<RangeTombstone>() + start.len() + end.len();

        let mut guard = self.inner.write().map_err(|_| {
            error!("RwLock poisoned during add_range_tombstone");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        guard
            .range_tombstones
            .push(RangeTombstone::new(start, end, seq));

        self.approximate_size
            .fetch_add(record_size, AtomicOrdering::Relaxed);

        Ok(())
    }

    /// Returns all versions of `user_key` with `seq ≤ upper_seq`,
    /// newest first. Range tombstones are **not** consulted here; the
    /// read path resolves them through the aggregator.
    pub fn point_versions(
        &self,
        user_key: &[u8],
        upper_seq: SequenceNumber,
    ) -> Result<Vec<MemtableEntry>, MemtableError> {
        let guard = self.read_guard()?;

        let Some(versions) = guard.tree.get(&MemKey::new(&self.cmp, user_key.to_vec())) else {
            return Ok(Vec::new());
        };

        Ok(versions
            .values()
            .filter(|e| e.seq <= upper_seq)
            .cloned()
            .collect())
    }

    /// Walks versions of `user_key` with `seq ≤ upper_seq` in
    /// descending sequence order, collecting merge operands until a base
    /// put, a point tombstone, or exhaustion.
    pub fn collect_merge_operands(
        &self,
        user_key: &[u8],
        upper_seq: SequenceNumber,
    ) -> Result<MergeLookup, MemtableError> {
        let guard = self.read_guard()?;
        let mut lookup = MergeLookup::default();

        let Some(versions) = guard.tree.get(&MemKey::new(&self.cmp, user_key.to_vec())) else {
            return Ok(lookup);
        };

        for entry in versions.values() {
            if entry.seq > upper_seq {
                continue;
            }
            match entry.kind {
                ValueType::Merge => lookup.operands.push(entry.value.clone()),
                ValueType::Value => {
                    lookup.base_value = Some(entry.value.clone());
                    lookup.found_base = true;
                    break;
                }
                ValueType::Deletion | ValueType::SingleDeletion => {
                    lookup.deleted = true;
                    break;
                }
                ValueType::RangeDeletion => {
                    // Range tombstones never live in the point tree.
                    return Err(MemtableError::Internal(
                        "range tombstone in point tree".into(),
                    ));
                }
            }
        }

        Ok(lookup)
    }

    /// Collects all versions inside the user-key bounds with
    /// `seq ≤ upper_seq`, in internal-key order.
    ///
    /// The iterator layer materializes this under a short read lock so
    /// its merged cursor never blocks writers.
    pub fn scan_versions(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        upper_seq: SequenceNumber,
    ) -> Result<Vec<MemtableRecord>, MemtableError> {
        let guard = self.read_guard()?;

        let lower = map_bound(lower, &self.cmp);
        let upper = map_bound(upper, &self.cmp);

        let mut records = Vec::new();
        for (key, versions) in guard.tree.range((lower, upper)) {
            for entry in versions.values() {
                if entry.seq > upper_seq {
                    continue;
                }
                records.push(MemtableRecord {
                    user_key: key.bytes.clone(),
                    entry: entry.clone(),
                });
            }
        }
        Ok(records)
    }

    /// Snapshots the whole table for flushing: every point version in
    /// internal-key order, plus all range tombstones.
    pub fn iter_for_flush(
        &self,
    ) -> Result<(Vec<MemtableRecord>, Vec<RangeTombstone>), MemtableError> {
        let guard = self.read_guard()?;

        let mut records = Vec::with_capacity(self.entry_count.load(AtomicOrdering::Relaxed));
        for (key, versions) in guard.tree.iter() {
            for entry in versions.values() {
                records.push(MemtableRecord {
                    user_key: key.bytes.clone(),
                    entry: entry.clone(),
                });
            }
        }

        Ok((records, guard.range_tombstones.clone()))
    }

    /// The raw range tombstones, insertion-ordered.
    pub fn range_tombstones(&self) -> Result<Vec<RangeTombstone>, MemtableError> {
        Ok(self.read_guard()?.range_tombstones.clone())
    }

    /// A coalesced tombstone view for the read path.
    pub fn fragmented_range_tombstones(
        &self,
    ) -> Result<FragmentedRangeTombstones, MemtableError> {
        let guard = self.read_guard()?;
        Ok(FragmentedRangeTombstones::build(
            &guard.range_tombstones,
            &self.cmp,
        ))
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(AtomicOrdering::Relaxed)
    }

    /// Number of point entries (all versions).
    pub fn count(&self) -> usize {
        self.entry_count.load(AtomicOrdering::Relaxed)
    }

    /// `true` if the table holds neither entries nor range tombstones.
    pub fn is_empty(&self) -> bool {
        self.count() == 0 && !self.has_range_tombstones()
    }

    /// `true` if the side store holds any range tombstones.
    pub fn has_range_tombstones(&self) -> bool {
        self.inner
            .read()
            .map(|g| !g.range_tombstones.is_empty())
            .unwrap_or(false)
    }

    /// Flips the immutable flag. Further writes fail with
    /// [`MemtableError::Immutable`].
    pub fn mark_immutable(&self) {
        self.immutable.store(true, AtomicOrdering::SeqCst);
    }

    /// `true` once the table has been handed off for flushing.
    pub fn is_immutable(&self) -> bool {
        self.immutable.load(AtomicOrdering::SeqCst)
    }

    /// The highest sequence stored, if any. Recovery uses this to
    /// re-establish the engine counter.
    pub fn max_seq(&self) -> Result<Option<SequenceNumber>, MemtableError> {
        let guard = self.read_guard()?;
        let point_max = guard
            .tree
            .values()
            .filter_map(|versions| versions.values().map(|e| e.seq).max())
            .max();
        let range_max = guard.range_tombstones.iter().map(|t| t.seq).max();
        Ok(point_max.max(range_max))
    }

    fn read_guard(&self) -> Result<std::sync::RwLockReadGuard<'_, MemtableInner>, MemtableError> {
        self.inner.read().map_err(|_| {
            error!("RwLock poisoned during read");
            MemtableError::Internal("RwLock poisoned".into())
        })
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("entries", &self.count())
            .field("bytes", &self.approximate_memory_usage())
            .field("immutable", &self.is_immutable())
            .finish()
    }
}

/// Maps a borrowed bound to an owned `MemKey` bound for `BTreeMap::range`.
fn map_bound(bound: Bound<&[u8]>, cmp: &ComparatorRef) -> Bound<MemKey> {
    match bound {
        Bound::Included(k) => Bound::Included(MemKey::new(cmp, k.to_vec())),
        Bound::Excluded(k) => Bound::Excluded(MemKey::new(cmp, k.to_vec())),
        Bound::Unbounded => Bound::Unbounded,
    }
}
