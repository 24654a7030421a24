//! # Range Tombstones
//!
//! A range tombstone logically deletes every key in `[start, end)` whose
//! sequence is below the tombstone's. Tombstones may overlap arbitrarily
//! as written; readers want a normalized view, so this module provides:
//!
//! - [`RangeTombstone`] — the raw `(start, end, seq)` marker shared by
//!   the memtable, SSTables, and compaction.
//! - [`FragmentedRangeTombstones`] — a coalesced, non-overlapping view.
//!   Overlapping tombstones are split at every boundary; each fragment
//!   carries the sequences of all tombstones covering it, descending.
//! - [`RangeTombstoneAggregator`] — the read-side combiner. Constructed
//!   with an upper-bound sequence (the reader's snapshot, or max), fed
//!   one fragmented list per source level, and asked
//!   ["is `(key, seq)` deleted?"](RangeTombstoneAggregator::should_delete).


use std::cmp::Ordering;

use crate::keys::{ComparatorRef, SequenceNumber};

// ------------------------------------------------------------------------------------------------
// RangeTombstone
// ------------------------------------------------------------------------------------------------

/// A range deletion marker covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    /// Inclusive start key of the deleted range.
    pub start: Vec<u8>,

    /// Exclusive end key of the deleted range.
    pub end: Vec<u8>,

    /// Sequence number of the deletion.
    pub seq: SequenceNumber,
}

impl RangeTombstone {
    /// Creates a new range tombstone covering `[start, end)`.
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>, seq: SequenceNumber) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            seq,
        }
    }

    /// `true` if `key` falls inside `[start, end)` under `cmp`.
    pub fn covers(&self, cmp: &ComparatorRef, key: &[u8]) -> bool {
        cmp.compare(&self.start, key) != Ordering::Greater
            && cmp.compare(key, &self.end) == Ordering::Less
    }
}

// ------------------------------------------------------------------------------------------------
// Fragmented view
// ------------------------------------------------------------------------------------------------

/// One non-overlapping fragment of the coalesced tombstone view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneFragment {
    /// Inclusive fragment start.
    pub start: Vec<u8>,

    /// Exclusive fragment end.
    pub end: Vec<u8>,

    /// Sequences of every tombstone covering this fragment, descending.
    pub seqs: Vec<SequenceNumber>,
}

/// A coalesced, non-overlapping view over a set of range tombstones.
///
/// Fragments are sorted by start key and never overlap; adjacent
/// fragments with identical sequence sets are left split (the view is
/// for lookup, not minimality).
#[derive(Debug, Clone, Default)]
pub struct FragmentedRangeTombstones {
    fragments: Vec<TombstoneFragment>,
}

impl FragmentedRangeTombstones {
    /// Builds the fragmented view from raw tombstones.
    ///
    /// Splits every overlapping pair at their boundaries: for tombstones
    /// `[a, c) @ 5` and `[b, d) @ 8` the fragments are `[a, b) @ [5]`,
    /// `[b, c) @ [8, 5]`, `[c, d) @ [8]`.
    pub fn build(tombstones: &[RangeTombstone], cmp: &ComparatorRef) -> Self {
        if tombstones.is_empty() {
            return Self::default();
        }

        // Collect and dedup all boundary keys.
        let mut boundaries: Vec<&[u8]> = Vec::with_capacity(tombstones.len() * 2);
        for t in tombstones {
            if cmp.compare(&t.start, &t.end) == Ordering::Less {
                boundaries.push(&t.start);
                boundaries.push(&t.end);
            }
        }
        boundaries.sort_by(|a, b| cmp.compare(a, b));
        boundaries.dedup_by(|a, b| cmp.compare(a, b) == Ordering::Equal);

        let mut fragments = Vec::new();
        for window in boundaries.windows(2) {
            let (lo, hi) = (window[0], window[1]);
            let mut seqs: Vec<SequenceNumber> = tombstones
                .iter()
                .filter(|t| {
                    cmp.compare(&t.start, lo) != Ordering::Greater
                        && cmp.compare(hi, &t.end) != Ordering::Greater
                })
                .map(|t| t.seq)
                .collect();
            if seqs.is_empty() {
                continue;
            }
            seqs.sort_unstable_by(|a, b| b.cmp(a));
            seqs.dedup();
            fragments.push(TombstoneFragment {
                start: lo.to_vec(),
                end: hi.to_vec(),
                seqs,
            });
        }

        Self { fragments }
    }

    /// `true` if the view holds no fragments.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// The fragments, sorted by start key.
    pub fn fragments(&self) -> &[TombstoneFragment] {
        &self.fragments
    }

    /// Flattens the view back into raw `(start, end, seq)` tombstones,
    /// one per `(fragment, seq)` pair. Used when re-emitting tombstones
    /// into compaction outputs.
    pub fn to_tombstones(&self) -> Vec<RangeTombstone> {
        let mut out = Vec::new();
        for frag in &self.fragments {
            for &seq in &frag.seqs {
                out.push(RangeTombstone {
                    start: frag.start.clone(),
                    end: frag.end.clone(),
                    seq,
                });
            }
        }
        out
    }

    /// The highest tombstone sequence ≤ `upper_bound` covering `key`.
    pub fn covering_seq(
        &self,
        cmp: &ComparatorRef,
        key: &[u8],
        upper_bound: SequenceNumber,
    ) -> Option<SequenceNumber> {
        // Fragments are sorted by start and non-overlapping: binary
        // search for the last fragment starting at or before `key`.
        let idx = self
            .fragments
            .partition_point(|f| cmp.compare(&f.start, key) != Ordering::Greater);
        if idx == 0 {
            return None;
        }
        let frag = &self.fragments[idx - 1];
        if cmp.compare(key, &frag.end) != Ordering::Less {
            return None;
        }
        frag.seqs.iter().copied().find(|&s| s <= upper_bound)
    }
}

// ------------------------------------------------------------------------------------------------
// Aggregator
// ------------------------------------------------------------------------------------------------

/// Combines fragmented tombstone lists from multiple sources for one
/// read (a point lookup or an iterator).
///
/// The `level` passed to [`add_tombstones`](Self::add_tombstones) keeps
/// aggregation order deterministic when several sources contribute;
/// point-lookup correctness depends only on sequences.
pub struct RangeTombstoneAggregator {
    /// Snapshot visibility bound: tombstones above it are invisible.
    upper_bound: SequenceNumber,

    /// User-key comparator.
    cmp: ComparatorRef,

    /// `(level, list)` pairs, ordered by level.
    lists: Vec<(usize, FragmentedRangeTombstones)>,
}

impl RangeTombstoneAggregator {
    /// Creates an aggregator reading at `upper_bound`.
    pub fn new(cmp: ComparatorRef, upper_bound: SequenceNumber) -> Self {
        Self {
            upper_bound,
            cmp,
            lists: Vec::new(),
        }
    }

    /// Adds one source's fragmented tombstones under a level tag.
    ///
    /// Memtables conventionally use level 0; SSTables use
    /// `level + 1` so the ordering stays stable.
    pub fn add_tombstones(&mut self, level: usize, list: FragmentedRangeTombstones) {
        if list.is_empty() {
            return;
        }
        let pos = self.lists.partition_point(|(l, _)| *l <= level);
        self.lists.insert(pos, (level, list));
    }

    /// `true` if some visible tombstone deletes `(user_key, seq)`:
    /// a tombstone sequence `t` exists with `t ≤ upper_bound` and
    /// `t > seq` covering `user_key`.
    pub fn should_delete(&self, user_key: &[u8], seq: SequenceNumber) -> bool {
        self.lists.iter().any(|(_, list)| {
            list.covering_seq(&self.cmp, user_key, self.upper_bound)
                .is_some_and(|t| t > seq)
        })
    }

    /// The highest visible tombstone sequence covering `user_key`.
    pub fn max_covering_seq(&self, user_key: &[u8]) -> Option<SequenceNumber> {
        self.lists
            .iter()
            .filter_map(|(_, list)| list.covering_seq(&self.cmp, user_key, self.upper_bound))
            .max()
    }

    /// The aggregator's visibility bound.
    pub fn upper_bound(&self) -> SequenceNumber {
        self.upper_bound
    }

    /// `true` if no source contributed tombstones.
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

impl std::fmt::Debug for RangeTombstoneAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeTombstoneAggregator")
            .field("upper_bound", &self.upper_bound)
            .field("lists", &self.lists.len())
            .finish()
    }
}
