//! DB iterator — the merged, snapshot-consistent read cursor.
//!
//! A [`DbIter`] captures the active memtable, the immutable memtable if
//! present, and the current version's tables (all by reference count),
//! plus a range-tombstone aggregator populated from every source. It
//! merges the sources in internal-key order and resolves visibility per
//! user key:
//!
//! 1. Only records with `seq ≤ snapshot` participate.
//! 2. The newest participating record decides: a put is emitted, a
//!    tombstone (point or covering range) suppresses the key, merge
//!    operands fold through the configured operator.
//! 3. Bounds (lower inclusive, upper exclusive) and the optional prefix
//!    constraint invalidate the cursor when crossed.
//!
//! Direction changes re-seek the children — per-child cursors are only
//! efficient one way. Returned key/value slices are owned copies; they
//! never alias internal buffers.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::config::{MergeOperatorRef, PrefixExtractorRef};
use crate::keys::{
    InternalKeyComparator, SequenceNumber, ValueType, make_internal_key,
};
use crate::memtable::{Memtable, MemtableRecord};
use crate::sstable::{PointEntry, SSTable, SSTableError, TableIter};
use crate::tombstone::RangeTombstoneAggregator;
use crate::version::Version;

use super::DbError;

// ------------------------------------------------------------------------------------------------
// Child iterators
// ------------------------------------------------------------------------------------------------

/// A seekable, bidirectional stream of point entries in internal-key
/// order. Implemented by the memtable snapshot and by table cursors.
pub(crate) trait InternalIterator {
    fn valid(&self) -> bool;
    fn entry(&self) -> Option<&PointEntry>;
    fn seek(&mut self, target: &[u8]) -> Result<(), SSTableError>;
    fn seek_to_first(&mut self) -> Result<(), SSTableError>;
    fn seek_to_last(&mut self) -> Result<(), SSTableError>;
    fn next(&mut self) -> Result<(), SSTableError>;
    fn prev(&mut self) -> Result<(), SSTableError>;
}

/// Child over a materialized memtable range.
pub(crate) struct VecSource {
    entries: Vec<PointEntry>,
    icmp: InternalKeyComparator,
    pos: Option<usize>,
}

impl VecSource {
    pub(crate) fn new(records: Vec<MemtableRecord>, icmp: InternalKeyComparator) -> Self {
        let entries = records
            .into_iter()
            .map(|r| PointEntry {
                user_key: r.user_key,
                seq: r.entry.seq,
                kind: r.entry.kind,
                value: r.entry.value,
            })
            .collect();
        Self {
            entries,
            icmp,
            pos: None,
        }
    }
}

impl InternalIterator for VecSource {
    fn valid(&self) -> bool {
        self.pos.is_some_and(|p| p < self.entries.len())
    }

    fn entry(&self) -> Option<&PointEntry> {
        self.pos.and_then(|p| self.entries.get(p))
    }

    fn seek(&mut self, target: &[u8]) -> Result<(), SSTableError> {
        let pos = self.entries.partition_point(|e| {
            self.icmp.compare(&e.internal_key(), target) == Ordering::Less
        });
        self.pos = (pos < self.entries.len()).then_some(pos);
        Ok(())
    }

    fn seek_to_first(&mut self) -> Result<(), SSTableError> {
        self.pos = (!self.entries.is_empty()).then_some(0);
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<(), SSTableError> {
        self.pos = self.entries.len().checked_sub(1);
        Ok(())
    }

    fn next(&mut self) -> Result<(), SSTableError> {
        if let Some(p) = self.pos {
            self.pos = (p + 1 < self.entries.len()).then_some(p + 1);
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<(), SSTableError> {
        self.pos = match self.pos {
            Some(p) => p.checked_sub(1),
            None => None,
        };
        Ok(())
    }
}

/// Child over one SSTable, owning its reader handle.
pub(crate) struct TableSource {
    iter: TableIter<Arc<SSTable>>,
}

impl TableSource {
    pub(crate) fn new(table: Arc<SSTable>) -> Result<Self, SSTableError> {
        Ok(Self {
            iter: TableIter::new(table)?,
        })
    }
}

impl InternalIterator for TableSource {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn entry(&self) -> Option<&PointEntry> {
        self.iter.current()
    }

    fn seek(&mut self, target: &[u8]) -> Result<(), SSTableError> {
        self.iter.seek(target)
    }

    fn seek_to_first(&mut self) -> Result<(), SSTableError> {
        self.iter.seek_to_first()
    }

    fn seek_to_last(&mut self) -> Result<(), SSTableError> {
        self.iter.seek_to_last()
    }

    fn next(&mut self) -> Result<(), SSTableError> {
        self.iter.next()
    }

    fn prev(&mut self) -> Result<(), SSTableError> {
        self.iter.prev()
    }
}

// ------------------------------------------------------------------------------------------------
// Direction
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

// ------------------------------------------------------------------------------------------------
// DbIter
// ------------------------------------------------------------------------------------------------

/// Snapshot-consistent merged iterator over the whole database.
///
/// Obtained from [`Db::iter`](crate::engine::Db::iter). Holds reference
/// counts on the memtables and version it reads, so flushes and
/// compactions cannot invalidate it.
pub struct DbIter {
    children: Vec<Box<dyn InternalIterator + Send>>,
    icmp: InternalKeyComparator,
    aggregator: RangeTombstoneAggregator,
    snapshot_seq: SequenceNumber,
    merge_operator: Option<MergeOperatorRef>,
    prefix_extractor: Option<PrefixExtractorRef>,

    lower_bound: Option<Vec<u8>>,
    upper_bound: Option<Vec<u8>>,
    prefix_same_as_start: bool,
    captured_prefix: Option<Vec<u8>>,

    direction: Direction,
    current_key: Vec<u8>,
    current_value: Vec<u8>,
    is_valid: bool,
    error: Option<DbError>,

    // Pinned resources; dropping the iterator releases the refs.
    _memtables: Vec<Arc<Memtable>>,
    _version: Arc<Version>,
}

#[allow(clippy::too_many_arguments)]
impl DbIter {
    pub(crate) fn new(
        children: Vec<Box<dyn InternalIterator + Send>>,
        icmp: InternalKeyComparator,
        aggregator: RangeTombstoneAggregator,
        snapshot_seq: SequenceNumber,
        merge_operator: Option<MergeOperatorRef>,
        prefix_extractor: Option<PrefixExtractorRef>,
        lower_bound: Option<Vec<u8>>,
        upper_bound: Option<Vec<u8>>,
        prefix_same_as_start: bool,
        memtables: Vec<Arc<Memtable>>,
        version: Arc<Version>,
    ) -> Self {
        Self {
            children,
            icmp,
            aggregator,
            snapshot_seq,
            merge_operator,
            prefix_extractor,
            lower_bound,
            upper_bound,
            prefix_same_as_start,
            captured_prefix: None,
            direction: Direction::Forward,
            current_key: Vec::new(),
            current_value: Vec::new(),
            is_valid: false,
            error: None,
            _memtables: memtables,
            _version: version,
        }
    }

    // --------------------------------------------------------------------
    // Public cursor API
    // --------------------------------------------------------------------

    /// `true` while the cursor points at a visible entry.
    pub fn valid(&self) -> bool {
        self.is_valid
    }

    /// The current user key. Owned copy, stable across moves.
    pub fn key(&self) -> &[u8] {
        &self.current_key
    }

    /// The current value. Owned copy, stable across moves.
    pub fn value(&self) -> &[u8] {
        &self.current_value
    }

    /// The first error the cursor hit, if any.
    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    /// Positions at the first visible entry.
    pub fn seek_to_first(&mut self) {
        self.captured_prefix = None;
        match self.lower_bound.clone() {
            Some(lower) => self.seek(&lower),
            None => {
                self.direction = Direction::Forward;
                if self.for_each_child(|c| c.seek_to_first()) {
                    self.find_next_visible();
                }
            }
        }
    }

    /// Positions at the last visible entry.
    pub fn seek_to_last(&mut self) {
        self.captured_prefix = None;
        self.direction = Direction::Backward;
        let ok = match self.upper_bound.clone() {
            Some(upper) => {
                // Last entry strictly below the exclusive bound.
                let begin = make_internal_key(&upper, crate::keys::MAX_SEQUENCE, ValueType::RangeDeletion);
                self.for_each_child(|c| {
                    c.seek(&begin)?;
                    c.prev()
                })
            }
            None => self.for_each_child(|c| c.seek_to_last()),
        };
        if ok {
            self.find_prev_visible();
        }
    }

    /// Positions at the first visible entry with key ≥ `user_key`.
    pub fn seek(&mut self, user_key: &[u8]) {
        let mut target_key = user_key;
        if let Some(lower) = &self.lower_bound
            && self.icmp.compare_user(target_key, lower) == Ordering::Less
        {
            target_key = lower;
        }
        let target_key = target_key.to_vec();

        self.capture_prefix(&target_key);
        self.direction = Direction::Forward;
        let target =
            make_internal_key(&target_key, crate::keys::MAX_SEQUENCE, ValueType::RangeDeletion);
        if self.for_each_child(move |c| c.seek(&target)) {
            self.find_next_visible();
        }
    }

    /// Positions at the largest visible key ≤ `user_key`.
    pub fn seek_for_prev(&mut self, user_key: &[u8]) {
        if let Some(upper) = self.upper_bound.clone()
            && self.icmp.compare_user(user_key, &upper) != Ordering::Less
        {
            self.seek_to_last();
            return;
        }

        self.capture_prefix(user_key);
        self.direction = Direction::Backward;
        // Position each child just past every entry of `user_key`, then
        // step back once: the last entry with key ≤ `user_key`.
        let after = make_internal_key(user_key, 0, ValueType::Deletion);
        if self.for_each_child(move |c| {
            c.seek(&after)?;
            match c.valid() {
                true => c.prev(),
                false => c.seek_to_last(),
            }
        }) {
            self.find_prev_visible();
        }
    }

    /// Advances to the next visible entry.
    pub fn next(&mut self) {
        if !self.is_valid {
            return;
        }
        if self.direction == Direction::Backward {
            // Re-seek: place every child just past the current key.
            let after = make_internal_key(&self.current_key, 0, ValueType::Deletion);
            self.direction = Direction::Forward;
            if !self.for_each_child(move |c| c.seek(&after)) {
                return;
            }
        }
        self.find_next_visible();
    }

    /// Steps back to the previous visible entry.
    pub fn prev(&mut self) {
        if !self.is_valid {
            return;
        }
        if self.direction == Direction::Forward {
            // Re-seek: place every child just before the current key.
            let begin = make_internal_key(
                &self.current_key,
                crate::keys::MAX_SEQUENCE,
                ValueType::RangeDeletion,
            );
            self.direction = Direction::Backward;
            if !self.for_each_child(move |c| {
                c.seek(&begin)?;
                match c.valid() {
                    true => c.prev(),
                    false => c.seek_to_last(),
                }
            }) {
                return;
            }
        }
        self.find_prev_visible();
    }

    /// Releases the cursor's pinned resources.
    pub fn close(self) {}

    // --------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------

    fn capture_prefix(&mut self, seek_key: &[u8]) {
        self.captured_prefix = match (&self.prefix_extractor, self.prefix_same_as_start) {
            (Some(extractor), true) => Some(extractor.prefix(seek_key).to_vec()),
            _ => None,
        };
    }

    /// Applies `op` to every child; on error, poisons the cursor and
    /// returns `false`.
    fn for_each_child(
        &mut self,
        mut op: impl FnMut(&mut Box<dyn InternalIterator + Send>) -> Result<(), SSTableError>,
    ) -> bool {
        for child in &mut self.children {
            if let Err(e) = op(child) {
                self.poison(e.into());
                return false;
            }
        }
        true
    }

    fn poison(&mut self, e: DbError) {
        if self.error.is_none() {
            self.error = Some(e);
        }
        self.is_valid = false;
    }

    /// Index of the child holding the smallest current entry.
    fn smallest_child(&self) -> Option<usize> {
        let mut best: Option<(usize, Vec<u8>)> = None;
        for (idx, child) in self.children.iter().enumerate() {
            let Some(entry) = child.entry() else { continue };
            let key = entry.internal_key();
            match &best {
                Some((_, bk)) if self.icmp.compare(&key, bk) != Ordering::Less => {}
                _ => best = Some((idx, key)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Index of the child holding the largest current entry.
    fn largest_child(&self) -> Option<usize> {
        let mut best: Option<(usize, Vec<u8>)> = None;
        for (idx, child) in self.children.iter().enumerate() {
            let Some(entry) = child.entry() else { continue };
            let key = entry.internal_key();
            match &best {
                Some((_, bk)) if self.icmp.compare(&key, bk) != Ordering::Greater => {}
                _ => best = Some((idx, key)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Collects every visible version of the smallest un-consumed user
    /// key, leaving children past it. Returns `(key, versions)` with
    /// versions newest-first.
    fn collect_next_key(&mut self) -> Option<(Vec<u8>, Vec<PointEntry>)> {
        let first = self.smallest_child()?;
        let user_key = self.children[first].entry()?.user_key.clone();

        let mut versions = Vec::new();
        loop {
            let Some(idx) = self.smallest_child() else { break };
            let Some(entry) = self.children[idx].entry() else { break };
            if self.icmp.compare_user(&entry.user_key, &user_key) != Ordering::Equal {
                break;
            }
            if entry.seq <= self.snapshot_seq {
                versions.push(entry.clone());
            }
            if let Err(e) = self.children[idx].next() {
                self.poison(e.into());
                return None;
            }
        }
        Some((user_key, versions))
    }

    /// Collects every visible version of the largest un-consumed user
    /// key, leaving children before it. Returns `(key, versions)` with
    /// versions newest-first.
    fn collect_prev_key(&mut self) -> Option<(Vec<u8>, Vec<PointEntry>)> {
        let last = self.largest_child()?;
        let user_key = self.children[last].entry()?.user_key.clone();

        // Walking backward visits versions oldest-first.
        let mut versions = Vec::new();
        loop {
            let Some(idx) = self.largest_child() else { break };
            let Some(entry) = self.children[idx].entry() else { break };
            if self.icmp.compare_user(&entry.user_key, &user_key) != Ordering::Equal {
                break;
            }
            if entry.seq <= self.snapshot_seq {
                versions.push(entry.clone());
            }
            if let Err(e) = self.children[idx].prev() {
                self.poison(e.into());
                return None;
            }
        }
        versions.reverse();
        Some((user_key, versions))
    }

    /// Resolves one user key's visible versions to its value, or `None`
    /// when the key is deleted or has no visible record.
    ///
    /// Adjacent duplicates (the same record present in two files after
    /// a recovery re-flush) collapse before resolution so merge
    /// operands are not double-counted.
    fn resolve(&mut self, user_key: &[u8], versions: &mut Vec<PointEntry>) -> Option<Vec<u8>> {
        versions.dedup_by(|a, b| a.seq == b.seq && a.kind == b.kind);
        let newest = versions.first()?;
        if self.aggregator.should_delete(user_key, newest.seq) {
            return None;
        }

        match newest.kind {
            ValueType::Value => Some(newest.value.clone()),
            ValueType::Deletion | ValueType::SingleDeletion => None,
            ValueType::Merge => {
                let mut operands = vec![newest.value.clone()];
                let mut base: Option<Vec<u8>> = None;
                for older in &versions[1..] {
                    if self.aggregator.should_delete(user_key, older.seq) {
                        break;
                    }
                    match older.kind {
                        ValueType::Merge => operands.push(older.value.clone()),
                        ValueType::Value => {
                            base = Some(older.value.clone());
                            break;
                        }
                        ValueType::Deletion | ValueType::SingleDeletion => break,
                        ValueType::RangeDeletion => break,
                    }
                }

                let Some(operator) = self.merge_operator.clone() else {
                    self.poison(DbError::MergeOperatorNotSet);
                    return None;
                };
                match operator.full_merge(user_key, base.as_deref(), &operands) {
                    Some(merged) => Some(merged),
                    None => {
                        self.poison(DbError::Corruption(
                            "merge operator failed during iteration".into(),
                        ));
                        None
                    }
                }
            }
            ValueType::RangeDeletion => None,
        }
    }

    /// Emits `(key, value)` if bounds and prefix allow, else invalidates.
    fn emit(&mut self, user_key: Vec<u8>, value: Vec<u8>) -> bool {
        if let Some(upper) = &self.upper_bound
            && self.icmp.compare_user(&user_key, upper) != Ordering::Less
        {
            self.is_valid = false;
            return true;
        }
        if let Some(lower) = &self.lower_bound
            && self.icmp.compare_user(&user_key, lower) == Ordering::Less
        {
            self.is_valid = false;
            return true;
        }
        if let Some(prefix) = &self.captured_prefix
            && let Some(extractor) = &self.prefix_extractor
            && extractor.prefix(&user_key) != prefix.as_slice()
        {
            self.is_valid = false;
            return true;
        }

        trace!(key = %crate::keys::HexKey(&user_key), "iterator positioned");
        self.current_key = user_key;
        self.current_value = value;
        self.is_valid = true;
        true
    }

    fn find_next_visible(&mut self) {
        loop {
            let Some((user_key, mut versions)) = self.collect_next_key() else {
                self.is_valid = false;
                return;
            };

            // Past the exclusive upper bound: stop without resolving.
            if let Some(upper) = &self.upper_bound
                && self.icmp.compare_user(&user_key, upper) != Ordering::Less
            {
                self.is_valid = false;
                return;
            }

            match self.resolve(&user_key, &mut versions) {
                Some(value) => {
                    if self.captured_prefix.is_none() && self.prefix_same_as_start {
                        self.capture_prefix(&user_key);
                    }
                    if self.emit(user_key, value) {
                        return;
                    }
                }
                None => {
                    if self.error.is_some() {
                        return;
                    }
                    // Deleted or shadowed; move on.
                }
            }
        }
    }

    fn find_prev_visible(&mut self) {
        loop {
            let Some((user_key, mut versions)) = self.collect_prev_key() else {
                self.is_valid = false;
                return;
            };

            // Below the inclusive lower bound: stop without resolving.
            if let Some(lower) = &self.lower_bound
                && self.icmp.compare_user(&user_key, lower) == Ordering::Less
            {
                self.is_valid = false;
                return;
            }

            match self.resolve(&user_key, &mut versions) {
                Some(value) => {
                    if self.captured_prefix.is_none() && self.prefix_same_as_start {
                        self.capture_prefix(&user_key);
                    }
                    if self.emit(user_key, value) {
                        return;
                    }
                }
                None => {
                    if self.error.is_some() {
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for DbIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIter")
            .field("snapshot_seq", &self.snapshot_seq)
            .field("valid", &self.is_valid)
            .field("direction", &self.direction)
            .field("children", &self.children.len())
            .finish()
    }
}
