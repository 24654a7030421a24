//! Snapshot registry — outstanding read points.
//!
//! A snapshot pins a sequence number: reads through it see exactly the
//! records at or below that sequence, and compaction must not drop
//! tombstones a live snapshot still needs. The registry tracks every
//! outstanding snapshot and answers the one question compaction asks:
//! the oldest pinned sequence.
//!
//! The registry keeps its own lock, disjoint from the engine lock, so
//! snapshot churn never contends with the write path. Storage is an
//! ordered multiset (`BTreeMap<seq, count>`) rather than an intrusive
//! linked list.

use std::sync::Mutex;
use std::time::SystemTime;

use std::collections::BTreeMap;

use tracing::trace;

use crate::keys::SequenceNumber;

/// A pinned read point. Returned by [`Db::snapshot`](crate::engine::Db::snapshot);
/// must be released with [`Db::release_snapshot`](crate::engine::Db::release_snapshot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    seq: SequenceNumber,
    created_at: SystemTime,
}

impl Snapshot {
    /// The pinned sequence number.
    pub fn sequence(&self) -> SequenceNumber {
        self.seq
    }

    /// When the snapshot was acquired.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// Thread-safe registry of outstanding snapshots.
#[derive(Debug, Default)]
pub struct SnapshotList {
    /// `sequence → number of outstanding snapshots at it`.
    inner: Mutex<BTreeMap<SequenceNumber, usize>>,
}

impl SnapshotList {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a snapshot at `seq`.
    pub fn acquire(&self, seq: SequenceNumber) -> Snapshot {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *inner.entry(seq).or_insert(0) += 1;
        trace!(seq, "snapshot acquired");
        Snapshot {
            seq,
            created_at: SystemTime::now(),
        }
    }

    /// Releases one snapshot. Releasing a snapshot twice is a no-op
    /// for the registry beyond the first call.
    pub fn release(&self, snapshot: &Snapshot) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = inner.get_mut(&snapshot.seq) {
            *count -= 1;
            if *count == 0 {
                inner.remove(&snapshot.seq);
            }
            trace!(seq = snapshot.seq, "snapshot released");
        }
    }

    /// The smallest outstanding sequence, if any snapshot is held.
    pub fn oldest_sequence(&self) -> Option<SequenceNumber> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.keys().next().copied()
    }

    /// Number of outstanding snapshots.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.values().sum()
    }

    /// `true` when no snapshot is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
