//! # LSM Storage Engine
//!
//! The engine facade: a durable, crash-consistent, ordered key-value
//! store with snapshot isolation, atomic batch writes, range deletions,
//! and merge operands.
//!
//! ## Design Overview
//!
//! Data lives in three layers, queried newest-first:
//!
//! 1. **Active memtable** — the in-memory write buffer.
//! 2. **Immutable memtable** — at most one, awaiting flush.
//! 3. **SSTables** — immutable leveled files tracked by the
//!    [`VersionSet`].
//!
//! A write reserves a contiguous sequence range under the engine lock,
//! appends its batch to the WAL outside it, applies the batch to the
//! captured memtable, and switches the memtable to immutable when the
//! write buffer fills. One background worker drains immutable memtables
//! to L0; another runs leveled compaction.
//!
//! ## Concurrency Model
//!
//! One engine lock (`Mutex<DbInner>`) guards writer admission, the
//! memtable handoff, version installation, the stall state, the sticky
//! background error, and the counters. Two condition variables hang off
//! it: one for stalled writers, one for the immutable-memtable slot.
//! The snapshot registry and table cache synchronize independently.
//!
//! ## Guarantees
//!
//! - Acknowledged writes with the WAL enabled survive crashes.
//! - Two concurrent batches never interleave their sequence ranges.
//! - Reads through a snapshot see exactly the records at or below it.
//! - Version installation is the linearization point of flushes and
//!   compactions; live files are never deleted or mutated in place.

pub mod iterator;
pub mod snapshot;
pub mod stall;

mod flush;

#[cfg(test)]
mod tests;

pub use iterator::DbIter;
pub use snapshot::Snapshot;
pub use stall::{StallCause, WriteStallCondition};

use std::{
    collections::{HashMap, HashSet},
    fs,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
    thread,
    time::Instant,
};

use crossbeam::channel::{Receiver, Sender, unbounded};
use fs4::fs_std::FileExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchError, BatchHandler, WriteBatch};
use crate::compaction::{
    Compaction, CompactionError, pick_compaction, pick_manual_compaction, run_compaction,
};
use crate::config::{DbOptions, ReadOptions, WriteOptions};
use crate::files;
use crate::keys::{InternalKeyComparator, SequenceNumber, ValueType};
use crate::memtable::{Memtable, MemtableError};
use crate::sstable::SSTableError;
use crate::table_cache::{TableCache, TableCacheError};
use crate::tombstone::RangeTombstoneAggregator;
use crate::version::{NUM_LEVELS, VersionEdit, VersionError, VersionSet};
use crate::wal::{Wal, WalError};

use iterator::{InternalIterator, TableSource, VecSource};
use snapshot::SnapshotList;

/// Default capacity of the table cache (open readers).
const TABLE_CACHE_CAPACITY: usize = 256;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File integrity failure.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Bad options, keys, or ranges.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation on a closed engine.
    #[error("Database is closed")]
    DbClosed,

    /// `error_if_exists` was set and a database exists at the path.
    #[error("Database already exists: {0}")]
    DatabaseExists(String),

    /// No database at the path and `create_if_missing` unset.
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    /// Comparator or table format mismatch.
    #[error("Incompatible format: {0}")]
    IncompatibleFormat(String),

    /// `merge()` or a read needing merge resolution without an operator.
    #[error("Merge operator not set")]
    MergeOperatorNotSet,

    /// A stalled write exceeded its configured timeout.
    #[error("Write stall timed out")]
    WriteStallTimeout,

    /// A background job failed; the engine rejects mutations until
    /// reopened.
    #[error("Background error: {0}")]
    Background(String),

    /// WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Memtable failure.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// SSTable failure.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Version set / MANIFEST failure.
    #[error("Version error: {0}")]
    Version(#[from] VersionError),

    /// Table cache failure.
    #[error("Table cache error: {0}")]
    TableCache(#[from] TableCacheError),

    /// Malformed write batch.
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// Compaction failure.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Sync points
// ------------------------------------------------------------------------------------------------

/// Named no-op hooks at engine barriers.
///
/// Production leaves them empty; tests substitute callbacks that block
/// or abort at `flush_write_sst`, `flush_update_manifest_pre`,
/// `flush_update_manifest_post`, and `compaction_pre_install`.
#[derive(Default)]
pub struct SyncPoints {
    hooks: RwLock<HashMap<&'static str, Arc<dyn Fn() + Send + Sync>>>,
}

impl SyncPoints {
    /// Installs a callback at a named barrier.
    pub fn set(&self, name: &'static str, hook: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.insert(name, Arc::new(hook));
        }
    }

    /// Removes a callback.
    pub fn clear(&self, name: &str) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.remove(name);
        }
    }

    fn run(&self, name: &str) {
        let hook = self
            .hooks
            .read()
            .ok()
            .and_then(|hooks| hooks.get(name).cloned());
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl std::fmt::Debug for SyncPoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.hooks.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("SyncPoints").field("hooks", &count).finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Snapshot of engine statistics returned by [`Db::stats`].
#[derive(Debug, Clone)]
pub struct DbStats {
    /// File counts per level.
    pub files_per_level: Vec<usize>,

    /// Total bytes per level.
    pub bytes_per_level: Vec<u64>,

    /// Active memtable footprint in bytes.
    pub memtable_bytes: usize,

    /// `true` while an immutable memtable awaits flushing.
    pub immutable_memtable: bool,

    /// The engine's sequence counter.
    pub last_sequence: SequenceNumber,

    /// Versions still referenced somewhere.
    pub live_versions: usize,

    /// Outstanding snapshots.
    pub snapshots: usize,
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

enum WorkerMsg {
    Work,
    Shutdown,
}

/// State guarded by the engine lock.
struct DbInner {
    /// Active memtable.
    mem: Arc<Memtable>,

    /// Immutable memtable being drained, if any.
    imm: Option<Arc<Memtable>>,

    /// Versions, counters, and the MANIFEST.
    versions: VersionSet,

    /// The write-ahead log (one per open).
    wal: Arc<Wal<WriteBatch>>,

    /// Number of the active WAL file.
    wal_number: u64,

    /// Current write-admission condition.
    stall: WriteStallCondition,

    /// Sticky background error; first error wins.
    bg_error: Option<String>,

    /// Set by `close`; rejects all further operations.
    closed: bool,

    /// File numbers allocated to in-flight flushes and compactions,
    /// protected from garbage collection.
    pending_outputs: HashSet<u64>,
}

struct DbShared {
    dir: PathBuf,
    opts: DbOptions,
    icmp: InternalKeyComparator,
    inner: Mutex<DbInner>,

    /// Serializes writers across sequence assignment, WAL append,
    /// memtable apply, and the switch to immutable. The memtable's
    /// single-writer discipline depends on it.
    write_lock: Mutex<()>,

    write_stall_cv: Condvar,
    imm_cv: Condvar,
    snapshots: SnapshotList,
    table_cache: Arc<TableCache>,
    sync_points: SyncPoints,
    flush_tx: Sender<WorkerMsg>,
    compact_tx: Sender<WorkerMsg>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: AtomicBool,

    /// Advisory lock; held open for the engine's lifetime.
    _lock_file: fs::File,
}

// ------------------------------------------------------------------------------------------------
// Db — public handle
// ------------------------------------------------------------------------------------------------

/// The storage engine handle.
///
/// Cheaply cloneable; all clones share one engine. Call
/// [`close`](Db::close) for a graceful shutdown — dropping the last
/// handle stops the background workers but skips the final WAL sync
/// ordering guarantees `close` provides.
pub struct Db {
    shared: Arc<DbShared>,
}

impl Clone for Db {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("dir", &self.shared.dir).finish()
    }
}

impl Db {
    // --------------------------------------------------------------------
    // Open / recovery
    // --------------------------------------------------------------------

    /// Opens (or creates) a database rooted at `path`.
    ///
    /// Recovery: read the `CURRENT` pointer and replay the MANIFEST,
    /// replay every WAL at or above the recorded log number (flushing
    /// recovered data to L0), create a fresh WAL, collect orphaned
    /// files, and start the background workers.
    pub fn open(path: impl AsRef<Path>, opts: DbOptions) -> Result<Self, DbError> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let db_exists = files::current_file_path(&dir).exists();
        if db_exists && opts.error_if_exists {
            return Err(DbError::DatabaseExists(dir.display().to_string()));
        }
        if !db_exists && !opts.create_if_missing {
            return Err(DbError::DatabaseNotFound(dir.display().to_string()));
        }

        // Advisory lock against concurrent opens.
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(files::lock_file_path(&dir))?;
        if !lock_file.try_lock_exclusive()? {
            return Err(DbError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("database at {} is locked by another process", dir.display()),
            )));
        }

        let cmp = opts.comparator.clone();
        let mut versions = if db_exists {
            VersionSet::recover(&dir, cmp.clone()).map_err(map_open_error)?
        } else {
            info!(dir = %dir.display(), "creating new database");
            VersionSet::create(&dir, cmp.clone())?
        };

        // Replay unflushed WALs in file-number order.
        let mut wal_numbers = scan_wal_numbers(&dir, versions.log_number())?;
        wal_numbers.sort_unstable();
        for wal_number in wal_numbers {
            replay_one_wal(&dir, wal_number, &mut versions, &opts)?;
        }

        // Fresh WAL for this open; `log_number` stays put — it only
        // advances once a predecessor's data is durable in SSTables.
        let wal_number = versions.next_file_number();
        let wal = Arc::new(Wal::<WriteBatch>::open(
            files::log_file_path(&dir, wal_number),
            None,
        )?);
        let reopen_edit = VersionEdit {
            last_sequence: Some(versions.last_sequence()),
            ..VersionEdit::default()
        };
        versions.log_and_apply(reopen_edit)?;

        let table_cache = Arc::new(TableCache::new(&dir, cmp.clone(), TABLE_CACHE_CAPACITY));

        let stall_now = stall::compute_condition(&opts, 1, versions.current().num_files(0));
        let (flush_tx, flush_rx) = unbounded();
        let (compact_tx, compact_rx) = unbounded();

        let inner = DbInner {
            mem: Arc::new(Memtable::new(cmp.clone())),
            imm: None,
            versions,
            wal,
            wal_number,
            stall: stall_now,
            bg_error: None,
            closed: false,
            pending_outputs: HashSet::new(),
        };

        let shared = Arc::new(DbShared {
            dir,
            icmp: InternalKeyComparator::new(cmp),
            opts,
            inner: Mutex::new(inner),
            write_lock: Mutex::new(()),
            write_stall_cv: Condvar::new(),
            imm_cv: Condvar::new(),
            snapshots: SnapshotList::new(),
            table_cache,
            sync_points: SyncPoints::default(),
            flush_tx,
            compact_tx,
            workers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            _lock_file: lock_file,
        });

        // Collect files left behind by crashes or aborted jobs.
        {
            let mut guard = shared.lock_inner();
            shared.remove_obsolete_files(&mut guard);
        }

        shared.start_workers(flush_rx, compact_rx);

        let db = Db { shared };
        db.shared.maybe_schedule_compaction();
        Ok(db)
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    /// Applies `batch` atomically.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<(), DbError> {
        self.shared.write(opts, batch)
    }

    /// Inserts or updates one key.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(&WriteOptions::default(), batch)
    }

    /// Deletes one key.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(&WriteOptions::default(), batch)
    }

    /// Single-deletes one key (removes exactly one earlier put).
    pub fn single_delete(&self, key: impl AsRef<[u8]>) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.single_delete(key);
        self.write(&WriteOptions::default(), batch)
    }

    /// Appends a merge operand for one key.
    ///
    /// Requires a configured merge operator.
    pub fn merge(&self, key: impl AsRef<[u8]>, operand: impl AsRef<[u8]>) -> Result<(), DbError> {
        if self.shared.opts.merge_operator.is_none() {
            return Err(DbError::MergeOperatorNotSet);
        }
        let mut batch = WriteBatch::new();
        batch.merge(key, operand);
        self.write(&WriteOptions::default(), batch)
    }

    /// Deletes every key in `[start, end)`.
    pub fn delete_range(
        &self,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
    ) -> Result<(), DbError> {
        let (start, end) = (start.as_ref(), end.as_ref());
        if self.shared.icmp.compare_user(start, end) != std::cmp::Ordering::Less {
            // Empty range; nothing to delete.
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        batch.delete_range(start, end);
        self.write(&WriteOptions::default(), batch)
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    /// Looks up one key at the latest visible state.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, DbError> {
        self.get_with(&ReadOptions::default(), key)
    }

    /// Looks up one key with explicit read options (snapshot, bounds).
    pub fn get_with(
        &self,
        opts: &ReadOptions,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<Vec<u8>>, DbError> {
        self.shared.get(opts, key.as_ref())
    }

    /// Creates a merged iterator over the whole database.
    pub fn iter(&self, opts: &ReadOptions) -> Result<DbIter, DbError> {
        self.shared.iter(opts)
    }

    /// Acquires a snapshot pinning the current sequence.
    pub fn snapshot(&self) -> Result<Snapshot, DbError> {
        let guard = self.shared.lock_inner();
        if guard.closed {
            return Err(DbError::DbClosed);
        }
        Ok(self.shared.snapshots.acquire(guard.versions.last_sequence()))
    }

    /// Releases a snapshot, unpinning its sequence.
    pub fn release_snapshot(&self, snapshot: &Snapshot) {
        self.shared.snapshots.release(snapshot);
    }

    /// The engine's in-memory sequence counter.
    ///
    /// After a clean shutdown and reopen this equals the MANIFEST's
    /// persisted `last_sequence`.
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.shared.lock_inner().versions.last_sequence()
    }

    /// Engine statistics.
    pub fn stats(&self) -> DbStats {
        let mut guard = self.shared.lock_inner();
        let version = guard.versions.current();
        DbStats {
            files_per_level: (0..NUM_LEVELS).map(|l| version.num_files(l)).collect(),
            bytes_per_level: (0..NUM_LEVELS)
                .map(|l| version.level_total_size(l))
                .collect(),
            memtable_bytes: guard.mem.approximate_memory_usage(),
            immutable_memtable: guard.imm.is_some(),
            last_sequence: guard.versions.last_sequence(),
            live_versions: guard.versions.num_live_versions(),
            snapshots: self.shared.snapshots.len(),
        }
    }

    // --------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------

    /// Flushes the active memtable (if nonempty) and waits until no
    /// immutable memtable remains.
    pub fn flush(&self) -> Result<(), DbError> {
        self.shared.flush()
    }

    /// Compacts every level whose files overlap `[begin, end]`
    /// (`None` bounds are unbounded). Flushes first so memtable data
    /// participates.
    pub fn compact_range(
        &self,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), DbError> {
        self.shared.compact_range(begin, end)
    }

    /// Test hooks at named engine barriers.
    pub fn sync_points(&self) -> &SyncPoints {
        &self.shared.sync_points
    }

    /// Gracefully shuts the engine down: releases stalled writers,
    /// stops the background workers, and syncs the WAL.
    pub fn close(&self) -> Result<(), DbError> {
        self.shared.close()
    }
}

// ------------------------------------------------------------------------------------------------
// DbShared — engine implementation
// ------------------------------------------------------------------------------------------------

impl DbShared {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, DbInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    // --------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------

    fn write(&self, opts: &WriteOptions, mut batch: WriteBatch) -> Result<(), DbError> {
        if batch.is_empty() {
            return Ok(());
        }
        // The number of records actually present governs sequence
        // consumption, even when the header count under-reports.
        let record_count = batch.actual_count()?;
        if record_count == 0 {
            return Ok(());
        }

        // Writers run one at a time from here on; the captured memtable
        // cannot be switched out from under a writer mid-apply.
        let _writer = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        // 1. Write-admission gate.
        let (mem, wal, base_seq) = {
            let mut guard = self.lock_inner();
            let deadline = opts.stall_timeout.map(|t| Instant::now() + t);
            let mut delayed_once = false;

            loop {
                if guard.closed {
                    return Err(DbError::DbClosed);
                }
                if let Some(detail) = &guard.bg_error {
                    return Err(DbError::Background(detail.clone()));
                }
                match guard.stall {
                    WriteStallCondition::Normal => break,
                    WriteStallCondition::Delayed(_) if delayed_once => break,
                    WriteStallCondition::Delayed(cause) => {
                        debug!(?cause, "write delayed");
                        drop(guard);
                        thread::sleep(stall::delay_for_batch(batch.size_in_bytes()));
                        delayed_once = true;
                        guard = self.lock_inner();
                    }
                    WriteStallCondition::Stopped(cause) => {
                        debug!(?cause, "write stopped, waiting");
                        guard = match deadline {
                            Some(deadline) => {
                                let now = Instant::now();
                                if now >= deadline {
                                    return Err(DbError::WriteStallTimeout);
                                }
                                let (g, timeout) = self
                                    .write_stall_cv
                                    .wait_timeout(guard, deadline - now)
                                    .unwrap_or_else(|p| p.into_inner());
                                if timeout.timed_out()
                                    && matches!(g.stall, WriteStallCondition::Stopped(_))
                                    && !g.closed
                                {
                                    return Err(DbError::WriteStallTimeout);
                                }
                                g
                            }
                            None => self
                                .write_stall_cv
                                .wait(guard)
                                .unwrap_or_else(|p| p.into_inner()),
                        };
                    }
                }
            }

            // 2. Reserve a contiguous sequence range. A later failure
            // merely burns these sequences, which is benign.
            let base_seq = guard.versions.last_sequence() + 1;
            guard
                .versions
                .set_last_sequence(base_seq + record_count as u64 - 1);

            (guard.mem.clone(), guard.wal.clone(), base_seq)
        };

        batch.set_sequence(base_seq);

        // 3. WAL append (and sync) outside the engine lock.
        if !opts.disable_wal {
            if let Err(e) = wal.append(&batch) {
                self.set_background_error(format!("WAL append failed: {e}"));
                return Err(e.into());
            }
            if opts.sync
                && let Err(e) = wal.sync()
            {
                self.set_background_error(format!("WAL sync failed: {e}"));
                return Err(e.into());
            }
        }

        // 4. Apply to the captured memtable.
        let mut inserter = MemtableInserter {
            mem: &mem,
            seq: base_seq,
        };
        batch.iterate(&mut inserter)?;

        // 5. Switch to immutable past the write-buffer threshold.
        if mem.approximate_memory_usage() >= self.opts.write_buffer_size {
            self.switch_memtable()?;
        }

        // 6. Recompute the stall condition.
        {
            let mut guard = self.lock_inner();
            self.recompute_stall(&mut guard);
        }

        Ok(())
    }

    /// Swaps the active memtable into the immutable slot (waiting for
    /// the slot to free up) and schedules a flush.
    fn switch_memtable(&self) -> Result<(), DbError> {
        let mut guard = self.lock_inner();

        // Another writer may have already switched.
        if guard.mem.approximate_memory_usage() < self.opts.write_buffer_size {
            return Ok(());
        }

        while guard.imm.is_some() && !guard.closed {
            guard = self.imm_cv.wait(guard).unwrap_or_else(|p| p.into_inner());
        }
        if guard.closed {
            return Err(DbError::DbClosed);
        }
        if guard.mem.is_empty() {
            return Ok(());
        }

        guard.mem.mark_immutable();
        let old = std::mem::replace(
            &mut guard.mem,
            Arc::new(Memtable::new(self.opts.comparator.clone())),
        );
        guard.imm = Some(old);
        self.recompute_stall(&mut guard);
        drop(guard);

        let _ = self.flush_tx.send(WorkerMsg::Work);
        Ok(())
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    fn get(&self, opts: &ReadOptions, user_key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let (mem, imm, version, seq) = {
            let guard = self.lock_inner();
            if guard.closed {
                return Err(DbError::DbClosed);
            }
            (
                guard.mem.clone(),
                guard.imm.clone(),
                guard.versions.current(),
                opts.snapshot.unwrap_or_else(|| guard.versions.last_sequence()),
            )
        };

        let cmp = self.opts.comparator.clone();
        let mut aggregator = RangeTombstoneAggregator::new(cmp, seq);
        let mut candidates: Vec<(SequenceNumber, ValueType, Vec<u8>)> = Vec::new();

        aggregator.add_tombstones(0, mem.fragmented_range_tombstones()?);
        for entry in mem.point_versions(user_key, seq)? {
            candidates.push((entry.seq, entry.kind, entry.value));
        }

        if let Some(imm) = &imm {
            aggregator.add_tombstones(1, imm.fragmented_range_tombstones()?);
            for entry in imm.point_versions(user_key, seq)? {
                candidates.push((entry.seq, entry.kind, entry.value));
            }
        }

        for (level, meta) in version.files_for_key(user_key) {
            let table = self.table_cache.get(meta.number)?;
            aggregator.add_tombstones(2 + level, table.fragmented_range_tombstones());
            for entry in table.point_versions(user_key, seq)? {
                candidates.push((entry.seq, entry.kind, entry.value));
            }
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        // Identical sequences mean the same record reached two files
        // (recovery re-flushes WAL data an earlier session persisted).
        candidates.dedup_by(|a, b| a.0 == b.0);

        let mut operands: Vec<Vec<u8>> = Vec::new();
        let mut base: Option<Vec<u8>> = None;
        let mut deleted = false;

        for (entry_seq, kind, value) in candidates {
            if aggregator.should_delete(user_key, entry_seq) {
                deleted = true;
                break;
            }
            match kind {
                ValueType::Value => {
                    base = Some(value);
                    break;
                }
                ValueType::Deletion | ValueType::SingleDeletion => {
                    deleted = true;
                    break;
                }
                ValueType::Merge => operands.push(value),
                ValueType::RangeDeletion => {
                    return Err(DbError::Corruption(
                        "range tombstone stored as point record".into(),
                    ));
                }
            }
        }

        if operands.is_empty() {
            return Ok(if deleted { None } else { base });
        }

        let operator = self
            .opts
            .merge_operator
            .as_ref()
            .ok_or(DbError::MergeOperatorNotSet)?;
        let effective_base = if deleted { None } else { base };
        operator
            .full_merge(user_key, effective_base.as_deref(), &operands)
            .map(Some)
            .ok_or_else(|| DbError::Corruption("merge operator failed".into()))
    }

    fn iter(&self, opts: &ReadOptions) -> Result<DbIter, DbError> {
        let (mem, imm, version, seq) = {
            let guard = self.lock_inner();
            if guard.closed {
                return Err(DbError::DbClosed);
            }
            (
                guard.mem.clone(),
                guard.imm.clone(),
                guard.versions.current(),
                opts.snapshot.unwrap_or_else(|| guard.versions.last_sequence()),
            )
        };

        let cmp = self.opts.comparator.clone();
        let mut aggregator = RangeTombstoneAggregator::new(cmp.clone(), seq);
        let mut children: Vec<Box<dyn InternalIterator + Send>> = Vec::new();
        let mut memtables = Vec::new();

        let lower = opts.lower_bound.as_deref();
        let upper = opts.upper_bound.as_deref();

        aggregator.add_tombstones(0, mem.fragmented_range_tombstones()?);
        children.push(Box::new(VecSource::new(
            mem.scan_versions(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded, seq)?,
            self.icmp.clone(),
        )));
        memtables.push(mem);

        if let Some(imm) = imm {
            aggregator.add_tombstones(1, imm.fragmented_range_tombstones()?);
            children.push(Box::new(VecSource::new(
                imm.scan_versions(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded, seq)?,
                self.icmp.clone(),
            )));
            memtables.push(imm);
        }

        for (level, meta) in version.all_files() {
            // Skip files entirely outside the requested bounds.
            if let Some(hi) = upper
                && cmp.compare(&meta.smallest.user_key, hi) != std::cmp::Ordering::Less
            {
                continue;
            }
            if let Some(lo) = lower
                && cmp.compare(&meta.largest.user_key, lo) == std::cmp::Ordering::Less
            {
                continue;
            }
            let table = self.table_cache.get(meta.number)?;
            aggregator.add_tombstones(2 + level, table.fragmented_range_tombstones());
            children.push(Box::new(TableSource::new(table)?));
        }

        Ok(DbIter::new(
            children,
            self.icmp.clone(),
            aggregator,
            seq,
            self.opts.merge_operator.clone(),
            self.opts.prefix_extractor.clone(),
            opts.lower_bound.clone(),
            opts.upper_bound.clone(),
            opts.prefix_same_as_start,
            memtables,
            version,
        ))
    }

    // --------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------

    fn flush(&self) -> Result<(), DbError> {
        {
            // Marking the active memtable immutable races with a
            // writer's apply unless the writer lock is held.
            let _writer = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

            let mut guard = self.lock_inner();
            if guard.closed {
                return Err(DbError::DbClosed);
            }
            if let Some(detail) = &guard.bg_error {
                return Err(DbError::Background(detail.clone()));
            }
            if guard.mem.is_empty() && guard.imm.is_none() {
                return Ok(());
            }

            if !guard.mem.is_empty() {
                while guard.imm.is_some() && !guard.closed {
                    guard = self.imm_cv.wait(guard).unwrap_or_else(|p| p.into_inner());
                }
                if guard.closed {
                    return Err(DbError::DbClosed);
                }
                if !guard.mem.is_empty() {
                    guard.mem.mark_immutable();
                    let old = std::mem::replace(
                        &mut guard.mem,
                        Arc::new(Memtable::new(self.opts.comparator.clone())),
                    );
                    guard.imm = Some(old);
                    self.recompute_stall(&mut guard);
                    drop(guard);
                    let _ = self.flush_tx.send(WorkerMsg::Work);
                }
            }
        }

        // Wait for the drain.
        let mut guard = self.lock_inner();
        while guard.imm.is_some() && !guard.closed && guard.bg_error.is_none() {
            guard = self.imm_cv.wait(guard).unwrap_or_else(|p| p.into_inner());
        }
        if let Some(detail) = &guard.bg_error {
            return Err(DbError::Background(detail.clone()));
        }
        if guard.closed && guard.imm.is_some() {
            return Err(DbError::DbClosed);
        }
        Ok(())
    }

    /// One flush job: immutable memtable → L0 table + version edit.
    fn flush_once(&self) -> Result<(), DbError> {
        let (imm, file_number) = {
            let mut guard = self.lock_inner();
            if guard.closed || guard.bg_error.is_some() {
                return Ok(());
            }
            let Some(imm) = guard.imm.clone() else {
                return Ok(());
            };
            let file_number = guard.versions.next_file_number();
            guard.pending_outputs.insert(file_number);
            (imm, file_number)
        };

        self.sync_points.run("flush_write_sst");

        match flush::build_flush_file(&self.dir, &imm, file_number, &self.opts) {
            Ok(None) => {
                // Nothing to persist; just clear the slot.
                let mut guard = self.lock_inner();
                guard.pending_outputs.remove(&file_number);
                guard.imm = None;
                self.recompute_stall(&mut guard);
                drop(guard);
                self.imm_cv.notify_all();
                Ok(())
            }
            Ok(Some(meta)) => {
                self.sync_points.run("flush_update_manifest_pre");
                {
                    let mut guard = self.lock_inner();
                    let last_sequence =
                        guard.versions.last_sequence().max(meta.largest_seq);
                    let mut edit = VersionEdit {
                        last_sequence: Some(last_sequence),
                        ..VersionEdit::default()
                    };
                    edit.add_file(0, meta.clone());

                    if let Err(e) = guard.versions.log_and_apply(edit) {
                        guard.pending_outputs.remove(&file_number);
                        let _ = fs::remove_file(files::table_file_path(&self.dir, file_number));
                        let detail = format!("flush manifest update failed: {e}");
                        self.record_background_error(&mut guard, detail.clone());
                        drop(guard);
                        self.imm_cv.notify_all();
                        return Err(DbError::Background(detail));
                    }

                    guard.pending_outputs.remove(&file_number);
                    guard.imm = None;
                    self.recompute_stall(&mut guard);
                }
                self.imm_cv.notify_all();
                self.sync_points.run("flush_update_manifest_post");
                self.maybe_schedule_compaction();
                Ok(())
            }
            Err(e) => {
                let mut guard = self.lock_inner();
                guard.pending_outputs.remove(&file_number);
                let detail = format!("flush failed: {e}");
                self.record_background_error(&mut guard, detail.clone());
                drop(guard);
                self.imm_cv.notify_all();
                Err(DbError::Background(detail))
            }
        }
    }

    // --------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------

    fn maybe_schedule_compaction(&self) {
        if !self.opts.disable_auto_compactions && !self.shutdown.load(AtomicOrdering::SeqCst) {
            let _ = self.compact_tx.send(WorkerMsg::Work);
        }
    }

    /// Picks one automatic compaction under the lock, claiming inputs.
    fn pick_and_claim(&self) -> Option<Compaction> {
        let guard = self.lock_inner();
        if guard.closed || guard.bg_error.is_some() {
            return None;
        }
        let version = guard.versions.current();
        let plan = pick_compaction(&version, &self.opts, &self.opts.comparator)?;
        for file in plan.all_inputs() {
            file.set_being_compacted(true);
        }
        Some(plan)
    }

    /// Runs and installs one compaction. The inputs must already be
    /// claimed.
    fn execute_compaction(&self, compaction: &Compaction) -> Result<(), DbError> {
        let oldest_snapshot = self.snapshots.oldest_sequence();
        let mut allocated: Vec<u64> = Vec::new();
        let result = {
            let mut next_file = || {
                let mut guard = self.lock_inner();
                let n = guard.versions.next_file_number();
                guard.pending_outputs.insert(n);
                allocated.push(n);
                n
            };
            run_compaction(
                compaction,
                &self.dir,
                &self.table_cache,
                &self.opts,
                oldest_snapshot,
                &mut next_file,
            )
        };

        match result {
            Ok(outcome) => {
                self.sync_points.run("compaction_pre_install");
                let mut guard = self.lock_inner();

                let mut edit = VersionEdit::default();
                for file in &compaction.inputs {
                    edit.delete_file(compaction.level, file.number);
                }
                for file in &compaction.output_level_inputs {
                    edit.delete_file(compaction.output_level, file.number);
                }
                for output in &outcome.outputs {
                    edit.add_file(compaction.output_level, output.clone());
                }

                if let Err(e) = guard.versions.log_and_apply(edit) {
                    compaction.release_inputs();
                    for n in &allocated {
                        guard.pending_outputs.remove(n);
                        let _ = fs::remove_file(files::table_file_path(&self.dir, *n));
                        self.table_cache.evict(*n);
                    }
                    let detail = format!("compaction manifest update failed: {e}");
                    self.record_background_error(&mut guard, detail.clone());
                    return Err(DbError::Background(detail));
                }

                compaction.release_inputs();
                for n in &allocated {
                    guard.pending_outputs.remove(n);
                }
                self.recompute_stall(&mut guard);
                self.remove_obsolete_files(&mut guard);
                drop(guard);
                self.write_stall_cv.notify_all();
                Ok(())
            }
            Err(e) => {
                // Abort: drop partial outputs, release the claims.
                let mut guard = self.lock_inner();
                compaction.release_inputs();
                for n in &allocated {
                    guard.pending_outputs.remove(n);
                    let _ = fs::remove_file(files::table_file_path(&self.dir, *n));
                    let _ = fs::remove_file(
                        files::table_file_path(&self.dir, *n).with_extension("sst.tmp"),
                    );
                    self.table_cache.evict(*n);
                }
                match &e {
                    CompactionError::Io(_) | CompactionError::SSTable(_) => {
                        let detail = format!("compaction failed: {e}");
                        self.record_background_error(&mut guard, detail);
                    }
                    _ => warn!(error = %e, "compaction aborted; will retry"),
                }
                Err(e.into())
            }
        }
    }

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), DbError> {
        self.flush()?;

        for level in 0..NUM_LEVELS - 1 {
            let plan = {
                let guard = self.lock_inner();
                if guard.closed {
                    return Err(DbError::DbClosed);
                }
                if let Some(detail) = &guard.bg_error {
                    return Err(DbError::Background(detail.clone()));
                }
                let version = guard.versions.current();
                let plan = pick_manual_compaction(
                    &version,
                    &self.opts,
                    &self.opts.comparator,
                    level,
                    begin,
                    end,
                );
                if let Some(plan) = &plan {
                    for file in plan.all_inputs() {
                        file.set_being_compacted(true);
                    }
                }
                plan
            };

            if let Some(plan) = plan {
                self.execute_compaction(&plan)?;
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Stall / errors / GC
    // --------------------------------------------------------------------

    fn recompute_stall(&self, guard: &mut DbInner) {
        let unflushed = 1 + usize::from(guard.imm.is_some());
        let l0 = guard.versions.current().num_files(0);
        let new = stall::compute_condition(&self.opts, unflushed, l0);
        stall::trace_transition(guard.stall, new);
        guard.stall = new;
        // Waking everyone is cheap; waiters re-check the condition.
        self.write_stall_cv.notify_all();
    }

    fn set_background_error(&self, detail: String) {
        let mut guard = self.lock_inner();
        self.record_background_error(&mut guard, detail);
    }

    /// First error wins.
    fn record_background_error(&self, guard: &mut DbInner, detail: String) {
        if guard.bg_error.is_none() {
            error!(detail = %detail, "sticky background error set");
            guard.bg_error = Some(detail);
        }
        self.write_stall_cv.notify_all();
        self.imm_cv.notify_all();
    }

    /// Deletes files no live version references: old tables, consumed
    /// WALs, superseded MANIFESTs, abandoned temp files. Skipped
    /// entirely while file deletions are disabled.
    fn remove_obsolete_files(&self, guard: &mut DbInner) {
        if self.opts.disable_file_deletions {
            return;
        }

        let live = guard.versions.live_files();
        let log_number = guard.versions.log_number();
        let manifest_number = guard.versions.manifest_number();
        let wal_number = guard.wal_number;

        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(kind) = files::parse_file_name(name) else {
                continue;
            };
            let delete = match kind {
                files::FileKind::Table(n) => {
                    !live.contains(&n) && !guard.pending_outputs.contains(&n)
                }
                files::FileKind::WriteAheadLog(n) => n < log_number && n != wal_number,
                files::FileKind::Manifest(n) => n != manifest_number,
                files::FileKind::Temp(n) => !guard.pending_outputs.contains(&n),
                files::FileKind::Current | files::FileKind::Lock => false,
            };
            if delete {
                debug!(file = name, "removing obsolete file");
                if let files::FileKind::Table(n) = kind {
                    self.table_cache.evict(n);
                }
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(file = name, error = %e, "failed to remove obsolete file");
                }
            }
        }
    }

    // --------------------------------------------------------------------
    // Workers / shutdown
    // --------------------------------------------------------------------

    fn start_workers(self: &Arc<Self>, flush_rx: Receiver<WorkerMsg>, compact_rx: Receiver<WorkerMsg>) {
        let flush_weak = Arc::downgrade(self);
        let flush_handle = thread::Builder::new()
            .name("silexdb-flush".into())
            .spawn(move || flush_worker(flush_weak, flush_rx))
            .expect("failed to spawn flush worker");

        let compact_weak = Arc::downgrade(self);
        let compact_handle = thread::Builder::new()
            .name("silexdb-compact".into())
            .spawn(move || compaction_worker(compact_weak, compact_rx))
            .expect("failed to spawn compaction worker");

        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        workers.push(flush_handle);
        workers.push(compact_handle);
    }

    fn close(&self) -> Result<(), DbError> {
        {
            let mut guard = self.lock_inner();
            if guard.closed {
                return Ok(());
            }
            guard.closed = true;
        }
        self.shutdown.store(true, AtomicOrdering::SeqCst);

        // Release every waiter regardless of the stall condition.
        self.write_stall_cv.notify_all();
        self.imm_cv.notify_all();

        let _ = self.flush_tx.send(WorkerMsg::Shutdown);
        let _ = self.compact_tx.send(WorkerMsg::Shutdown);

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }

        let guard = self.lock_inner();
        guard.wal.sync()?;
        info!(dir = %self.dir.display(), "database closed");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Background workers
// ------------------------------------------------------------------------------------------------

fn flush_worker(shared: Weak<DbShared>, rx: Receiver<WorkerMsg>) {
    loop {
        match rx.recv() {
            Ok(WorkerMsg::Work) => {
                let Some(shared) = shared.upgrade() else { break };
                if shared.shutdown.load(AtomicOrdering::SeqCst) {
                    break;
                }
                if let Err(e) = shared.flush_once() {
                    error!(error = %e, "background flush failed");
                }
            }
            Ok(WorkerMsg::Shutdown) | Err(_) => break,
        }
    }
}

fn compaction_worker(shared: Weak<DbShared>, rx: Receiver<WorkerMsg>) {
    loop {
        match rx.recv() {
            Ok(WorkerMsg::Work) => {
                let Some(shared) = shared.upgrade() else { break };
                while !shared.shutdown.load(AtomicOrdering::SeqCst) {
                    let Some(plan) = shared.pick_and_claim() else {
                        break;
                    };
                    if let Err(e) = shared.execute_compaction(&plan) {
                        warn!(error = %e, "background compaction failed");
                        break;
                    }
                }
            }
            Ok(WorkerMsg::Shutdown) | Err(_) => break,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Batch → memtable application
// ------------------------------------------------------------------------------------------------

/// Applies batch records into a memtable, stamping each with its
/// assigned sequence in order.
struct MemtableInserter<'a> {
    mem: &'a Memtable,
    seq: SequenceNumber,
}

impl MemtableInserter<'_> {
    fn apply(
        &mut self,
        kind: ValueType,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), BatchError> {
        let seq = self.seq;
        self.seq += 1;
        self.mem
            .add(seq, kind, key, value)
            .map_err(|e| BatchError::Handler(e.to_string()))
    }
}

impl BatchHandler for MemtableInserter<'_> {
    fn put(&mut self, _cf: u32, key: &[u8], value: &[u8]) -> Result<(), BatchError> {
        self.apply(ValueType::Value, key, value)
    }

    fn delete(&mut self, _cf: u32, key: &[u8]) -> Result<(), BatchError> {
        self.apply(ValueType::Deletion, key, &[])
    }

    fn single_delete(&mut self, _cf: u32, key: &[u8]) -> Result<(), BatchError> {
        self.apply(ValueType::SingleDeletion, key, &[])
    }

    fn merge(&mut self, _cf: u32, key: &[u8], value: &[u8]) -> Result<(), BatchError> {
        self.apply(ValueType::Merge, key, value)
    }

    fn delete_range(&mut self, _cf: u32, start: &[u8], end: &[u8]) -> Result<(), BatchError> {
        let seq = self.seq;
        self.seq += 1;
        self.mem
            .add_range_tombstone(seq, start, end)
            .map_err(|e| BatchError::Handler(e.to_string()))
    }
}

// ------------------------------------------------------------------------------------------------
// Recovery helpers
// ------------------------------------------------------------------------------------------------

fn map_open_error(e: VersionError) -> DbError {
    match e {
        VersionError::DatabaseNotFound(path) => DbError::DatabaseNotFound(path),
        VersionError::IncompatibleFormat(detail) => DbError::IncompatibleFormat(detail),
        VersionError::Corrupt(detail) => DbError::Corruption(detail),
        other => other.into(),
    }
}

/// WAL file numbers at or above the recovered log number.
fn scan_wal_numbers(dir: &Path, log_number: u64) -> Result<Vec<u64>, DbError> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(files::FileKind::WriteAheadLog(n)) = files::parse_file_name(name)
            && n >= log_number
        {
            numbers.push(n);
        }
    }
    Ok(numbers)
}

/// Replays one WAL into a recovery memtable and flushes it to L0.
///
/// Sequence numbers come from the batch headers. A torn tail (checksum
/// or framing failure) ends the replay of that file; everything before
/// it is kept. The flush edit advances `log_number` past this WAL —
/// its data is durable once the edit lands.
fn replay_one_wal(
    dir: &Path,
    wal_number: u64,
    versions: &mut VersionSet,
    opts: &DbOptions,
) -> Result<(), DbError> {
    let path = files::log_file_path(dir, wal_number);
    let wal = Wal::<WriteBatch>::open(&path, None)?;
    let mem = Memtable::new(opts.comparator.clone());

    let mut last_seq = versions.last_sequence();
    let mut replayed = 0u64;

    for item in wal.replay_iter()? {
        let batch = match item {
            Ok(batch) => batch,
            Err(e) => {
                // A torn tail is expected after a crash; corruption in
                // the middle is indistinguishable, so recovery keeps the
                // prefix either way and reports the cut.
                warn!(
                    wal_number,
                    replayed,
                    error = %e,
                    "WAL replay stopped at damaged record"
                );
                break;
            }
        };

        let base = batch.sequence();
        let mut inserter = MemtableInserter {
            mem: &mem,
            seq: base,
        };
        let applied = batch.iterate(&mut inserter)?;
        if applied > 0 {
            last_seq = last_seq.max(base + applied as u64 - 1);
        }
        replayed += 1;
    }

    versions.set_last_sequence(last_seq);

    if !mem.is_empty() {
        let file_number = versions.next_file_number();
        let meta = flush::build_flush_file(dir, &mem, file_number, opts)?
            .ok_or_else(|| DbError::Internal("nonempty recovery memtable flushed empty".into()))?;

        let mut edit = VersionEdit {
            last_sequence: Some(last_seq),
            log_number: Some(wal_number + 1),
            ..VersionEdit::default()
        };
        edit.add_file(0, meta);
        versions.log_and_apply(edit)?;
        info!(wal_number, replayed, "recovered WAL flushed to L0");
    } else {
        // Nothing to persist, so the log is trivially durable; advance
        // the low-water mark so the file can be collected.
        let edit = VersionEdit {
            log_number: Some(wal_number + 1),
            ..VersionEdit::default()
        };
        versions.log_and_apply(edit)?;
        debug!(wal_number, replayed, "recovered WAL held no live records");
    }

    Ok(())
}

impl Db {
    /// Wakes every writer blocked on the stall condition, regardless of
    /// the current condition. Part of graceful shutdown; exposed for
    /// tests that block background work.
    pub fn release_write_stall(&self) {
        self.shared.write_stall_cv.notify_all();
    }
}
