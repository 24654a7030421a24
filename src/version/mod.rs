//! # Versions and the MANIFEST
//!
//! A [`Version`] is an immutable snapshot of the LSM's file membership:
//! for each level, an ordered list of [`FileMetaData`]. Versions are
//! shared by reference count (`Arc`); readers, iterators, and compaction
//! jobs hold a version so the files they read cannot be deleted
//! underneath them.
//!
//! The [`VersionSet`] owns the current version and the durable log of
//! [`VersionEdit`] deltas — the `MANIFEST-<n>` file, framed exactly like
//! the WAL. The `CURRENT` file names the active MANIFEST.
//! [`VersionSet::log_and_apply`] is the linearization point of every
//! flush and compaction: append the edit, fsync, apply it to the
//! previous current version, and publish the result atomically.
//!
//! ## Invariants
//!
//! - Files in levels ≥ 1 are sorted by smallest user key and do not
//!   overlap; candidate lookup uses binary search on the largest key.
//! - L0 files may overlap and are ordered newest-first (descending file
//!   number).
//! - `next_file_number` is monotonic and never reused within a process
//!   lifetime; `last_sequence` never decreases.
//! - `log_number` never advances past the oldest WAL whose data is not
//!   yet durable in SSTables.

#[cfg(test)]
mod tests;

use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DbOptions;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::files;
use crate::keys::{ComparatorRef, InternalKey, SequenceNumber};
use crate::wal::{Wal, WalError};

/// Number of LSM levels.
pub const NUM_LEVELS: usize = DbOptions::NUM_LEVELS;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by version-set operations.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// MANIFEST log failure.
    #[error("Manifest log error: {0}")]
    Wal(#[from] WalError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// No database exists at the path.
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    /// The MANIFEST was written under an incompatible comparator.
    #[error("Incompatible format: {0}")]
    IncompatibleFormat(String),

    /// MANIFEST contents violate an invariant.
    #[error("Corrupt manifest: {0}")]
    Corrupt(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// FileMetaData
// ------------------------------------------------------------------------------------------------

/// Metadata for one live SSTable.
#[derive(Debug)]
pub struct FileMetaData {
    /// File number (names the `.sst` file).
    pub number: u64,

    /// File size in bytes.
    pub file_size: u64,

    /// Smallest internal key in the table.
    pub smallest: InternalKey,

    /// Largest internal key in the table.
    pub largest: InternalKey,

    /// Smallest sequence present.
    pub smallest_seq: SequenceNumber,

    /// Largest sequence present.
    pub largest_seq: SequenceNumber,

    /// Column family the file belongs to.
    pub column_family: u32,

    /// Set while a compaction claims this file as input. Guarded by the
    /// engine lock; the atomic only makes cross-thread reads tear-free.
    pub being_compacted: AtomicBool,
}

impl FileMetaData {
    /// Creates metadata for a freshly written table.
    pub fn new(
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
        smallest_seq: SequenceNumber,
        largest_seq: SequenceNumber,
        column_family: u32,
    ) -> Self {
        Self {
            number,
            file_size,
            smallest,
            largest,
            smallest_seq,
            largest_seq,
            column_family,
            being_compacted: AtomicBool::new(false),
        }
    }

    /// `true` while a compaction claims this file.
    pub fn is_being_compacted(&self) -> bool {
        self.being_compacted.load(AtomicOrdering::SeqCst)
    }

    /// Claims or releases the file for compaction.
    pub fn set_being_compacted(&self, value: bool) {
        self.being_compacted.store(value, AtomicOrdering::SeqCst);
    }
}

impl encoding::Encode for FileMetaData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_u64(buf, self.number);
        encoding::put_u64(buf, self.file_size);
        encoding::put_bytes(buf, &self.smallest.encode())?;
        encoding::put_bytes(buf, &self.largest.encode())?;
        encoding::put_u64(buf, self.smallest_seq);
        encoding::put_u64(buf, self.largest_seq);
        encoding::put_u32(buf, self.column_family);
        Ok(())
    }
}

impl encoding::Decode for FileMetaData {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        let number = reader.u64()?;
        let file_size = reader.u64()?;
        let smallest = InternalKey::decode(reader.byte_slice()?)
            .ok_or_else(|| EncodingError::Custom("bad smallest internal key".into()))?;
        let largest = InternalKey::decode(reader.byte_slice()?)
            .ok_or_else(|| EncodingError::Custom("bad largest internal key".into()))?;

        Ok(Self {
            number,
            file_size,
            smallest,
            largest,
            smallest_seq: reader.u64()?,
            largest_seq: reader.u64()?,
            column_family: reader.u32()?,
            being_compacted: AtomicBool::new(false),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Column family ops
// ------------------------------------------------------------------------------------------------

/// Column-family metadata mutation carried by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnFamilyOp {
    /// Creates a family.
    Create {
        /// Assigned family id.
        id: u32,
        /// Family name.
        name: String,
    },

    /// Drops a family.
    Drop {
        /// Dropped family id.
        id: u32,
    },

    /// Advances the next-family-id counter.
    SetNextId {
        /// New counter value.
        id: u32,
    },
}

// ------------------------------------------------------------------------------------------------
// VersionEdit
// ------------------------------------------------------------------------------------------------

/// A delta record appended to the MANIFEST.
///
/// Encoded as a stream of `[u32 tag][payload]` fields so readers skip
/// nothing and unknown tags are a hard corruption signal.
#[derive(Debug, Default)]
pub struct VersionEdit {
    /// Comparator identity; present in the first edit of a MANIFEST.
    pub comparator_name: Option<String>,

    /// New WAL low-water mark: logs below this number are fully durable.
    pub log_number: Option<u64>,

    /// High-water mark of the file-number counter.
    pub next_file_number: Option<u64>,

    /// New last-sequence value (monotone).
    pub last_sequence: Option<SequenceNumber>,

    /// Files removed, as `(level, file_number)`.
    pub deleted_files: Vec<(u32, u64)>,

    /// Files added, as `(level, meta)`.
    pub new_files: Vec<(u32, Arc<FileMetaData>)>,

    /// Column-family metadata mutations.
    pub column_families: Vec<ColumnFamilyOp>,
}

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_CF_CREATE: u32 = 8;
const TAG_CF_DROP: u32 = 9;
const TAG_CF_NEXT_ID: u32 = 10;

impl VersionEdit {
    /// Records a file addition.
    pub fn add_file(&mut self, level: usize, meta: Arc<FileMetaData>) {
        self.new_files.push((level as u32, meta));
    }

    /// Records a file deletion.
    pub fn delete_file(&mut self, level: usize, file_number: u64) {
        self.deleted_files.push((level as u32, file_number));
    }

    /// `true` when the edit carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.comparator_name.is_none()
            && self.log_number.is_none()
            && self.next_file_number.is_none()
            && self.last_sequence.is_none()
            && self.deleted_files.is_empty()
            && self.new_files.is_empty()
            && self.column_families.is_empty()
    }
}

impl encoding::Encode for VersionEdit {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        if let Some(name) = &self.comparator_name {
            encoding::put_u32(buf, TAG_COMPARATOR);
            encoding::put_str(buf, name)?;
        }
        if let Some(n) = self.log_number {
            encoding::put_u32(buf, TAG_LOG_NUMBER);
            encoding::put_u64(buf, n);
        }
        if let Some(n) = self.next_file_number {
            encoding::put_u32(buf, TAG_NEXT_FILE_NUMBER);
            encoding::put_u64(buf, n);
        }
        if let Some(n) = self.last_sequence {
            encoding::put_u32(buf, TAG_LAST_SEQUENCE);
            encoding::put_u64(buf, n);
        }
        for (level, number) in &self.deleted_files {
            encoding::put_u32(buf, TAG_DELETED_FILE);
            encoding::put_u32(buf, *level);
            encoding::put_u64(buf, *number);
        }
        for (level, meta) in &self.new_files {
            encoding::put_u32(buf, TAG_NEW_FILE);
            encoding::put_u32(buf, *level);
            meta.encode_to(buf)?;
        }
        for op in &self.column_families {
            match op {
                ColumnFamilyOp::Create { id, name } => {
                    encoding::put_u32(buf, TAG_CF_CREATE);
                    encoding::put_u32(buf, *id);
                    encoding::put_str(buf, name)?;
                }
                ColumnFamilyOp::Drop { id } => {
                    encoding::put_u32(buf, TAG_CF_DROP);
                    encoding::put_u32(buf, *id);
                }
                ColumnFamilyOp::SetNextId { id } => {
                    encoding::put_u32(buf, TAG_CF_NEXT_ID);
                    encoding::put_u32(buf, *id);
                }
            }
        }
        Ok(())
    }
}

impl encoding::Decode for VersionEdit {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        let mut edit = VersionEdit::default();

        while reader.remaining() > 0 {
            let tag = reader.u32()?;
            match tag {
                TAG_COMPARATOR => edit.comparator_name = Some(reader.string()?),
                TAG_LOG_NUMBER => edit.log_number = Some(reader.u64()?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(reader.u64()?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(reader.u64()?),
                TAG_DELETED_FILE => {
                    let level = reader.u32()?;
                    let number = reader.u64()?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = reader.u32()?;
                    let meta = FileMetaData::decode(reader)?;
                    edit.new_files.push((level, Arc::new(meta)));
                }
                TAG_CF_CREATE => {
                    let id = reader.u32()?;
                    let name = reader.string()?;
                    edit.column_families.push(ColumnFamilyOp::Create { id, name });
                }
                TAG_CF_DROP => {
                    let id = reader.u32()?;
                    edit.column_families.push(ColumnFamilyOp::Drop { id });
                }
                TAG_CF_NEXT_ID => {
                    let id = reader.u32()?;
                    edit.column_families.push(ColumnFamilyOp::SetNextId { id });
                }
                other => {
                    return Err(EncodingError::UnknownTag {
                        tag: other,
                        what: "VersionEdit",
                    });
                }
            }
        }

        Ok(edit)
    }
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// An immutable snapshot of the per-level file membership.
pub struct Version {
    /// Per-level file lists. L0 newest-first; L1+ sorted by smallest
    /// user key, non-overlapping.
    files: Vec<Vec<Arc<FileMetaData>>>,

    /// Monotone version number, for diagnostics.
    number: u64,

    /// User-key comparator.
    cmp: ComparatorRef,
}

impl Version {
    fn empty(cmp: ComparatorRef) -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
            number: 0,
            cmp,
        }
    }

    /// The files at `level`.
    pub fn level_files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// Number of files at `level`.
    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Total bytes at `level`.
    pub fn level_total_size(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    /// This version's monotone number.
    pub fn version_number(&self) -> u64 {
        self.number
    }

    /// Files at every level, flattened.
    pub fn all_files(&self) -> impl Iterator<Item = (usize, &Arc<FileMetaData>)> {
        self.files
            .iter()
            .enumerate()
            .flat_map(|(level, files)| files.iter().map(move |f| (level, f)))
    }

    /// The deepest non-empty level.
    pub fn max_populated_level(&self) -> usize {
        (0..NUM_LEVELS)
            .rev()
            .find(|&l| !self.files[l].is_empty())
            .unwrap_or(0)
    }

    /// Files at `level` whose user-key span intersects
    /// `[smallest, largest]` (both inclusive; `None` = unbounded).
    ///
    /// L0 files may overlap each other, so L0 always scans linearly.
    /// L1+ files are sorted and disjoint: binary search on the largest
    /// user key finds the first candidate.
    pub fn overlapping_files(
        &self,
        level: usize,
        smallest: Option<&[u8]>,
        largest: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let files = &self.files[level];
        if files.is_empty() {
            return Vec::new();
        }

        let intersects = |f: &Arc<FileMetaData>| {
            let below = match largest {
                Some(hi) => self.cmp.compare(&f.smallest.user_key, hi) != std::cmp::Ordering::Greater,
                None => true,
            };
            let above = match smallest {
                Some(lo) => self.cmp.compare(&f.largest.user_key, lo) != std::cmp::Ordering::Less,
                None => true,
            };
            below && above
        };

        if level == 0 {
            return files.iter().filter(|f| intersects(f)).cloned().collect();
        }

        // First file whose largest key reaches the lower bound.
        let start = match smallest {
            Some(lo) => files.partition_point(|f| {
                self.cmp.compare(&f.largest.user_key, lo) == std::cmp::Ordering::Less
            }),
            None => 0,
        };

        files[start..]
            .iter()
            .take_while(|f| match largest {
                Some(hi) => {
                    self.cmp.compare(&f.smallest.user_key, hi) != std::cmp::Ordering::Greater
                }
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Files consulted for a point lookup of `user_key`, in
    /// newest-to-oldest order: L0 files (newest first) containing the
    /// key, then at most one file per deeper level.
    pub fn files_for_key(&self, user_key: &[u8]) -> Vec<(usize, Arc<FileMetaData>)> {
        let mut result = Vec::new();

        for f in &self.files[0] {
            if self.cmp.compare(&f.smallest.user_key, user_key) != std::cmp::Ordering::Greater
                && self.cmp.compare(user_key, &f.largest.user_key) != std::cmp::Ordering::Greater
            {
                result.push((0, f.clone()));
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            // Files are disjoint except for possibly-shared boundary
            // keys, so at most two consecutive files can contain the
            // key.
            let mut idx = files.partition_point(|f| {
                self.cmp.compare(&f.largest.user_key, user_key) == std::cmp::Ordering::Less
            });
            while idx < files.len()
                && self.cmp.compare(&files[idx].smallest.user_key, user_key)
                    != std::cmp::Ordering::Greater
            {
                result.push((level, files[idx].clone()));
                idx += 1;
            }
        }

        result
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<usize> = self.files.iter().map(Vec::len).collect();
        f.debug_struct("Version")
            .field("number", &self.number)
            .field("files_per_level", &counts)
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Version builder
// ------------------------------------------------------------------------------------------------

/// Applies one edit to a base version, producing its successor.
fn apply_edit(
    base: &Version,
    edit: &VersionEdit,
    number: u64,
    cmp: &ComparatorRef,
) -> Result<Version, VersionError> {
    let mut files: Vec<Vec<Arc<FileMetaData>>> =
        base.files.iter().map(|level| level.to_vec()).collect();

    for (level, file_number) in &edit.deleted_files {
        let level = *level as usize;
        if level >= NUM_LEVELS {
            return Err(VersionError::Corrupt(format!(
                "deleted file at level {level} out of range"
            )));
        }
        files[level].retain(|f| f.number != *file_number);
    }

    for (level, meta) in &edit.new_files {
        let level = *level as usize;
        if level >= NUM_LEVELS {
            return Err(VersionError::Corrupt(format!(
                "new file at level {level} out of range"
            )));
        }
        if files[level].iter().any(|f| f.number == meta.number) {
            // Replay of an already-applied edit; keep idempotent.
            continue;
        }
        files[level].push(meta.clone());
    }

    // L0 newest-first; deeper levels sorted by smallest user key.
    files[0].sort_by(|a, b| b.number.cmp(&a.number));
    for level_files in files.iter_mut().skip(1) {
        level_files.sort_by(|a, b| cmp.compare(&a.smallest.user_key, &b.smallest.user_key));
    }

    // Non-overlap invariant at L1+. Adjacent files may share exactly
    // one boundary key: the exclusive end of a clipped range tombstone
    // widens the left file's bound to the right file's first key.
    for (level, level_files) in files.iter().enumerate().skip(1) {
        for pair in level_files.windows(2) {
            if cmp.compare(&pair[0].largest.user_key, &pair[1].smallest.user_key)
                == std::cmp::Ordering::Greater
            {
                return Err(VersionError::Corrupt(format!(
                    "overlapping files {} and {} at level {level}",
                    pair[0].number, pair[1].number
                )));
            }
        }
    }

    Ok(Version {
        files,
        number,
        cmp: cmp.clone(),
    })
}

// ------------------------------------------------------------------------------------------------
// VersionSet
// ------------------------------------------------------------------------------------------------

/// Owns the current [`Version`], the MANIFEST writer, and the engine's
/// monotonic counters. All mutation happens under the engine lock.
pub struct VersionSet {
    /// Database root directory.
    dir: PathBuf,

    /// User-key comparator.
    cmp: ComparatorRef,

    /// The published current version.
    current: Arc<Version>,

    /// MANIFEST log writer.
    manifest: Wal<VersionEdit>,

    /// Number of the active MANIFEST file.
    manifest_number: u64,

    /// Next file number to allocate.
    next_file_number: u64,

    /// Highest sequence number handed out.
    last_sequence: SequenceNumber,

    /// Oldest WAL whose data may not yet be durable in SSTables.
    log_number: u64,

    /// Monotone counter stamped onto versions.
    version_counter: u64,

    /// Registry of all live versions, for reporting.
    live_versions: Vec<Weak<Version>>,

    /// Known column families, `(id, name)`.
    column_families: Vec<(u32, String)>,

    /// Next column-family id to assign.
    next_column_family_id: u32,
}

impl VersionSet {
    /// Initializes a fresh database: empty version, `MANIFEST-000001`
    /// carrying the bootstrap edit, and a `CURRENT` pointing at it.
    pub fn create(dir: impl AsRef<Path>, cmp: ComparatorRef) -> Result<Self, VersionError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let manifest_number = 1;
        let manifest_path = files::manifest_file_path(&dir, manifest_number);
        let manifest = Wal::<VersionEdit>::open(&manifest_path, None)?;

        let mut set = Self {
            dir: dir.clone(),
            cmp: cmp.clone(),
            current: Arc::new(Version::empty(cmp.clone())),
            manifest,
            manifest_number,
            // 1 is the MANIFEST itself.
            next_file_number: 2,
            last_sequence: 0,
            log_number: 0,
            version_counter: 0,
            live_versions: Vec::new(),
            column_families: vec![(0, "default".to_string())],
            next_column_family_id: 1,
        };

        set.live_versions.push(Arc::downgrade(&set.current));

        let bootstrap = VersionEdit {
            comparator_name: Some(cmp.name().to_string()),
            next_file_number: Some(set.next_file_number),
            last_sequence: Some(0),
            log_number: Some(0),
            column_families: vec![
                ColumnFamilyOp::Create {
                    id: 0,
                    name: "default".to_string(),
                },
                ColumnFamilyOp::SetNextId { id: 1 },
            ],
            ..VersionEdit::default()
        };
        set.manifest.append(&bootstrap)?;
        set.manifest.sync()?;

        write_current_file(&dir, manifest_number)?;

        info!(dir = %dir.display(), "version set created");
        Ok(set)
    }

    /// Recovers the version set from the `CURRENT` pointer and the
    /// MANIFEST it names.
    pub fn recover(dir: impl AsRef<Path>, cmp: ComparatorRef) -> Result<Self, VersionError> {
        let dir = dir.as_ref().to_path_buf();

        let current_path = files::current_file_path(&dir);
        let mut contents = String::new();
        File::open(&current_path)
            .map_err(|_| VersionError::DatabaseNotFound(dir.display().to_string()))?
            .read_to_string(&mut contents)?;
        let manifest_name = contents.trim_end_matches('\n');

        let manifest_number = match files::parse_file_name(manifest_name) {
            Some(files::FileKind::Manifest(n)) => n,
            _ => {
                return Err(VersionError::Corrupt(format!(
                    "CURRENT names {manifest_name:?}, not a MANIFEST"
                )));
            }
        };

        let manifest_path = dir.join(manifest_name);
        if !manifest_path.exists() {
            return Err(VersionError::Corrupt(format!(
                "CURRENT names missing file {manifest_name:?}"
            )));
        }
        let manifest = Wal::<VersionEdit>::open(&manifest_path, None)?;

        let mut set = Self {
            dir: dir.clone(),
            cmp: cmp.clone(),
            current: Arc::new(Version::empty(cmp.clone())),
            manifest,
            manifest_number,
            next_file_number: manifest_number + 1,
            last_sequence: 0,
            log_number: 0,
            version_counter: 0,
            live_versions: Vec::new(),
            column_families: Vec::new(),
            next_column_family_id: 1,
        };

        let mut version = Version::empty(cmp.clone());
        let mut edit_count = 0u64;
        for item in set.manifest.replay_iter()? {
            // MANIFEST corruption is a hard failure: file membership
            // cannot be trusted past a bad record.
            let edit = item?;
            set.absorb_counters(&edit)?;
            set.version_counter += 1;
            version = apply_edit(&version, &edit, set.version_counter, &cmp)?;
            edit_count += 1;
        }

        if set.column_families.is_empty() {
            return Err(VersionError::Corrupt(
                "manifest carries no column-family metadata".into(),
            ));
        }

        // Never hand out numbers at or below anything recorded.
        for (_, meta) in version.all_files() {
            set.mark_file_number_used(meta.number);
        }
        set.mark_file_number_used(manifest_number);

        set.current = Arc::new(version);
        set.live_versions.push(Arc::downgrade(&set.current));

        debug!(
            dir = %dir.display(),
            edits = edit_count,
            last_sequence = set.last_sequence,
            log_number = set.log_number,
            next_file_number = set.next_file_number,
            "version set recovered"
        );

        Ok(set)
    }

    fn absorb_counters(&mut self, edit: &VersionEdit) -> Result<(), VersionError> {
        if let Some(name) = &edit.comparator_name
            && name != self.cmp.name()
        {
            return Err(VersionError::IncompatibleFormat(format!(
                "manifest written with comparator {:?}, opened with {:?}",
                name,
                self.cmp.name()
            )));
        }
        if let Some(n) = edit.log_number {
            self.log_number = self.log_number.max(n);
        }
        if let Some(n) = edit.next_file_number {
            self.next_file_number = self.next_file_number.max(n);
        }
        if let Some(n) = edit.last_sequence {
            self.last_sequence = self.last_sequence.max(n);
        }
        for op in &edit.column_families {
            match op {
                ColumnFamilyOp::Create { id, name } => {
                    if !self.column_families.iter().any(|(i, _)| i == id) {
                        self.column_families.push((*id, name.clone()));
                    }
                }
                ColumnFamilyOp::Drop { id } => {
                    self.column_families.retain(|(i, _)| i != id);
                }
                ColumnFamilyOp::SetNextId { id } => {
                    self.next_column_family_id = self.next_column_family_id.max(*id);
                }
            }
        }
        Ok(())
    }

    /// Appends `edit` to the MANIFEST, fsyncs it, applies it to the
    /// previous current version, and publishes the result.
    ///
    /// The edit is stamped with the file-number high-water mark so a
    /// replay can never re-issue an allocated number. Callers must not
    /// advance `log_number` past a WAL whose data is not yet durable.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> Result<Arc<Version>, VersionError> {
        if let Some(n) = edit.log_number
            && n < self.log_number
        {
            return Err(VersionError::Internal(format!(
                "log_number moving backwards: {} -> {}",
                self.log_number, n
            )));
        }

        edit.next_file_number = Some(self.next_file_number);
        if let Some(seq) = edit.last_sequence {
            edit.last_sequence = Some(seq.max(self.last_sequence));
        }

        self.manifest.append(&edit)?;
        self.manifest.sync()?;

        self.absorb_counters(&edit)?;
        self.version_counter += 1;
        let next = Arc::new(apply_edit(
            &self.current,
            &edit,
            self.version_counter,
            &self.cmp,
        )?);

        self.current = next.clone();
        self.live_versions.push(Arc::downgrade(&next));
        self.prune_live_versions();

        debug!(
            version = next.number,
            added = edit.new_files.len(),
            deleted = edit.deleted_files.len(),
            "version edit applied"
        );

        Ok(next)
    }

    /// The current version; the returned `Arc` is the caller's ref.
    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    /// Allocates a fresh file number. Monotonic; never reused within a
    /// process lifetime.
    pub fn next_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Bumps the allocation counter past `number`.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// The highest sequence handed out.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    /// Monotone setter: never decreases the stored value.
    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        if seq > self.last_sequence {
            self.last_sequence = seq;
        }
    }

    /// Oldest WAL number whose data may not be durable in SSTables.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Number of the active MANIFEST file.
    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }

    /// Number of versions still referenced somewhere.
    pub fn num_live_versions(&mut self) -> usize {
        self.prune_live_versions();
        self.live_versions.len()
    }

    /// The current version's monotone number.
    pub fn current_version_number(&self) -> u64 {
        self.current.number
    }

    /// Known column families as `(id, name)` pairs.
    pub fn column_families(&self) -> &[(u32, String)] {
        &self.column_families
    }

    /// File numbers referenced by any live version.
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.prune_live_versions();
        let mut live = HashSet::new();
        for weak in &self.live_versions {
            if let Some(version) = weak.upgrade() {
                for (_, meta) in version.all_files() {
                    live.insert(meta.number);
                }
            }
        }
        for (_, meta) in self.current.all_files() {
            live.insert(meta.number);
        }
        live
    }

    fn prune_live_versions(&mut self) {
        self.live_versions.retain(|w| w.strong_count() > 0);
        if self
            .live_versions
            .iter()
            .all(|w| !w.ptr_eq(&Arc::downgrade(&self.current)))
        {
            // `current` is always live even if its weak was pruned.
            self.live_versions.push(Arc::downgrade(&self.current));
        }
    }
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("dir", &self.dir)
            .field("manifest_number", &self.manifest_number)
            .field("next_file_number", &self.next_file_number)
            .field("last_sequence", &self.last_sequence)
            .field("log_number", &self.log_number)
            .field("current", &self.current)
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// CURRENT pointer file
// ------------------------------------------------------------------------------------------------

/// Writes `CURRENT` atomically: temp file, fsync, rename, fsync dir.
fn write_current_file(dir: &Path, manifest_number: u64) -> Result<(), VersionError> {
    let tmp_path = dir.join("CURRENT.tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        writeln!(f, "{}", files::manifest_file_name(manifest_number))?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, files::current_file_path(dir))?;

    match File::open(dir) {
        Ok(d) => {
            if let Err(e) = d.sync_all() {
                warn!(dir = %dir.display(), error = %e, "directory fsync failed after CURRENT update");
            }
        }
        Err(e) => warn!(dir = %dir.display(), error = %e, "directory open failed after CURRENT update"),
    }
    Ok(())
}

