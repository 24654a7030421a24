//! # Table Cache
//!
//! A bounded mapping from SSTable file number to an open, shared
//! [`SSTable`] reader.
//!
//! Opening a table costs an mmap plus meta-block decodes, so readers
//! are cached and shared via `Arc`. The cache guarantees:
//!
//! - **Single-flight opens** — at most one concurrent open per file
//!   number; concurrent callers for the same number wait on the opener's
//!   placeholder guard rather than racing.
//! - **Handle safety on eviction** — eviction drops the cache's `Arc`
//!   only; a reader with outstanding handles stays alive until the last
//!   handle is released.
//! - **Explicit invalidation** — when a file is deleted, its entry is
//!   evicted so a later reuse of the number cannot observe a stale
//!   reader.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use quick_cache::sync::{Cache, GuardResult};
use thiserror::Error;
use tracing::{debug, trace};

use crate::files;
use crate::keys::ComparatorRef;
use crate::sstable::{SSTable, SSTableError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table-cache operations.
#[derive(Debug, Error)]
pub enum TableCacheError {
    /// The table failed to open or validate.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// TableCache
// ------------------------------------------------------------------------------------------------

/// Bounded cache of open SSTable readers keyed by file number.
pub struct TableCache {
    /// Database root directory.
    dir: PathBuf,

    /// User-key comparator handed to every opened table.
    comparator: ComparatorRef,

    /// `file_number → reader` with per-key placeholder guards.
    cache: Cache<u64, Arc<SSTable>>,
}

impl TableCache {
    /// Creates a cache holding at most `capacity` open readers.
    pub fn new(dir: impl AsRef<Path>, comparator: ComparatorRef, capacity: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            comparator,
            cache: Cache::new(capacity.max(1)),
        }
    }

    /// Returns a shared handle to the reader for `file_number`, opening
    /// the table on a miss.
    ///
    /// The placeholder guard ensures no more than one open is in flight
    /// per file number; losers of the race receive the winner's reader.
    pub fn get(&self, file_number: u64) -> Result<Arc<SSTable>, TableCacheError> {
        match self.cache.get_value_or_guard(&file_number, None) {
            GuardResult::Value(table) => {
                trace!(file_number, "table cache hit");
                Ok(table)
            }
            GuardResult::Guard(guard) => {
                let path = files::table_file_path(&self.dir, file_number);
                debug!(file_number, path = %path.display(), "table cache miss, opening");
                let table = Arc::new(SSTable::open(&path, file_number, self.comparator.clone())?);
                // A failed insert only means the guard expired; the
                // handle we return is valid either way.
                let _ = guard.insert(table.clone());
                Ok(table)
            }
            GuardResult::Timeout => Err(TableCacheError::Internal(
                "placeholder guard timed out without a deadline".into(),
            )),
        }
    }

    /// Drops the cached reader for `file_number`, if any.
    ///
    /// Called when the file is about to be deleted. Outstanding `Arc`
    /// handles keep the mmap alive until released.
    pub fn evict(&self, file_number: u64) {
        if self.cache.remove(&file_number).is_some() {
            trace!(file_number, "table cache entry evicted");
        }
    }

    /// Drops every cached reader.
    pub fn close_all(&self) {
        self.cache.clear();
    }

    /// Number of readers currently cached.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// `true` if no readers are cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl std::fmt::Debug for TableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCache")
            .field("dir", &self.dir)
            .field("cached", &self.cache.len())
            .finish()
    }
}
