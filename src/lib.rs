//! # SilexDB
//!
//! An embeddable, ordered key-value storage engine built on a leveled
//! **Log-Structured Merge Tree (LSM-tree)**. Durable, crash-consistent
//! point and range access to byte-string keys and values, with snapshot
//! isolation, atomic batch writes, range deletions, and merge operands.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                          Db                               │
//! │  ┌───────────┐   ┌───────────┐   ┌─────────────────────┐  │
//! │  │  Active    │   │ Immutable │   │  SSTables (L0…L6)   │  │
//! │  │  Memtable  │   │ Memtable  │   │  tracked by the     │  │
//! │  │  + WAL     │   │           │   │  VersionSet         │  │
//! │  └─────┬──────┘   └─────┬─────┘   └──────────┬──────────┘  │
//! │        │  switch        │  flush             │             │
//! │        └──────────►     └─────────►          │             │
//! │                                              │             │
//! │  ┌───────────────────────────────────────────┘             │
//! │  │  Leveled compaction (L0→L1, size-triggered, manual)    │
//! │  └────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────┐   │
//! │  │  MANIFEST (version-edit log) + CURRENT pointer     │   │
//! │  └────────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | The [`Db`] facade — open, read, write, iterate, flush, compact |
//! | [`batch`] | Atomic write batches with typed records |
//! | [`keys`] | Internal keys, value types, comparators |
//! | [`memtable`] | In-memory write buffer with multi-version entries |
//! | [`wal`] | CRC-framed append-only log (WAL and MANIFEST framing) |
//! | [`sstable`] | Immutable sorted tables with bloom filters and meta blocks |
//! | [`version`] | Per-level file membership, version edits, the MANIFEST |
//! | [`compaction`] | Leveled compaction picker and job |
//! | [`tombstone`] | Range tombstone fragmenter and read-side aggregator |
//! | [`table_cache`] | Bounded cache of open table readers |
//! | [`config`] | Options and the injected comparator / merge / prefix traits |
//! | [`encoding`] | Byte-stable on-disk serialization substrate |
//!
//! ## Key Guarantees
//!
//! - **Durability** — acknowledged writes reach the WAL before the
//!   memtable; `sync` writes are fsynced.
//! - **Snapshot isolation** — a [`Snapshot`] pins a sequence; reads
//!   through it are repeatable across flushes and compactions.
//! - **Atomic batches** — a [`WriteBatch`] commits with one contiguous
//!   sequence range; concurrent batches never interleave.
//! - **Crash recovery** — the MANIFEST rebuilds the file set, WALs
//!   replay unflushed writes, and new sequences are strictly greater
//!   than anything recovered.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use silexdb::{Db, DbOptions};
//!
//! let mut options = DbOptions::default();
//! options.create_if_missing = true;
//!
//! let db = Db::open("/tmp/my_db", options).unwrap();
//!
//! db.put(b"hello", b"world").unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! db.delete(b"hello").unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), None);
//!
//! // Range scan
//! db.put(b"a", b"1").unwrap();
//! db.put(b"b", b"2").unwrap();
//! let mut iter = db.iter(&Default::default()).unwrap();
//! iter.seek_to_first();
//! while iter.valid() {
//!     println!("{:?} = {:?}", iter.key(), iter.value());
//!     iter.next();
//! }
//!
//! db.close().unwrap();
//! ```

pub mod batch;
pub mod compaction;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod files;
pub mod keys;
pub mod memtable;
pub mod sstable;
pub mod table_cache;
pub mod tombstone;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use config::{
    CompactionFilter, Comparator, CompressionType, DbOptions, MergeOperator, PrefixExtractor,
    ReadOptions, WriteOptions,
};
pub use engine::{Db, DbError, DbIter, DbStats, Snapshot};
pub use keys::SequenceNumber;
