//! # Sorted String Table (SSTable) Module
//!
//! Immutable, disk-backed sorted tables keyed by internal keys
//! (`user_key ∥ (seq << 8 | type)`), with range-tombstone and bloom
//! filter meta blocks.
//!
//! ## Design Overview
//!
//! Entries are grouped into sorted data blocks. A table is immutable
//! once written; newer versions of a key appear in newer tables (or the
//! memtable) with higher sequences. Point deletes, single-deletes, and
//! merge operands are ordinary cells distinguished by their type tag;
//! range tombstones live in a dedicated meta block.
//!
//! ## On-disk layout
//!
//! ```text
//! [HEADER_BYTES]
//! [DATA_BLOCK_LEN_LE][CELLS][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM_LEN_LE][BLOOM_BYTES][BLOOM_CRC32_LE]
//! [RANGE_DEL_LEN_LE][RANGE_DEL_CELLS][RANGE_DEL_CRC32_LE]
//! [PROPS_LEN_LE][PROPS_BYTES][PROPS_CRC32_LE]
//! [METAINDEX_LEN_LE][METAINDEX_BYTES][METAINDEX_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header** — magic, format version, CRC32.
//! - **Data blocks** — concatenated [`cells`](self) in ascending
//!   internal-key order.
//! - **Bloom filter block** — membership filter over user keys.
//! - **Range deletes block** — `(start, end, seq)` tombstone cells.
//! - **Properties block** — comparator name, compression tag, counts,
//!   sequence and key bounds, column family.
//! - **Metaindex / index blocks** — block directory; the index maps the
//!   first internal key of each data block to its handle.
//! - **Footer** — fixed-size trailer locating metaindex and index.
//!
//! Every block is framed `[u32 len][payload][u32 crc32]`.
//!
//! ## Guarantees
//!
//! - Readers are lock-free: the whole file is memory-mapped and blocks
//!   are verified against their CRC before decoding.
//! - The comparator that wrote a table is recorded by name and
//!   validated when the table is opened; a mismatch is
//!   [`SSTableError::IncompatibleFormat`], never silent reordering.
//! - Files are written to a `.tmp` path and renamed on success, so a
//!   crash cannot leave a half-written table behind.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::SstWriter;
pub use iterator::TableIter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{fs::File, io, path::Path};

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::keys::{
    ComparatorRef, InternalKeyComparator, SequenceNumber, ValueType, make_internal_key,
};
use crate::tombstone::{FragmentedRangeTombstones, RangeTombstone};
use crate::wal::compute_crc;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const SST_MAGIC: [u8; 4] = *b"SXST";
const SST_VERSION: u32 = 1;
const SST_BLOOM_FP_RATE: f64 = 0.01;
const SST_DATA_BLOCK_MAX_SIZE: usize = 4096;
const SST_HEADER_SIZE: usize = 12;
const SST_FOOTER_SIZE: usize = 44;
const SST_BLOCK_LEN_SIZE: usize = 4;
const SST_BLOCK_CHECKSUM_SIZE: usize = 4;

const META_BLOOM: &str = "filter.bloom";
const META_PROPERTIES: &str = "meta.properties";
const META_RANGE_DELETES: &str = "meta.range_deletes";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Checksum mismatch on a block, header, or footer.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// The table was written under a different comparator or an
    /// unsupported format version.
    #[error("Incompatible format: {0}")]
    IncompatibleFormat(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Entry types
// ------------------------------------------------------------------------------------------------

/// One decoded point cell: a `(user_key, seq, kind)` triple plus value.
///
/// The common currency between memtable flushes, table iteration, and
/// compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointEntry {
    /// The user key.
    pub user_key: Vec<u8>,

    /// Sequence number of this version.
    pub seq: SequenceNumber,

    /// Record kind.
    pub kind: ValueType,

    /// Value bytes; empty for tombstones.
    pub value: Vec<u8>,
}

impl PointEntry {
    /// Creates a point entry.
    pub fn new(
        user_key: impl Into<Vec<u8>>,
        seq: SequenceNumber,
        kind: ValueType,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            user_key: user_key.into(),
            seq,
            kind,
            value: value.into(),
        }
    }

    /// The encoded internal key of this entry.
    pub fn internal_key(&self) -> Vec<u8> {
        make_internal_key(&self.user_key, self.seq, self.kind)
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Table file header.
#[derive(Debug, Default)]
pub(crate) struct TableHeader {
    /// Magic bytes identifying the format (`b"SXST"`).
    magic: [u8; 4],

    /// Format version.
    version: u32,

    /// CRC32 over `magic ∥ version`.
    header_crc: u32,
}

/// A single cell header inside a data block.
///
/// Followed on disk by `key_len` user-key bytes and `value_len` value
/// bytes. The trailer packs `(seq << 8) | type`.
pub(crate) struct TableCell {
    pub(crate) key_len: u32,
    pub(crate) value_len: u32,
    pub(crate) trailer: u64,
}

/// A range tombstone cell in the range-deletes meta block.
#[derive(Debug, Clone)]
pub(crate) struct RangeTombstoneCell {
    /// Inclusive start user key.
    pub(crate) start_key: Vec<u8>,

    /// Exclusive end user key.
    pub(crate) end_key: Vec<u8>,

    /// Sequence of the deletion.
    pub(crate) seq: u64,
}

/// Table-level properties and statistics.
#[derive(Debug, Clone)]
pub struct TableProperties {
    /// Name of the comparator the table was written under.
    pub comparator_name: String,

    /// Compression tag recorded at build time.
    pub compression: u8,

    /// Column family the table belongs to.
    pub column_family: u32,

    /// Total number of point cells.
    pub entry_count: u64,

    /// Number of point tombstones (deletes + single-deletes).
    pub tombstone_count: u64,

    /// Number of merge operand cells.
    pub merge_count: u64,

    /// Number of range tombstones.
    pub range_tombstone_count: u64,

    /// Smallest sequence present.
    pub smallest_seq: u64,

    /// Largest sequence present.
    pub largest_seq: u64,

    /// Smallest user key present.
    pub smallest_key: Vec<u8>,

    /// Largest user key present.
    pub largest_key: Vec<u8>,
}

/// Index entry pointing at one data block.
pub(crate) struct IndexEntry {
    /// Internal key of the first cell in the block.
    pub(crate) first_key: Vec<u8>,

    /// Location of the block.
    pub(crate) handle: BlockHandle,
}

/// Table footer, fixed-size, at the very end of the file.
pub(crate) struct TableFooter {
    /// Handle of the metaindex block.
    pub(crate) metaindex: BlockHandle,

    /// Handle of the index block.
    pub(crate) index: BlockHandle,

    /// Total file size including this footer.
    pub(crate) total_file_size: u64,

    /// CRC32 over the other footer fields.
    pub(crate) footer_crc32: u32,
}

/// Location of a framed block: offset of its length prefix, and total
/// on-disk size including prefix and checksum.
#[derive(Debug, Clone)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

/// One entry in the metaindex block.
#[derive(Debug)]
pub(crate) struct MetaIndexEntry {
    pub(crate) name: String,
    pub(crate) handle: BlockHandle,
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl encoding::Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_u64(buf, self.offset);
        encoding::put_u64(buf, self.size);
        Ok(())
    }
}

impl encoding::Decode for BlockHandle {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            offset: reader.u64()?,
            size: reader.u64()?,
        })
    }
}

impl encoding::Encode for TableHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_raw(buf, &self.magic);
        encoding::put_u32(buf, self.version);
        encoding::put_u32(buf, self.header_crc);
        Ok(())
    }
}

impl encoding::Decode for TableHeader {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            magic: reader.array::<4>()?,
            version: reader.u32()?,
            header_crc: reader.u32()?,
        })
    }
}

impl encoding::Encode for TableCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_u32(buf, self.key_len);
        encoding::put_u32(buf, self.value_len);
        encoding::put_u64(buf, self.trailer);
        Ok(())
    }
}

impl encoding::Decode for TableCell {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            key_len: reader.u32()?,
            value_len: reader.u32()?,
            trailer: reader.u64()?,
        })
    }
}

impl encoding::Encode for RangeTombstoneCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_bytes(buf, &self.start_key)?;
        encoding::put_bytes(buf, &self.end_key)?;
        encoding::put_u64(buf, self.seq);
        Ok(())
    }
}

impl encoding::Decode for RangeTombstoneCell {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            start_key: reader.bytes()?,
            end_key: reader.bytes()?,
            seq: reader.u64()?,
        })
    }
}

impl encoding::Encode for TableProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_str(buf, &self.comparator_name)?;
        encoding::put_u8(buf, self.compression);
        encoding::put_u32(buf, self.column_family);
        encoding::put_u64(buf, self.entry_count);
        encoding::put_u64(buf, self.tombstone_count);
        encoding::put_u64(buf, self.merge_count);
        encoding::put_u64(buf, self.range_tombstone_count);
        encoding::put_u64(buf, self.smallest_seq);
        encoding::put_u64(buf, self.largest_seq);
        encoding::put_bytes(buf, &self.smallest_key)?;
        encoding::put_bytes(buf, &self.largest_key)?;
        Ok(())
    }
}

impl encoding::Decode for TableProperties {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            comparator_name: reader.string()?,
            compression: reader.u8()?,
            column_family: reader.u32()?,
            entry_count: reader.u64()?,
            tombstone_count: reader.u64()?,
            merge_count: reader.u64()?,
            range_tombstone_count: reader.u64()?,
            smallest_seq: reader.u64()?,
            largest_seq: reader.u64()?,
            smallest_key: reader.bytes()?,
            largest_key: reader.bytes()?,
        })
    }
}

impl encoding::Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_bytes(buf, &self.first_key)?;
        self.handle.encode_to(buf)
    }
}

impl encoding::Decode for IndexEntry {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            first_key: reader.bytes()?,
            handle: BlockHandle::decode(reader)?,
        })
    }
}

impl encoding::Encode for MetaIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_str(buf, &self.name)?;
        self.handle.encode_to(buf)
    }
}

impl encoding::Decode for MetaIndexEntry {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            name: reader.string()?,
            handle: BlockHandle::decode(reader)?,
        })
    }
}

impl encoding::Encode for TableFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.metaindex.encode_to(buf)?;
        self.index.encode_to(buf)?;
        encoding::put_u64(buf, self.total_file_size);
        encoding::put_u32(buf, self.footer_crc32);
        Ok(())
    }
}

impl encoding::Decode for TableFooter {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            metaindex: BlockHandle::decode(reader)?,
            index: BlockHandle::decode(reader)?,
            total_file_size: reader.u64()?,
            footer_crc32: reader.u32()?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// SSTable — immutable reader
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable sorted table.
pub struct SSTable {
    /// File number assigned by the version set.
    pub file_number: u64,

    /// Memory-mapped file bytes.
    pub(crate) mmap: Mmap,

    /// Bloom filter bytes.
    pub(crate) bloom: Vec<u8>,

    /// Table-level properties.
    pub properties: TableProperties,

    /// Decoded range tombstone cells.
    pub(crate) range_deletes: Vec<RangeTombstoneCell>,

    /// Block index.
    pub(crate) index: Vec<IndexEntry>,

    /// Footer with integrity data.
    pub(crate) footer: TableFooter,

    /// Internal-key comparator matching the table's recorded comparator.
    pub(crate) icmp: InternalKeyComparator,
}

impl SSTable {
    /// Opens a table, verifies header/footer integrity and the
    /// comparator identity, and loads all meta blocks.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`; memory-safe because tables are
    /// never written after creation, the map is read-only, and all block
    /// boundaries are verified before slicing.
    pub fn open(
        path: impl AsRef<Path>,
        file_number: u64,
        comparator: ComparatorRef,
    ) -> Result<Self, SSTableError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let file_len = mmap.len();
        if file_len < SST_HEADER_SIZE + SST_FOOTER_SIZE {
            return Err(SSTableError::Internal("file too small".into()));
        }

        // Header: verify CRC over magic ∥ version, then identity.
        let (header, _) = encoding::decode_from_slice::<TableHeader>(&mmap[..SST_HEADER_SIZE])?;
        let computed = compute_crc(&[&header.magic, &header.version.to_le_bytes()]);
        if header.header_crc != computed {
            return Err(SSTableError::ChecksumMismatch);
        }
        if header.magic != SST_MAGIC {
            return Err(SSTableError::IncompatibleFormat("bad magic".into()));
        }
        if header.version != SST_VERSION {
            return Err(SSTableError::IncompatibleFormat(format!(
                "unsupported table version {}",
                header.version
            )));
        }

        // Footer: CRC over the fields with the checksum zeroed.
        let footer_start = file_len - SST_FOOTER_SIZE;
        let (mut footer, _) = encoding::decode_from_slice::<TableFooter>(&mmap[footer_start..])?;
        let stored_footer_crc = footer.footer_crc32;
        footer.footer_crc32 = 0;
        let footer_bytes = encoding::encode_to_vec(&footer)?;
        if compute_crc(&[&footer_bytes]) != stored_footer_crc {
            return Err(SSTableError::ChecksumMismatch);
        }
        footer.footer_crc32 = stored_footer_crc;

        // Metaindex → bloom / properties / range deletes.
        let metaindex_data = Self::read_block_bytes(&mmap, &footer.metaindex)?;
        let (meta_entries, _) = encoding::decode_vec::<MetaIndexEntry>(&metaindex_data)?;

        let mut bloom_handle: Option<BlockHandle> = None;
        let mut properties_handle: Option<BlockHandle> = None;
        let mut range_deletes_handle: Option<BlockHandle> = None;

        for entry in meta_entries {
            match entry.name.as_str() {
                META_BLOOM => bloom_handle = Some(entry.handle),
                META_PROPERTIES => properties_handle = Some(entry.handle),
                META_RANGE_DELETES => range_deletes_handle = Some(entry.handle),
                other => {
                    return Err(SSTableError::Internal(format!(
                        "unknown metaindex entry {other:?}"
                    )));
                }
            }
        }

        let bloom = match bloom_handle {
            Some(handle) => Self::read_block_bytes(&mmap, &handle)?,
            None => Vec::new(),
        };

        let properties = match properties_handle {
            Some(handle) => {
                let bytes = Self::read_block_bytes(&mmap, &handle)?;
                let (props, _) = encoding::decode_from_slice::<TableProperties>(&bytes)?;
                props
            }
            None => return Err(SSTableError::Internal("missing properties block".into())),
        };

        if properties.comparator_name != comparator.name() {
            return Err(SSTableError::IncompatibleFormat(format!(
                "table written with comparator {:?}, opened with {:?}",
                properties.comparator_name,
                comparator.name()
            )));
        }

        let range_deletes = match range_deletes_handle {
            Some(handle) => {
                let bytes = Self::read_block_bytes(&mmap, &handle)?;
                let (cells, _) = encoding::decode_vec::<RangeTombstoneCell>(&bytes)?;
                cells
            }
            None => Vec::new(),
        };

        let index_bytes = Self::read_block_bytes(&mmap, &footer.index)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(&index_bytes)?;

        Ok(Self {
            file_number,
            mmap,
            bloom,
            properties,
            range_deletes,
            index,
            footer,
            icmp: InternalKeyComparator::new(comparator),
        })
    }

    /// The on-disk file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.footer.total_file_size
    }

    /// `true` unless the bloom filter definitively excludes `user_key`.
    pub fn bloom_may_contain(&self, user_key: &[u8]) -> bool {
        if self.bloom.is_empty() {
            return true;
        }
        match Bloom::from_slice(&self.bloom) {
            Ok(bloom) => bloom.check(user_key),
            Err(_) => true, // corrupted bloom → cannot exclude
        }
    }

    /// The raw range tombstones stored in this table.
    pub fn range_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_deletes
            .iter()
            .map(|cell| RangeTombstone {
                start: cell.start_key.clone(),
                end: cell.end_key.clone(),
                seq: cell.seq,
            })
            .collect()
    }

    /// A coalesced tombstone view for the read path.
    pub fn fragmented_range_tombstones(&self) -> FragmentedRangeTombstones {
        FragmentedRangeTombstones::build(&self.range_tombstones(), self.icmp.user_comparator())
    }

    /// Collects all versions of `user_key` with `seq ≤ upper_seq`,
    /// newest first. Range tombstones are **not** applied here; callers
    /// resolve them through the aggregator.
    ///
    /// Bloom-gated: a definite bloom miss skips all block reads.
    pub fn point_versions(
        &self,
        user_key: &[u8],
        upper_seq: SequenceNumber,
    ) -> Result<Vec<PointEntry>, SSTableError> {
        if !self.bloom_may_contain(user_key) {
            return Ok(Vec::new());
        }
        if self.index.is_empty() {
            return Ok(Vec::new());
        }

        // Seek to the newest possible version of the key.
        let target = make_internal_key(user_key, upper_seq, ValueType::RangeDeletion);
        let mut iter = TableIter::new(self)?;
        iter.seek(&target)?;

        let mut versions = Vec::new();
        while let Some(entry) = iter.current() {
            if self.icmp.compare_user(&entry.user_key, user_key) != std::cmp::Ordering::Equal {
                break;
            }
            if entry.seq <= upper_seq {
                versions.push(entry.clone());
            }
            iter.next()?;
        }
        Ok(versions)
    }

    /// Reads a framed block and verifies its checksum.
    pub(crate) fn read_block_bytes(
        mmap: &Mmap,
        handle: &BlockHandle,
    ) -> Result<Vec<u8>, SSTableError> {
        let start = usize::try_from(handle.offset)
            .map_err(|_| SSTableError::Internal("block offset exceeds addressable range".into()))?;
        let size = usize::try_from(handle.size)
            .map_err(|_| SSTableError::Internal("block size exceeds addressable range".into()))?;

        if size < SST_BLOCK_LEN_SIZE + SST_BLOCK_CHECKSUM_SIZE || start + size > mmap.len() {
            return Err(SSTableError::Internal("block out of range".into()));
        }

        let mut cursor = start;

        let len_bytes: [u8; SST_BLOCK_LEN_SIZE] = mmap[cursor..cursor + SST_BLOCK_LEN_SIZE]
            .try_into()
            .map_err(|_| SSTableError::Internal("short block length".into()))?;
        let content_len = u32::from_le_bytes(len_bytes) as usize;
        cursor += SST_BLOCK_LEN_SIZE;

        if content_len != size - SST_BLOCK_LEN_SIZE - SST_BLOCK_CHECKSUM_SIZE
            || cursor + content_len + SST_BLOCK_CHECKSUM_SIZE > mmap.len()
        {
            return Err(SSTableError::Internal("block out of range".into()));
        }

        let content = &mmap[cursor..cursor + content_len];
        cursor += content_len;

        let checksum_bytes: [u8; SST_BLOCK_CHECKSUM_SIZE] = mmap
            [cursor..cursor + SST_BLOCK_CHECKSUM_SIZE]
            .try_into()
            .map_err(|_| SSTableError::Internal("short checksum".into()))?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        if compute_crc(&[content]) != stored_checksum {
            return Err(SSTableError::ChecksumMismatch);
        }

        Ok(content.to_vec())
    }

    /// Locates the index entry whose block may contain `target`
    /// (an encoded internal key) via binary search on first keys.
    pub(crate) fn find_block_for_key(&self, target: &[u8]) -> usize {
        if self.index.is_empty() {
            return 0;
        }
        match self
            .index
            .binary_search_by(|entry| self.icmp.compare(&entry.first_key, target))
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("file_number", &self.file_number)
            .field("entries", &self.properties.entry_count)
            .field("size", &self.footer.total_file_size)
            .finish_non_exhaustive()
    }
}
