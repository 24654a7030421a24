//! SSTable writer — builds a complete table file from a sorted stream.
//!
//! [`SstWriter`] accepts point entries in **strictly ascending internal
//! key order** plus a list of range tombstones, and writes header, data
//! blocks, bloom filter, range-tombstone block, properties, metaindex,
//! index, and footer. Out-of-order or duplicate internal keys are
//! rejected — correct ordering across levels depends on it.
//!
//! # Atomicity
//!
//! 1. Write everything to `<path>.tmp`.
//! 2. Flush and sync the file.
//! 3. Rename `<path>.tmp` → `<path>`.
//!
//! A crash cannot produce a partially-written table at the final path.

use std::{
    fs::{File, OpenOptions, rename},
    io::{BufWriter, Seek, Write},
    mem,
    path::Path,
};

use bloomfilter::Bloom;
use tracing::{debug, warn};

use crate::config::CompressionType;
use crate::encoding;
use crate::keys::{ComparatorRef, InternalKeyComparator, ValueType, pack_trailer};
use crate::tombstone::RangeTombstone;
use crate::wal::compute_crc;

use super::{
    BlockHandle, IndexEntry, META_BLOOM, META_PROPERTIES, META_RANGE_DELETES, MetaIndexEntry,
    PointEntry, RangeTombstoneCell, SST_BLOCK_CHECKSUM_SIZE, SST_BLOCK_LEN_SIZE,
    SST_BLOOM_FP_RATE, SST_DATA_BLOCK_MAX_SIZE, SST_FOOTER_SIZE, SST_MAGIC, SST_VERSION,
    SSTableError, TableCell, TableFooter, TableHeader, TableProperties,
};

// ------------------------------------------------------------------------------------------------
// BuildStats
// ------------------------------------------------------------------------------------------------

/// Statistics gathered while streaming entries, folded into the
/// properties block at the end of construction.
struct BuildStats {
    entry_count: u64,
    tombstone_count: u64,
    merge_count: u64,
    smallest_seq: u64,
    largest_seq: u64,
    smallest_key: Option<Vec<u8>>,
    largest_key: Option<Vec<u8>>,
}

impl BuildStats {
    fn new() -> Self {
        Self {
            entry_count: 0,
            tombstone_count: 0,
            merge_count: 0,
            smallest_seq: u64::MAX,
            largest_seq: 0,
            smallest_key: None,
            largest_key: None,
        }
    }

    fn track_seq(&mut self, seq: u64) {
        self.smallest_seq = self.smallest_seq.min(seq);
        self.largest_seq = self.largest_seq.max(seq);
    }

    /// Widens the key bounds to include `key`.
    fn track_key(&mut self, cmp: &ComparatorRef, key: &[u8]) {
        match &self.smallest_key {
            Some(cur) if cmp.compare(key, cur) == std::cmp::Ordering::Less => {
                self.smallest_key = Some(key.to_vec());
            }
            None => self.smallest_key = Some(key.to_vec()),
            _ => {}
        }
        match &self.largest_key {
            Some(cur) if cmp.compare(key, cur) == std::cmp::Ordering::Greater => {
                self.largest_key = Some(key.to_vec());
            }
            None => self.largest_key = Some(key.to_vec()),
            _ => {}
        }
    }

    fn into_properties(
        self,
        comparator_name: String,
        compression: CompressionType,
        column_family: u32,
        range_count: usize,
    ) -> TableProperties {
        TableProperties {
            comparator_name,
            compression: compression as u8,
            column_family,
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            merge_count: self.merge_count,
            range_tombstone_count: range_count as u64,
            smallest_seq: if self.smallest_seq == u64::MAX {
                0
            } else {
                self.smallest_seq
            },
            largest_seq: self.largest_seq,
            smallest_key: self.smallest_key.unwrap_or_default(),
            largest_key: self.largest_key.unwrap_or_default(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Writes a checksummed block: `[len_le (4 B)][data][crc32_le (4 B)]`.
///
/// Returns the [`BlockHandle`] locating the whole frame.
fn write_checksummed_block(
    writer: &mut (impl Write + Seek),
    data: &[u8],
) -> Result<BlockHandle, SSTableError> {
    let offset = writer.stream_position()?;
    let len = u32::try_from(data.len())
        .map_err(|_| SSTableError::Internal("block exceeds u32 length".into()))?;

    let checksum = compute_crc(&[data]);

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&checksum.to_le_bytes())?;

    Ok(BlockHandle {
        offset,
        size: (SST_BLOCK_LEN_SIZE + data.len() + SST_BLOCK_CHECKSUM_SIZE) as u64,
    })
}

/// Writes the table header with its CRC32.
fn write_table_header(writer: &mut impl Write) -> Result<(), SSTableError> {
    let header = TableHeader {
        magic: SST_MAGIC,
        version: SST_VERSION,
        header_crc: compute_crc(&[&SST_MAGIC, &SST_VERSION.to_le_bytes()]),
    };
    let header_bytes = encoding::encode_to_vec(&header)?;
    writer.write_all(&header_bytes)?;
    Ok(())
}

/// Flushes the current data-block buffer, pushing a new index entry.
fn flush_data_block(
    writer: &mut (impl Write + Seek),
    current_block: &mut Vec<u8>,
    block_first_key: &mut Option<Vec<u8>>,
    index_entries: &mut Vec<IndexEntry>,
) -> Result<(), SSTableError> {
    let data = mem::take(current_block);
    let handle = write_checksummed_block(writer, &data)?;

    let first_key = block_first_key
        .take()
        .ok_or_else(|| SSTableError::Internal("data block without first key".into()))?;

    index_entries.push(IndexEntry { first_key, handle });
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// SstWriter
// ------------------------------------------------------------------------------------------------

/// Builds a complete SSTable file on disk.
pub struct SstWriter<P: AsRef<Path>> {
    path: P,
    comparator: ComparatorRef,
    compression: CompressionType,
    column_family: u32,
}

impl<P: AsRef<Path>> SstWriter<P> {
    /// Creates a writer targeting the given output path.
    pub fn new(path: P, comparator: ComparatorRef, compression: CompressionType) -> Self {
        Self {
            path,
            comparator,
            compression,
            column_family: 0,
        }
    }

    /// Sets the column family recorded in the properties block.
    pub fn column_family(mut self, cf: u32) -> Self {
        self.column_family = cf;
        self
    }

    /// Consumes a sorted entry stream and writes a complete table.
    ///
    /// # Parameters
    ///
    /// - `entries` — point entries in strictly ascending internal-key
    ///   order.
    /// - `entry_count_hint` — expected entry count; sizes the bloom
    ///   filter.
    /// - `range_tombstones` — tombstones sorted by start key.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::Internal`] when both inputs are empty, or on an
    ///   ordering violation.
    /// - I/O and encoding errors from writing.
    pub fn build(
        self,
        entries: impl Iterator<Item = PointEntry>,
        entry_count_hint: usize,
        range_tombstones: Vec<RangeTombstone>,
    ) -> Result<(), SSTableError> {
        let mut entries = entries.peekable();

        if entries.peek().is_none() && range_tombstones.is_empty() {
            return Err(SSTableError::Internal(
                "empty inputs cannot build an SSTable".into(),
            ));
        }

        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("sst.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(&mut file);

        // 1. Header.
        write_table_header(&mut writer)?;

        // 2. Data blocks + bloom + stats.
        let mut bloom: Bloom<[u8]> =
            Bloom::new_for_fp_rate(entry_count_hint.max(1), SST_BLOOM_FP_RATE)
                .map_err(|e| SSTableError::Internal(e.to_string()))?;

        let icmp = InternalKeyComparator::new(self.comparator.clone());
        let mut stats = BuildStats::new();
        let mut index_entries = Vec::new();
        let mut current_block = Vec::<u8>::new();
        let mut block_first_key: Option<Vec<u8>> = None;
        let mut last_internal_key: Option<Vec<u8>> = None;

        for entry in entries {
            let internal_key = entry.internal_key();

            if let Some(last) = &last_internal_key
                && icmp.compare(&internal_key, last) != std::cmp::Ordering::Greater
            {
                return Err(SSTableError::Internal(
                    "entries not in strictly ascending internal-key order".into(),
                ));
            }

            stats.entry_count += 1;
            if entry.kind.is_point_tombstone() {
                stats.tombstone_count += 1;
            }
            if entry.kind == ValueType::Merge {
                stats.merge_count += 1;
            }
            stats.track_seq(entry.seq);
            stats.track_key(&self.comparator, &entry.user_key);

            if block_first_key.is_none() {
                block_first_key = Some(internal_key.clone());
            }
            bloom.set(&entry.user_key);

            let cell = TableCell {
                key_len: entry.user_key.len() as u32,
                value_len: entry.value.len() as u32,
                trailer: pack_trailer(entry.seq, entry.kind),
            };
            encoding::Encode::encode_to(&cell, &mut current_block)?;
            current_block.extend_from_slice(&entry.user_key);
            current_block.extend_from_slice(&entry.value);

            last_internal_key = Some(internal_key);

            if current_block.len() >= SST_DATA_BLOCK_MAX_SIZE {
                flush_data_block(
                    &mut writer,
                    &mut current_block,
                    &mut block_first_key,
                    &mut index_entries,
                )?;
            }
        }

        if !current_block.is_empty() {
            flush_data_block(
                &mut writer,
                &mut current_block,
                &mut block_first_key,
                &mut index_entries,
            )?;
        }

        // 3. Bloom filter block.
        let bloom_handle = write_checksummed_block(&mut writer, bloom.as_slice())?;

        // 4. Range tombstone block (key bounds widen to tombstone spans).
        let mut tombstone_cells = Vec::with_capacity(range_tombstones.len());
        for t in &range_tombstones {
            stats.track_seq(t.seq);
            stats.track_key(&self.comparator, &t.start);
            stats.track_key(&self.comparator, &t.end);
            tombstone_cells.push(RangeTombstoneCell {
                start_key: t.start.clone(),
                end_key: t.end.clone(),
                seq: t.seq,
            });
        }
        let mut tombstone_bytes = Vec::new();
        encoding::encode_vec(&tombstone_cells, &mut tombstone_bytes)?;
        let tombstones_handle = write_checksummed_block(&mut writer, &tombstone_bytes)?;

        // 5. Properties block.
        let properties = stats.into_properties(
            self.comparator.name().to_string(),
            self.compression,
            self.column_family,
            range_tombstones.len(),
        );
        let props_bytes = encoding::encode_to_vec(&properties)?;
        let props_handle = write_checksummed_block(&mut writer, &props_bytes)?;

        // 6. Metaindex block.
        let meta_entries = vec![
            MetaIndexEntry {
                name: META_BLOOM.to_string(),
                handle: bloom_handle,
            },
            MetaIndexEntry {
                name: META_PROPERTIES.to_string(),
                handle: props_handle,
            },
            MetaIndexEntry {
                name: META_RANGE_DELETES.to_string(),
                handle: tombstones_handle,
            },
        ];
        let mut meta_bytes = Vec::new();
        encoding::encode_vec(&meta_entries, &mut meta_bytes)?;
        let metaindex_handle = write_checksummed_block(&mut writer, &meta_bytes)?;

        // 7. Index block.
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&index_entries, &mut index_bytes)?;
        let index_handle = write_checksummed_block(&mut writer, &index_bytes)?;

        // 8. Flush buffered data before the footer reads the file length.
        writer.flush()?;
        drop(writer);

        // 9. Footer + final sync.
        let current_pos = file.metadata()?.len();
        let mut footer = TableFooter {
            metaindex: metaindex_handle,
            index: index_handle,
            total_file_size: current_pos + SST_FOOTER_SIZE as u64,
            footer_crc32: 0,
        };
        let footer_bytes = encoding::encode_to_vec(&footer)?;
        footer.footer_crc32 = compute_crc(&[&footer_bytes]);
        let footer_bytes = encoding::encode_to_vec(&footer)?;

        file.write_all(&footer_bytes)?;
        file.sync_all()?;

        rename(&tmp_path, final_path)?;
        sync_parent_dir(final_path);

        debug!(
            path = %final_path.display(),
            entries = properties.entry_count,
            range_tombstones = properties.range_tombstone_count,
            "SSTable built"
        );

        Ok(())
    }
}

/// fsyncs the directory containing `path` so the rename is durable.
fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent() else { return };
    match File::open(parent) {
        Ok(dir) => {
            if let Err(e) = dir.sync_all() {
                warn!(dir = %parent.display(), error = %e, "directory fsync failed");
            }
        }
        Err(e) => warn!(dir = %parent.display(), error = %e, "directory open for fsync failed"),
    }
}
