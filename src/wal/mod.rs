//! # Write-Ahead Log
//!
//! A durable, append-only, generic framed log. The same framing backs
//! two kinds of files: `<n>.log` write-ahead logs (records are
//! [`WriteBatch`](crate::batch::WriteBatch) bytes) and `MANIFEST-<n>`
//! descriptors (records are version edits).
//!
//! ## On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header** — a [`WalHeader`] followed by a 4-byte CRC32. It carries
//!   the file number, which must match the number embedded in the file
//!   name; recovery orders logs by that number.
//! - **Record** — a 4-byte little-endian length prefix, the serialized
//!   record bytes, and a CRC32 computed over `len || record_bytes`.
//!
//! ## Durability
//!
//! [`Wal::append`] buffers into the OS; durability requires an explicit
//! [`Wal::sync`] (the engine calls it for `WriteOptions { sync: true }`
//! and at every MANIFEST edit).
//!
//! ## Corruption handling
//!
//! Replay verifies every checksum. A mismatch or truncated tail yields
//! an error item from the iterator — never a panic — and the caller
//! decides whether to stop (WAL tail after a crash) or fail hard
//! (MANIFEST corruption).

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, EncodingError};
use crate::files;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Unexpected end-of-file during read.
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// Log header failed integrity validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every log file.
#[derive(Debug)]
pub struct WalHeader {
    /// Magic constant identifying silexdb log files (`b"SXLG"`).
    magic: [u8; 4],

    /// Log format version.
    version: u32,

    /// Maximum record size (in bytes).
    max_record_size: u32,

    /// The file number embedded in the file name.
    file_number: u64,
}

impl WalHeader {
    /// Expected 4-byte magic constant.
    pub const MAGIC: [u8; 4] = *b"SXLG";

    /// Current supported version number.
    pub const VERSION: u32 = 1;

    /// Default maximum record size (8 MiB).
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 8 * 1024 * 1024;

    /// Encoded size of the header in bytes (without the trailing CRC).
    ///
    /// Layout: `magic(4) + version(4) + max_record_size(4) + file_number(8)` = 20.
    pub const ENCODED_SIZE: usize = 4 + 4 + 4 + 8;

    /// Total on-disk size of the header including its trailing CRC32.
    pub const HEADER_DISK_SIZE: usize = Self::ENCODED_SIZE + U32_SIZE;

    fn new(max_record_size: u32, file_number: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
            file_number,
        }
    }
}

impl encoding::Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_raw(buf, &self.magic);
        encoding::put_u32(buf, self.version);
        encoding::put_u32(buf, self.max_record_size);
        encoding::put_u64(buf, self.file_number);
        Ok(())
    }
}

impl encoding::Decode for WalHeader {
    fn decode(reader: &mut encoding::Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            magic: reader.array::<4>()?,
            version: reader.u32()?,
            max_record_size: reader.u32()?,
            file_number: reader.u64()?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Record trait
// ------------------------------------------------------------------------------------------------

/// Trait for record types that can be written to and read from a log.
pub trait WalRecord: encoding::Encode + encoding::Decode + std::fmt::Debug + Send + Sync {}
impl<T> WalRecord for T where T: encoding::Encode + encoding::Decode + std::fmt::Debug + Send + Sync {}

// ------------------------------------------------------------------------------------------------
// WAL core
// ------------------------------------------------------------------------------------------------

/// A generic, thread-safe framed append-only log.
///
/// See the [module-level documentation](self) for format and guarantees.
#[derive(Debug)]
pub struct Wal<T: WalRecord> {
    /// Thread-safe file handle.
    inner_file: Arc<Mutex<File>>,

    /// Path to the log file on disk.
    path: PathBuf,

    /// Persistent header with metadata and integrity info.
    header: WalHeader,

    /// Marker associating this log with the record type `T`.
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalRecord> Wal<T> {
    /// Opens or creates a log file at the given path.
    ///
    /// The file number is parsed from the name (`<n>.log` or
    /// `MANIFEST-<n>`); an existing header must agree with it.
    pub fn open<P: AsRef<Path>>(path: P, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let path_ref = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        let file_number = files::parse_log_number(path_ref)
            .ok_or_else(|| WalError::Internal("log file name carries no file number".into()))?;

        let header = if file.metadata()?.len() == 0 {
            let header = WalHeader::new(
                max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE),
                file_number,
            );

            write_header(&mut file, &header)?;
            file.sync_all()?;

            info!(path = %path_ref.display(), number = file_number, "log created with new header");
            header
        } else {
            file.seek(SeekFrom::Start(0))?;
            let header = read_and_validate_header(&mut file)?;

            if header.file_number != file_number {
                return Err(WalError::InvalidHeader("file number mismatch".into()));
            }

            debug!(
                path = %path_ref.display(),
                max_record_size = header.max_record_size,
                number = header.file_number,
                "log header validated"
            );
            header
        };

        Ok(Self {
            inner_file: Arc::new(Mutex::new(file)),
            path: path_ref.to_path_buf(),
            header,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Appends a single record.
    ///
    /// The record is written as `[u32 len LE][record_bytes][u32 crc32 LE]`
    /// with the CRC computed over `len || record_bytes`. Returns the byte
    /// offset at which the record starts.
    ///
    /// Durability requires a subsequent [`sync`](Self::sync).
    pub fn append(&self, record: &T) -> Result<u64, WalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        self.append_bytes(&record_bytes)
    }

    /// Appends pre-serialized record bytes (the WriteBatch fast path).
    pub fn append_bytes(&self, record_bytes: &[u8]) -> Result<u64, WalError> {
        let record_len = u32::try_from(record_bytes.len())
            .map_err(|_| WalError::RecordTooLarge(record_bytes.len()))?;

        if record_len > self.header.max_record_size {
            return Err(WalError::RecordTooLarge(record_len as usize));
        }

        let len_bytes = record_len.to_le_bytes();
        let checksum = compute_crc(&[&len_bytes, record_bytes]);

        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        let offset = guard.metadata()?.len();

        guard.write_all(&len_bytes)?;
        guard.write_all(record_bytes)?;
        guard.write_all(&checksum.to_le_bytes())?;

        trace!(
            offset,
            len = record_len,
            crc = format_args!("{checksum:08x}"),
            "log record appended"
        );
        Ok(offset)
    }

    /// Flushes all appended records to durable storage.
    pub fn sync(&self) -> Result<(), WalError> {
        let guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.sync_all()?;
        Ok(())
    }

    /// Returns an iterator that replays all records in order.
    ///
    /// Each item is either a decoded record or the error encountered at
    /// that position; iteration past a framing error is not attempted.
    pub fn replay_iter(&self) -> Result<WalIter<T>, WalError> {
        debug!(path = %self.path.display(), "log replay started");

        Ok(WalIter {
            file: Arc::clone(&self.inner_file),
            offset: WalHeader::HEADER_DISK_SIZE as u64,
            max_record_size: self.header.max_record_size as usize,
            _phantom: std::marker::PhantomData,
        })
    }

    /// The path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file number parsed from the name and stored in the header.
    pub fn file_number(&self) -> u64 {
        self.header.file_number
    }

    /// The current on-disk file size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        let guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        Ok(guard.metadata()?.len())
    }
}

impl<T: WalRecord> Drop for Wal<T> {
    fn drop(&mut self) {
        match self.inner_file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!(path = %self.path.display(), error = %e, "log sync failed on drop");
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_all() {
                    error!(path = %self.path.display(), error = %e, "log sync failed on drop (poisoned lock)");
                } else {
                    warn!(path = %self.path.display(), "log recovered and synced after poisoned lock");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming replay iterator.
///
/// Reads records sequentially and yields decoded `T` values. Holds an
/// `Arc` on the file handle, so it can outlive the [`Wal`] that created
/// it, and seeks to its own logical offset before each read so that
/// concurrent appenders cannot disturb it.
pub struct WalIter<T: WalRecord> {
    /// Shared file handle protected by a mutex.
    file: Arc<Mutex<File>>,

    /// Current byte offset within the log file.
    offset: u64,

    /// Maximum allowed record size.
    max_record_size: usize,

    /// Marker associating this iterator with the record type `T`.
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalRecord> std::fmt::Debug for WalIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIter")
            .field("offset", &self.offset)
            .field("max_record_size", &self.max_record_size)
            .finish_non_exhaustive()
    }
}

impl<T: WalRecord> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Lock only for the duration of one record read.
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return Some(Err(WalError::Internal("Mutex poisoned".into()))),
        };

        if let Err(e) = guard.seek(SeekFrom::Start(self.offset)) {
            return Some(Err(WalError::Io(e)));
        }

        // Length prefix.
        let mut len_bytes = [0u8; U32_SIZE];
        match guard.read_exact(&mut len_bytes) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!(offset = self.offset, "log replay reached end of file");
                return None;
            }
            Err(e) => return Some(Err(WalError::Io(e))),
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Some(Err(WalError::RecordTooLarge(record_len)));
        }

        // Record bytes.
        let mut record_bytes = vec![0u8; record_len];
        if let Err(e) = guard.read_exact(&mut record_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(
                    offset = self.offset,
                    len = record_len,
                    "log truncated record (partial payload)"
                );
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }

        // Stored checksum.
        let mut checksum_bytes = [0u8; U32_SIZE];
        if let Err(e) = guard.read_exact(&mut checksum_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(
                    offset = self.offset,
                    len = record_len,
                    "log truncated record (partial checksum)"
                );
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        if let Ok(pos) = guard.stream_position() {
            self.offset = pos;
        }

        if let Err(e) = verify_crc(&[&len_bytes, &record_bytes], stored_checksum) {
            warn!(
                offset = self.offset,
                len = record_len,
                "log record checksum mismatch"
            );
            return Some(Err(e));
        }

        match encoding::decode_from_slice::<T>(&record_bytes) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => Some(Err(WalError::Encoding(e))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Header I/O helpers
// ------------------------------------------------------------------------------------------------

/// Writes a [`WalHeader`] followed by its CRC32 checksum.
fn write_header<W: Write>(writer: &mut W, header: &WalHeader) -> Result<(), WalError> {
    let header_bytes = encoding::encode_to_vec(header)?;
    let checksum = compute_crc(&[&header_bytes]);

    writer.write_all(&header_bytes)?;
    writer.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

/// Reads and validates a [`WalHeader`] from the current file position.
///
/// Checks CRC, magic, and version; the caller validates `file_number`
/// against the name.
fn read_and_validate_header<R: Read>(reader: &mut R) -> Result<WalHeader, WalError> {
    let mut header_bytes = vec![0u8; WalHeader::ENCODED_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let mut checksum_bytes = [0u8; U32_SIZE];
    reader.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    verify_crc(&[&header_bytes], stored_checksum)
        .map_err(|_| WalError::InvalidHeader("header checksum mismatch".into()))?;

    let (header, _) = encoding::decode_from_slice::<WalHeader>(&header_bytes)?;

    if header.magic != WalHeader::MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    if header.version != WalHeader::VERSION {
        return Err(WalError::InvalidHeader(format!(
            "unsupported version {}",
            header.version
        )));
    }

    Ok(header)
}

// ------------------------------------------------------------------------------------------------
// CRC helpers
// ------------------------------------------------------------------------------------------------

/// Computes a CRC32 checksum over one or more byte slices.
pub(crate) fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Verifies that the CRC32 over the given byte slices matches `expected`.
fn verify_crc(parts: &[&[u8]], expected: u32) -> Result<(), WalError> {
    let computed = compute_crc(parts);
    if computed != expected {
        return Err(WalError::ChecksumMismatch);
    }
    Ok(())
}
