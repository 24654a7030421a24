//! Database file naming.
//!
//! All engine files live flat in the database root directory:
//!
//! | Name                | Contents                                        |
//! |---------------------|-------------------------------------------------|
//! | `CURRENT`           | Name of the active MANIFEST, newline-terminated |
//! | `MANIFEST-<nnnnnn>` | Framed log of version-edit records              |
//! | `<nnnnnn>.log`      | Write-ahead log                                 |
//! | `<nnnnnn>.sst`      | Sorted table                                    |
//! | `LOCK`              | Advisory lock preventing concurrent opens       |
//!
//! File numbers are zero-padded 6-digit decimals allocated from the
//! version set's monotonic counter, so lexicographic and numeric order
//! agree for the zero-padded range.


use std::path::{Path, PathBuf};

/// Name of the CURRENT pointer file.
pub const CURRENT_FILE: &str = "CURRENT";

/// Name of the advisory lock file.
pub const LOCK_FILE: &str = "LOCK";

/// The kind of a parsed database file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `CURRENT`
    Current,

    /// `LOCK`
    Lock,

    /// `MANIFEST-<n>`
    Manifest(u64),

    /// `<n>.log`
    WriteAheadLog(u64),

    /// `<n>.sst`
    Table(u64),

    /// `<n>.sst.tmp` or `MANIFEST-<n>.tmp` — in-flight atomic writes.
    Temp(u64),
}

/// `<n>.log` path under `dir`.
pub fn log_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

/// `<n>.sst` path under `dir`.
pub fn table_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.sst"))
}

/// `MANIFEST-<n>` path under `dir`.
pub fn manifest_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(manifest_file_name(number))
}

/// `MANIFEST-<n>` file name.
pub fn manifest_file_name(number: u64) -> String {
    format!("MANIFEST-{number:06}")
}

/// `CURRENT` path under `dir`.
pub fn current_file_path(dir: &Path) -> PathBuf {
    dir.join(CURRENT_FILE)
}

/// `LOCK` path under `dir`.
pub fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

/// Classifies a file name within the database directory.
///
/// Returns `None` for names the engine does not own.
pub fn parse_file_name(name: &str) -> Option<FileKind> {
    if name == CURRENT_FILE {
        return Some(FileKind::Current);
    }
    if name == LOCK_FILE {
        return Some(FileKind::Lock);
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        if let Some(num) = rest.strip_suffix(".tmp") {
            return num.parse().ok().map(FileKind::Temp);
        }
        return rest.parse().ok().map(FileKind::Manifest);
    }
    if let Some(num) = name.strip_suffix(".log") {
        return num.parse().ok().map(FileKind::WriteAheadLog);
    }
    if let Some(num) = name.strip_suffix(".sst.tmp") {
        return num.parse().ok().map(FileKind::Temp);
    }
    if let Some(num) = name.strip_suffix(".sst") {
        return num.parse().ok().map(FileKind::Table);
    }
    None
}

/// Extracts the file number embedded in a WAL or MANIFEST path, used by
/// the log layer to validate headers against names.
pub fn parse_log_number(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    match parse_file_name(name)? {
        FileKind::WriteAheadLog(n) | FileKind::Manifest(n) => Some(n),
        _ => None,
    }
}
