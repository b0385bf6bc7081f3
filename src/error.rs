//! Filesystem error taxonomy.

use thiserror::Error;

/// Filesystem errors.
///
/// Corruption detected at mount is fatal; corruption detected at runtime
/// aborts the operation without flagging the filesystem. Checksum failures
/// on reads surface as `Io` to the caller without any repair attempt.
#[derive(Debug, Error)]
pub enum FsError {
    /// Device or buffer read/write failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Magic/CRC mismatch or an out-of-range metadata field.
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// Bitmap full on allocation.
    #[error("no space left on device")]
    NoSpace,

    /// Pool/workspace/buffer allocation failure.
    #[error("out of memory")]
    NoMemory,

    /// Malformed request (oversized write, unknown mount option).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Write attempted on a read-only device.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Cluster already under writeback; caller should retry after yielding.
    #[error("resource busy")]
    Busy,

    /// Path or directory entry not found.
    #[error("not found")]
    NotFound,

    /// Directory entry already exists.
    #[error("already exists")]
    AlreadyExists,
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(err.to_string())
    }
}

pub type Result<T> = core::result::Result<T, FsError>;
