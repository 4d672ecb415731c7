use std::io;
use std::path::PathBuf;
use std::result;

use thiserror::Error;

/// Custom result type for store operations
pub type Result<T> = result::Result<T, Error>;

/// Store error codes
#[derive(Debug, Error)]
pub enum Error {
    /// A required argument was empty or out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation issued before `start()` or after `stop()`
    #[error("Store is not started")]
    NotStarted,
    /// `start()` called on a running store
    #[error("Store is already started")]
    AlreadyStarted,
    /// Store flags cannot be modified
    #[error("Store flags cannot be modified")]
    FlagsImmutable,
    /// Chunk needs more entries than a content map can ever hold
    #[error("Chunk needs {needed} entries, content maps hold fewer than {max_entries}")]
    ChunkTooLarge { needed: u64, max_entries: u64 },
    /// Bounded map has no free slot or cell run left
    #[error("Bounded map is full: {0}")]
    MapFull(PathBuf),
    /// Expected entry is missing from a map
    #[error("Missing entry: {0}")]
    MissingEntry(String),
    /// Stored data failed validation
    #[error("Corrupted data: {0}")]
    Corrupted(String),
    /// File is not a valid bounded map file
    #[error("File is not a valid bounded map file: {0}")]
    InvalidFile(PathBuf),
    /// Bounded map file version mismatch
    #[error("Bounded map version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    /// Item serializer failed
    #[error("Serialization failed: {0}")]
    Serialization(String),
    /// File deletion retries exhausted
    #[error("Failed to delete {path:?} after {attempts} attempts")]
    DeleteFailed { path: PathBuf, attempts: u32 },
    /// Background worker is gone
    #[error("Background worker stopped")]
    WorkerStopped,
    /// A lock was poisoned by a panicking thread
    #[error("Lock poisoned")]
    LockPoisoned,
    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Error {
        Error::LockPoisoned
    }
}
