//! Error taxonomy for the container patch engine.
//!
//! A failure that leaves a container in an unknown state stops its batch
//! (see [`PatchError::is_fatal`]). Everything else rejects a single request
//! and the batch carries on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type PatchResult<T> = Result<T, PatchError>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Could not open container {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not read complete header at offset {offset:#x}")]
    TruncatedHeader { offset: u64 },

    #[error("Read failed while scanning: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Cache file has no header line")]
    MissingHeaderLine,

    #[error("Record {record}: field `{field}` is not terminated by a comma")]
    UnterminatedField { record: usize, field: &'static str },

    #[error("Record {record}: invalid index `{value}`")]
    InvalidIndex { record: usize, value: String },

    #[error("Record {record}: offset `{value}` does not start with 0x")]
    MissingHexPrefix { record: usize, value: String },

    #[error("Record {record}: invalid offset `{value}`")]
    InvalidOffset { record: usize, value: String },

    #[error("Record {record}: header snapshot is truncated")]
    TruncatedHeader { record: usize },

    #[error("Record {record}: unexpected byte {byte:#04x} after header snapshot")]
    UnexpectedByte { record: usize, byte: u8 },
}

#[derive(Debug, Error)]
pub enum ConstraintViolation {
    #[error("\"{name}\" has no matching index in the dictionary")]
    Unmatched { name: String },

    #[error("Index {index} is protected and cannot be replaced")]
    Banned { index: u32 },

    #[error("Index {index} has already been queued in this batch")]
    Duplicate { index: u32 },

    #[error("Target file for index {index} not found: {}", .target.display())]
    MissingTarget { index: u32, target: PathBuf },

    #[error("No companion .uasset/.acb found for {}", .target.display())]
    MissingCompanion { target: PathBuf },

    #[error("No segment with index {index} in {}", .container.display())]
    NoSegment { index: u32, container: PathBuf },

    #[error("Could not read replacement {}: {reason}", .source_path.display())]
    SourceUnreadable { source_path: PathBuf, reason: String },

    #[error(
        "Replacement {} ({len} bytes) does not start with an HCA header",
        .source_path.display()
    )]
    NotATrack { source_path: PathBuf, len: usize },
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),

    #[error(
        "Replacement for index {index} is {replacement} bytes, larger than the original {original} bytes"
    )]
    Size {
        index: u32,
        original: u64,
        replacement: u64,
    },

    #[error("{} is corrupted ({reason}); restore it from its .bak backup", .path.display())]
    Shift { path: PathBuf, reason: String },

    #[error("Could not locate {what} in {}; restore it from its .bak backup", .path.display())]
    TableLocate { path: PathBuf, what: String },

    #[error("Could not back up {}: {source}", .path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PatchError {
    pub fn shift(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        PatchError::Shift {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn table_locate(path: impl Into<PathBuf>, what: impl Into<String>) -> Self {
        PatchError::TableLocate {
            path: path.into(),
            what: what.into(),
        }
    }

    /// Whether the error aborts the whole container batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PatchError::Scan(_)
                | PatchError::Shift { .. }
                | PatchError::TableLocate { .. }
                | PatchError::Backup { .. }
        )
    }
}
