//! Unified error type for the storage-directory engine.
//!
//! Every component in this crate returns [`Result<T>`] so that the taxonomy
//! stays consistent from [`crate::fs`] all the way up to [`crate::coordinator`].

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for SD storage and synchronization operations.
#[derive(Debug, Error)]
pub enum SdError {
    /// Catch-all for the underlying filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An id/path that was expected to exist does not.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A `.yjson`-class file's flag byte is `0x00` (writer still in progress).
    #[error("Incomplete write at '{path}'")]
    Incomplete {
        /// Path of the file whose flag byte marks it incomplete.
        path: PathBuf,
    },

    /// Bad magic, bad flag byte, or a truncated record. Never silently dropped.
    #[error("Corrupt data at '{path}' (offset {offset}): {message}")]
    Corrupt {
        /// Path of the corrupt file.
        path: PathBuf,
        /// Byte offset at which corruption was detected.
        offset: u64,
        /// Human-readable description of the corruption.
        message: String,
    },

    /// The SD's on-disk format is too new or too old for this build.
    #[error("SD version mismatch at '{path}': {reason}")]
    VersionMismatch {
        /// Path to the SD root.
        path: PathBuf,
        /// `"too-new"` or `"too-old"`.
        reason: String,
    },

    /// A `.migration-lock` file is present; another instance is migrating.
    #[error("SD locked for migration at '{0}'")]
    Locked(PathBuf),

    /// A move or rename target already exists.
    #[error("Conflict: '{0}' already exists")]
    Conflict(String),

    /// An expected CRDT log sequence has not appeared yet; retryable.
    #[error("Sequence gap for '{note_id}': expected {expected}, have {have}")]
    SequenceGap {
        /// Note the gap was observed for.
        note_id: String,
        /// Sequence the peer claimed to have written.
        expected: u64,
        /// Highest sequence actually visible on disk.
        have: u64,
    },

    /// The polling group's token bucket refused this request; wait and retry.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// An invariant was violated; indicates a bug, not a transient condition.
    #[error("Internal error: {0}")]
    Internal(String),

    /// SQLite error from the metadata cache.
    #[error("Metadata cache error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// JSON (de)serialization error (profiles, deletion log, move state).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, SdError>;

/// A serializable projection of [`SdError`] for crossing an IPC boundary.
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name, matching the §7 taxonomy.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Associated path, if any.
    pub path: Option<PathBuf>,
}

impl From<&SdError> for SerializableError {
    fn from(err: &SdError) -> Self {
        let kind = match err {
            SdError::Io(_) => "IoError",
            SdError::NotFound(_) => "NotFound",
            SdError::Incomplete { .. } => "Incomplete",
            SdError::Corrupt { .. } => "Corrupt",
            SdError::VersionMismatch { .. } => "VersionMismatch",
            SdError::Locked(_) => "Locked",
            SdError::Conflict(_) => "Conflict",
            SdError::SequenceGap { .. } => "SequenceGap",
            SdError::RateLimited(_) => "RateLimited",
            SdError::Internal(_) => "Internal",
            SdError::Sql(_) => "IoError",
            SdError::Json(_) => "IoError",
        }
        .to_string();

        let path = match err {
            SdError::Incomplete { path } => Some(path.clone()),
            SdError::Corrupt { path, .. } => Some(path.clone()),
            SdError::VersionMismatch { path, .. } => Some(path.clone()),
            SdError::Locked(path) => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<SdError> for SerializableError {
    fn from(err: SdError) -> Self {
        SerializableError::from(&err)
    }
}

impl SdError {
    /// Convert to a serializable representation for diagnostics/IPC.
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }

    /// Whether this error is worth retrying with backoff (disk read failures,
    /// transient IO, sequence gaps) per the §7 propagation policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SdError::Incomplete { .. } | SdError::SequenceGap { .. } | SdError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_carries_path_and_offset() {
        let err = SdError::Corrupt {
            path: PathBuf::from("notes/n1/logs/i_1.crdtlog"),
            offset: 42,
            message: "bad magic".into(),
        };
        let s = err.to_serializable();
        assert_eq!(s.kind, "Corrupt");
        assert_eq!(s.path, Some(PathBuf::from("notes/n1/logs/i_1.crdtlog")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn incomplete_and_sequence_gap_are_retryable() {
        let a = SdError::Incomplete {
            path: PathBuf::from("x"),
        };
        let b = SdError::SequenceGap {
            note_id: "n1".into(),
            expected: 5,
            have: 3,
        };
        assert!(a.is_retryable());
        assert!(b.is_retryable());
    }
}
