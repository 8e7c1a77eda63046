//! Filesystem abstraction with the flag-byte readiness protocol.
//!
//! This module defines [`FileSystemAdapter`], a capability interface selected
//! at Coordinator construction (native disk I/O vs. an in-memory double for
//! tests), and the flag-byte protocol that every CRDT data file goes through
//! so that partially cloud-synced files never return garbage to a reader.

mod memory;
mod native;

pub use memory::MemoryFsAdapter;
pub use native::NativeFsAdapter;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::error::{Result, SdError};

/// A boxed future for object-safe async methods on [`FileSystemAdapter`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Leading byte meaning "writer still in progress".
pub const FLAG_INCOMPLETE: u8 = 0x00;
/// Leading byte meaning "payload is complete and safe to read".
pub const FLAG_COMPLETE: u8 = 0x01;

/// A single filesystem-watch event, delivered with just the basename per §4.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file was created.
    Add(PathBuf),
    /// A file's contents changed.
    Change(PathBuf),
    /// A file was removed.
    Unlink(PathBuf),
}

/// Capability interface for low-level file I/O.
///
/// On `.yjson`-class paths (see [`is_flagged_path`]) `write_file`/`read_file`
/// transparently apply/strip the flag byte; on any other path the adapter is
/// pass-through. Two implementations ship with this crate:
/// [`NativeFsAdapter`] (std::fs + `notify`) and [`MemoryFsAdapter`] (tests).
/// A third "MobileAdapter" variant is anticipated for a future mobile host
/// but not implemented here — no mobile host exists in this engine's scope.
pub trait FileSystemAdapter: Send + Sync {
    /// Whether a path exists (file or directory).
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool>;

    /// Create a directory and all missing parents.
    fn mkdir_recursive<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// Read the full contents of a file. On a flagged path this applies the
    /// flag-byte protocol: `Incomplete` if byte 0 is `0x00`, `Corrupt` if it
    /// is anything other than `0x00`/`0x01`, else the payload with the flag
    /// byte stripped.
    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Read a file's bytes exactly as stored, bypassing the flag-byte
    /// protocol even on a flagged path. Used only by [`crate::sd_version`]'s
    /// v0-to-v1 migration, which must read pre-flag-byte files that predate
    /// the protocol entirely.
    fn read_file_raw<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Atomically (per the flag-byte protocol) write a file's full contents.
    /// Creates missing parent directories and tolerates the destination
    /// already existing.
    fn write_file<'a>(&'a self, path: &'a Path, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Append bytes to a file, creating it if absent. Used by append-only
    /// logs; callers are responsible for the flag-byte framing of the file
    /// as a whole (see [`crate::codec::log_codec`]).
    fn append_file<'a>(&'a self, path: &'a Path, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Delete a file. Not an error if the file is already absent.
    fn delete_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// List the basenames of entries directly inside a directory. Returns an
    /// empty vector for a missing directory.
    fn list_dir<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Modification time, in epoch milliseconds, or `None` if the path is
    /// missing or mtime is unavailable.
    fn stat_mtime_ms<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Option<i64>>;

    /// Subscribe to add/change/unlink events under a directory (recursive).
    /// `add` events for files that existed before the watch started are
    /// suppressed.
    fn watch(&self, dir: &Path) -> Result<tokio::sync::mpsc::UnboundedReceiver<WatchEvent>>;
}

/// Whether `path` is a CRDT data path subject to the flag-byte protocol.
///
/// Per §3, any path under `notes/`, `folders/`, or `media/` that uses the
/// logical `.yjson`-class data suffix is flagged. This crate's concrete
/// suffixes are `.crdtlog`, `.crdtsnapshot`, and any `media/<id>.<ext>` file.
pub fn is_flagged_path(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if name.ends_with(".crdtlog") || name.ends_with(".crdtsnapshot") {
        return true;
    }
    // media/<imageId>.<ext>: flagged if the parent directory is named "media".
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        == Some("media")
}

/// Strip the leading flag byte from raw bytes read off disk, enforcing the
/// §3 reader contract. `path` is only used to build error messages.
pub fn strip_flag_byte(path: &Path, raw: &[u8]) -> Result<Vec<u8>> {
    match raw.first() {
        None => Err(SdError::Corrupt {
            path: path.to_path_buf(),
            offset: 0,
            message: "empty flagged file".to_string(),
        }),
        Some(&FLAG_INCOMPLETE) => Err(SdError::Incomplete {
            path: path.to_path_buf(),
        }),
        Some(&FLAG_COMPLETE) => Ok(raw[1..].to_vec()),
        Some(other) => Err(SdError::Corrupt {
            path: path.to_path_buf(),
            offset: 0,
            message: format!("invalid flag byte 0x{other:02x}"),
        }),
    }
}

/// Prepend the "incomplete" flag byte ahead of a payload for the first write.
pub fn with_incomplete_flag(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(FLAG_INCOMPLETE);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flagged_paths() {
        assert!(is_flagged_path(Path::new("sd/notes/n1/logs/a_1.crdtlog")));
        assert!(is_flagged_path(Path::new(
            "sd/notes/n1/snapshots/1.crdtsnapshot"
        )));
        assert!(is_flagged_path(Path::new("sd/media/abcd.png")));
        assert!(!is_flagged_path(Path::new("sd/SD_VERSION")));
        assert!(!is_flagged_path(Path::new("sd/activity/a.log")));
    }

    #[test]
    fn strip_flag_byte_variants() {
        let p = Path::new("x.crdtlog");
        assert!(matches!(
            strip_flag_byte(p, &[0x00, 1, 2]),
            Err(SdError::Incomplete { .. })
        ));
        assert!(matches!(
            strip_flag_byte(p, &[0x02, 1, 2]),
            Err(SdError::Corrupt { .. })
        ));
        assert_eq!(strip_flag_byte(p, &[0x01, 1, 2]).unwrap(), vec![1, 2]);
        assert!(matches!(
            strip_flag_byte(p, &[]),
            Err(SdError::Corrupt { .. })
        ));
    }
}
