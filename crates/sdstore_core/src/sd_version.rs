//! SD format version, compatibility checks, and the v0→v1 migration (§4.12).
//!
//! The version file is a plain-text integer at `<SD>/SD_VERSION`. A missing
//! file means version `0` (pre-flag-byte-protocol). A `.migration-lock` file
//! blocks access while another instance migrates.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};
use crate::fs::FileSystemAdapter;

/// Current SD format version this build understands.
pub const CURRENT_VERSION: u32 = 1;

const VERSION_FILE: &str = "SD_VERSION";
const LOCK_FILE: &str = ".migration-lock";

/// Result of [`check_sd_version`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    /// Whether this build can mount the SD as-is.
    pub compatible: bool,
    /// `"too-new"`, `"too-old"`, or `"locked"` when `compatible` is `false`.
    pub reason: Option<String>,
    /// The version found on disk (`0` if `SD_VERSION` is missing).
    pub found_version: u32,
}

/// Contents of `.migration-lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationLock {
    /// Epoch milliseconds the migration started.
    pub timestamp: i64,
    /// PID of the migrating process, for diagnostics.
    pub pid: u32,
}

fn version_path(sd_path: &Path) -> PathBuf {
    sd_path.join(VERSION_FILE)
}

fn lock_path(sd_path: &Path) -> PathBuf {
    sd_path.join(LOCK_FILE)
}

/// Read the SD's on-disk version, or `0` if `SD_VERSION` is absent.
pub async fn read_version(fs: &dyn FileSystemAdapter, sd_path: &Path) -> Result<u32> {
    let path = version_path(sd_path);
    if !fs.exists(&path).await {
        return Ok(0);
    }
    let bytes = fs.read_file(&path).await?;
    let text = String::from_utf8_lossy(&bytes);
    text.trim().parse::<u32>().map_err(|_| {
        SdError::Corrupt {
            path: path.clone(),
            offset: 0,
            message: format!("SD_VERSION is not an integer: {text:?}"),
        }
    })
}

/// Check whether this build can mount the SD at `sd_path`.
///
/// A `.migration-lock` file takes priority over a version mismatch: another
/// instance is actively migrating and callers must wait or surface `Locked`.
pub async fn check_sd_version(fs: &dyn FileSystemAdapter, sd_path: &Path) -> Result<VersionCheck> {
    if fs.exists(&lock_path(sd_path)).await {
        return Ok(VersionCheck {
            compatible: false,
            reason: Some("locked".to_string()),
            found_version: read_version(fs, sd_path).await.unwrap_or(0),
        });
    }

    let found = read_version(fs, sd_path).await?;
    if found > CURRENT_VERSION {
        return Ok(VersionCheck {
            compatible: false,
            reason: Some("too-new".to_string()),
            found_version: found,
        });
    }
    if found < CURRENT_VERSION {
        return Ok(VersionCheck {
            compatible: false,
            reason: Some("too-old".to_string()),
            found_version: found,
        });
    }
    Ok(VersionCheck {
        compatible: true,
        reason: None,
        found_version: found,
    })
}

/// Migrate `sd_path` forward to [`CURRENT_VERSION`], acquiring the
/// migration lock for the duration. Idempotent: an SD already at
/// `CURRENT_VERSION` returns immediately without touching the lock file.
pub async fn migrate(fs: &dyn FileSystemAdapter, sd_path: &Path, now_ms: i64) -> Result<u32> {
    let found = read_version(fs, sd_path).await?;
    if found >= CURRENT_VERSION {
        return Ok(found);
    }
    if fs.exists(&lock_path(sd_path)).await {
        return Err(SdError::Locked(sd_path.to_path_buf()));
    }

    let lock = MigrationLock {
        timestamp: now_ms,
        pid: std::process::id(),
    };
    fs.write_file(&lock_path(sd_path), &serde_json::to_vec(&lock)?).await?;

    let mut version = found;
    if version == 0 {
        migrate_v0_to_v1(fs, sd_path).await?;
        version = 1;
    }

    fs.write_file(&version_path(sd_path), format!("{version}\n").as_bytes()).await?;
    fs.delete_file(&lock_path(sd_path)).await?;
    Ok(version)
}

/// v0→v1: every `.yjson`-class file predates the flag-byte protocol and is
/// stored as a raw payload. Re-writing each one through [`FileSystemAdapter::write_file`]
/// applies the flag-byte writer sequence, leaving the payload itself
/// untouched (re-reading through the adapter yields identical bytes to the
/// pre-migration content, per §8 scenario S7).
async fn migrate_v0_to_v1(fs: &dyn FileSystemAdapter, sd_path: &Path) -> Result<()> {
    for path in flagged_paths(fs, sd_path).await? {
        let raw = fs.read_file_raw(&path).await?;
        fs.write_file(&path, &raw).await?;
    }
    Ok(())
}

/// Enumerate every path under `notes/`, `folders/`, and `media/` subject to
/// the flag-byte protocol.
async fn flagged_paths(fs: &dyn FileSystemAdapter, sd_path: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();

    let notes_dir = sd_path.join("notes");
    for note_id in fs.list_dir(&notes_dir).await? {
        let note_dir = notes_dir.join(&note_id);
        for sub in ["logs", "snapshots"] {
            let dir = note_dir.join(sub);
            for name in fs.list_dir(&dir).await? {
                out.push(dir.join(name));
            }
        }
    }

    let folders_dir = sd_path.join("folders");
    for sub in ["logs", "snapshots"] {
        let dir = folders_dir.join(sub);
        for name in fs.list_dir(&dir).await? {
            out.push(dir.join(name));
        }
    }

    let media_dir = sd_path.join("media");
    for name in fs.list_dir(&media_dir).await? {
        out.push(media_dir.join(name));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFsAdapter;
    use std::sync::Arc;

    #[tokio::test]
    async fn missing_version_file_reads_as_zero_and_is_too_old() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd = PathBuf::from("/sd");
        let check = check_sd_version(fs.as_ref(), &sd).await.unwrap();
        assert!(!check.compatible);
        assert_eq!(check.reason.as_deref(), Some("too-old"));
        assert_eq!(check.found_version, 0);
    }

    #[tokio::test]
    async fn future_version_is_too_new() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd = PathBuf::from("/sd");
        fs.write_file(&version_path(&sd), b"99\n").await.unwrap();
        let check = check_sd_version(fs.as_ref(), &sd).await.unwrap();
        assert!(!check.compatible);
        assert_eq!(check.reason.as_deref(), Some("too-new"));
    }

    #[tokio::test]
    async fn lock_file_takes_priority_and_reports_locked() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd = PathBuf::from("/sd");
        fs.write_file(&lock_path(&sd), b"{}").await.unwrap();
        let check = check_sd_version(fs.as_ref(), &sd).await.unwrap();
        assert!(!check.compatible);
        assert_eq!(check.reason.as_deref(), Some("locked"));
    }

    #[tokio::test]
    async fn s7_migration_prepends_flag_byte_and_preserves_payload() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd = PathBuf::from("/sd");
        let log_path = sd.join("notes").join("n1").join("logs").join("a_1.crdtlog");
        fs.write_raw(&log_path, b"NCLGraw-payload-bytes");

        migrate(fs.as_ref(), &sd, 1000).await.unwrap();

        assert_eq!(read_version(fs.as_ref(), &sd).await.unwrap(), 1);
        assert!(!fs.exists(&lock_path(&sd)).await);

        let round_tripped = fs.read_file(&log_path).await.unwrap();
        assert_eq!(round_tripped, b"NCLGraw-payload-bytes");
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd = PathBuf::from("/sd");
        let log_path = sd.join("notes").join("n1").join("logs").join("a_1.crdtlog");
        fs.write_raw(&log_path, b"NCLGdata");

        migrate(fs.as_ref(), &sd, 1000).await.unwrap();
        let after_first = fs.read_file(&log_path).await.unwrap();

        let version = migrate(fs.as_ref(), &sd, 2000).await.unwrap();
        assert_eq!(version, 1);
        let after_second = fs.read_file(&log_path).await.unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn migrating_a_locked_sd_fails() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let sd = PathBuf::from("/sd");
        fs.write_file(&lock_path(&sd), b"{}").await.unwrap();
        let err = migrate(fs.as_ref(), &sd, 1000).await.unwrap_err();
        assert!(matches!(err, SdError::Locked(_)));
    }
}
