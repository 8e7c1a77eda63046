//! Native filesystem implementation: std::fs for I/O, `notify` for watching.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::{BoxFuture, FLAG_COMPLETE, FLAG_INCOMPLETE, FileSystemAdapter, WatchEvent, is_flagged_path};
use crate::error::{Result, SdError};

/// [`FileSystemAdapter`] backed by the real filesystem.
///
/// All blocking I/O runs on `tokio::task::spawn_blocking`, keeping the
/// Coordinator's single-threaded event loop free of syscalls (§5).
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeFsAdapter;

impl NativeFsAdapter {
    /// Construct a new native adapter.
    pub fn new() -> Self {
        Self
    }
}

fn io_err_to_sd(e: std::io::Error) -> SdError {
    SdError::Io(e)
}

/// Perform the flag-byte writer sequence: write `0x00 | payload`, fsync,
/// flip byte 0 to `0x01`, fsync. See §3 "Flag-byte protocol".
fn write_flagged(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&[FLAG_INCOMPLETE])?;
    file.write_all(payload)?;
    file.sync_all()?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&[FLAG_COMPLETE])?;
    file.sync_all()?;
    Ok(())
}

fn write_plain(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, payload)
}

fn read_raw(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

impl FileSystemAdapter for NativeFsAdapter {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
        let path = path.to_path_buf();
        Box::pin(async move { tokio::task::spawn_blocking(move || path.exists()).await.unwrap_or(false) })
    }

    fn mkdir_recursive<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || fs::create_dir_all(&path).map_err(io_err_to_sd))
                .await
                .map_err(|e| SdError::Internal(e.to_string()))?
        })
    }

    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        let flagged = is_flagged_path(path);
        let path = path.to_path_buf();
        Box::pin(async move {
            let path_for_err = path.clone();
            let raw = tokio::task::spawn_blocking(move || read_raw(&path))
                .await
                .map_err(|e| SdError::Internal(e.to_string()))?
                .map_err(io_err_to_sd)?;
            if flagged {
                super::strip_flag_byte(&path_for_err, &raw)
            } else {
                Ok(raw)
            }
        })
    }

    fn read_file_raw<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || read_raw(&path))
                .await
                .map_err(|e| SdError::Internal(e.to_string()))?
                .map_err(io_err_to_sd)
        })
    }

    fn write_file<'a>(&'a self, path: &'a Path, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        let flagged = is_flagged_path(path);
        let path = path.to_path_buf();
        let bytes = bytes.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                if flagged {
                    write_flagged(&path, &bytes)
                } else {
                    write_plain(&path, &bytes)
                }
                .map_err(io_err_to_sd)
            })
            .await
            .map_err(|e| SdError::Internal(e.to_string()))?
        })
    }

    fn append_file<'a>(&'a self, path: &'a Path, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        let path = path.to_path_buf();
        let bytes = bytes.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
                file.write_all(&bytes)?;
                file.sync_all()
            })
            .await
            .map_err(|e| SdError::Internal(e.to_string()))?
            .map_err(io_err_to_sd)
        })
    }

    fn delete_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err_to_sd(e)),
            })
            .await
            .map_err(|e| SdError::Internal(e.to_string()))?
        })
    }

    fn list_dir<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<String>>> {
        let dir = dir.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                if !dir.is_dir() {
                    return Ok(Vec::new());
                }
                let mut names = Vec::new();
                for entry in fs::read_dir(&dir).map_err(io_err_to_sd)? {
                    let entry = entry.map_err(io_err_to_sd)?;
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
                Ok(names)
            })
            .await
            .map_err(|e| SdError::Internal(e.to_string()))?
        })
    }

    fn stat_mtime_ms<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Option<i64>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                fs::metadata(&path).ok().and_then(|m| m.modified().ok()).and_then(|t| {
                    t.duration_since(std::time::UNIX_EPOCH)
                        .ok()
                        .map(|d| d.as_millis() as i64)
                })
            })
            .await
            .unwrap_or(None)
        })
    }

    fn watch(&self, dir: &Path) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = std_mpsc::channel();

        // Snapshot of what already exists, so startup doesn't emit spurious Add events.
        let mut known: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
        if let Ok(entries) = walk_all(dir) {
            known.extend(entries);
        }

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        })
        .map_err(|e| SdError::Internal(format!("failed to start watcher: {e}")))?;
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .map_err(|e| SdError::Internal(format!("failed to watch '{}': {e}", dir.display())))?;

        std::thread::spawn(move || {
            // Keep the watcher alive for the life of this thread.
            let _watcher = watcher;
            for event in raw_rx {
                for path in event.paths {
                    let mapped = match event.kind {
                        EventKind::Create(_) => {
                            if known.contains(&path) {
                                continue;
                            }
                            known.insert(path.clone());
                            Some(WatchEvent::Add(path))
                        }
                        EventKind::Modify(_) => Some(WatchEvent::Change(path)),
                        EventKind::Remove(_) => {
                            known.remove(&path);
                            Some(WatchEvent::Unlink(path))
                        }
                        _ => None,
                    };
                    if let Some(ev) = mapped
                        && tx.send(ev).is_err()
                    {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn walk_all(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        out.push(path.clone());
        if path.is_dir() {
            out.extend(walk_all(&path)?);
        }
    }
    Ok(out)
}
