//! In-memory filesystem double for unit and property tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{BoxFuture, FileSystemAdapter, WatchEvent, is_flagged_path, with_incomplete_flag};
use crate::error::Result;
use crate::fs::FLAG_COMPLETE;

#[derive(Default)]
struct Inner {
    files: HashMap<PathBuf, Vec<u8>>,
    dirs: HashSet<PathBuf>,
    mtimes_ms: HashMap<PathBuf, i64>,
    clock_ms: i64,
    watchers: Vec<(PathBuf, mpsc::UnboundedSender<WatchEvent>)>,
}

/// [`FileSystemAdapter`] backed by an in-memory map.
///
/// Useful both for fast unit tests and for deliberately constructing
/// crash states (see [`MemoryFsAdapter::write_raw`]) that a real filesystem
/// would only produce via a badly-timed power loss.
#[derive(Clone, Default)]
pub struct MemoryFsAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryFsAdapter {
    /// Create an empty in-memory adapter.
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(inner: &mut Inner, path: &Path) {
        inner.clock_ms += 1;
        let ms = inner.clock_ms;
        inner.mtimes_ms.insert(path.to_path_buf(), ms);
        for p in ancestors_to_create(path) {
            inner.dirs.insert(p);
        }
    }

    fn notify(inner: &Inner, event: WatchEvent) {
        let path = match &event {
            WatchEvent::Add(p) | WatchEvent::Change(p) | WatchEvent::Unlink(p) => p,
        };
        for (dir, tx) in &inner.watchers {
            if path.starts_with(dir) {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Write bytes to `path` exactly as given, bypassing the flag-byte
    /// writer sequence. Used by tests to simulate a crash mid-write (S1).
    pub fn write_raw(&self, path: &Path, raw: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.files.contains_key(path);
        inner.files.insert(path.to_path_buf(), raw.to_vec());
        Self::touch(&mut inner, path);
        let event = if existed {
            WatchEvent::Change(path.to_path_buf())
        } else {
            WatchEvent::Add(path.to_path_buf())
        };
        Self::notify(&inner, event);
    }
}

fn ancestors_to_create(path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut cur = path.parent();
    while let Some(p) = cur {
        if p.as_os_str().is_empty() {
            break;
        }
        out.push(p.to_path_buf());
        cur = p.parent();
    }
    out
}

impl FileSystemAdapter for MemoryFsAdapter {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            inner.files.contains_key(path) || inner.dirs.contains(path)
        })
    }

    fn mkdir_recursive<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.dirs.insert(path.to_path_buf());
            for p in ancestors_to_create(&path.join("_")) {
                inner.dirs.insert(p);
            }
            Ok(())
        })
    }

    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            let raw = inner
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| crate::error::SdError::NotFound(path.display().to_string()))?;
            if is_flagged_path(path) {
                super::strip_flag_byte(path, &raw)
            } else {
                Ok(raw)
            }
        })
    }

    fn read_file_raw<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            inner
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| crate::error::SdError::NotFound(path.display().to_string()))
        })
    }

    fn write_file<'a>(&'a self, path: &'a Path, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = if is_flagged_path(path) {
                let mut flagged = with_incomplete_flag(bytes);
                flagged[0] = FLAG_COMPLETE;
                flagged
            } else {
                bytes.to_vec()
            };
            let mut inner = self.inner.lock().unwrap();
            let existed = inner.files.contains_key(path);
            inner.files.insert(path.to_path_buf(), payload);
            Self::touch(&mut inner, path);
            let event = if existed {
                WatchEvent::Change(path.to_path_buf())
            } else {
                WatchEvent::Add(path.to_path_buf())
            };
            Self::notify(&inner, event);
            Ok(())
        })
    }

    fn append_file<'a>(&'a self, path: &'a Path, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            let existed = inner.files.contains_key(path);
            inner.files.entry(path.to_path_buf()).or_default().extend_from_slice(bytes);
            Self::touch(&mut inner, path);
            let event = if existed {
                WatchEvent::Change(path.to_path_buf())
            } else {
                WatchEvent::Add(path.to_path_buf())
            };
            Self::notify(&inner, event);
            Ok(())
        })
    }

    fn delete_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.files.remove(path);
            Self::notify(&inner, WatchEvent::Unlink(path.to_path_buf()));
            Ok(())
        })
    }

    fn list_dir<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            // Entries may sit directly under `dir` (a file) or several levels
            // deeper (a file under a subdirectory); either way the caller
            // wants the immediate child's name, matching `std::fs::read_dir`
            // semantics on the native adapter.
            let immediate_child = |p: &Path| -> Option<String> {
                let rel = p.strip_prefix(dir).ok()?;
                let first = rel.components().next()?;
                match first {
                    std::path::Component::Normal(name) => name.to_str().map(String::from),
                    _ => None,
                }
            };
            let mut names: Vec<String> = inner
                .files
                .keys()
                .filter_map(|p| immediate_child(p))
                .chain(inner.dirs.iter().filter_map(|p| immediate_child(p)))
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        })
    }

    fn stat_mtime_ms<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            inner.mtimes_ms.get(path).copied()
        })
    }

    fn watch(&self, dir: &Path) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.watchers.push((dir.to_path_buf(), tx));
        Ok(rx)
    }
}
